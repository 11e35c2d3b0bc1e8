//! HTTP plumbing underneath the device accessor.
//!
//! The accessor only needs two verbs against paths relative to the device root,
//! so the transport is a small trait. [`HttpTransport`] talks to a real device;
//! tests substitute an in-memory device.

use crate::error::Result;
use tracing::debug;

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub body: String,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request/response channel to the device's web server.
///
/// Paths start with `/` and may carry a query string. Implementations return a
/// [`Reply`] for any HTTP status; only failures to exchange a request at all are
/// errors here.
#[allow(async_fn_in_trait)]
pub trait Transport {
    async fn get(&self, path: &str) -> Result<Reply>;
    async fn post(&self, path: &str) -> Result<Reply>;
}

/// `reqwest` based transport for a device at `http://{addr}`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(addr: &str) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", addr.trim_end_matches('/'))
        };
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn into_reply(response: reqwest::Response) -> Result<Reply> {
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(Reply { status, body })
    }
}

impl Transport for HttpTransport {
    async fn get(&self, path: &str) -> Result<Reply> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "GET");
        let response = self.client.get(&url).send().await?;
        Self::into_reply(response).await
    }

    async fn post(&self, path: &str) -> Result<Reply> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");
        let response = self.client.post(&url).send().await?;
        Self::into_reply(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url() {
        assert_eq!(HttpTransport::new("192.168.1.50").unwrap().base_url(), "http://192.168.1.50");
        assert_eq!(HttpTransport::new("http://smu.local/").unwrap().base_url(), "http://smu.local");
    }

    #[test]
    fn test_reply_success_range() {
        let ok = Reply { status: 204, body: String::new() };
        let missing = Reply { status: 404, body: String::new() };
        assert!(ok.is_success());
        assert!(!missing.is_success());
    }
}

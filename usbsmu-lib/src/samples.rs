//! Incremental reader for the device's sample log.
//!
//! `GET /samples` returns the current write position. `GET /samples?start=N`
//! returns every sample logged since position `N`, one `millis,source,value`
//! line each, followed by a final line holding the new position:
//!
//! ```text
//! 1200,V,5.002
//! 1200,A,0.101
//! 25
//! ```

use crate::codec::{parse_decimal, parse_integral};
use crate::constants::SAMPLES_PATH;
use crate::error::{Result, SmuError};
use crate::transport::Transport;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

/// Tokens the firmware prints for a float without a finite value.
const NON_FINITE: [&str; 6] = ["nan", "inf", "-inf", "+inf", "infinity", "ovf"];

fn is_non_finite(token: &str) -> bool {
    NON_FINITE.iter().any(|t| t.eq_ignore_ascii_case(token))
}

/// One logged reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleRecord {
    /// Device uptime in milliseconds when the reading was taken.
    pub millis: u64,
    /// Source tag, e.g. `V` or `A`.
    pub source: String,
    /// `None` when the device had no finite reading (`nan`, `inf`, `ovf`).
    pub value: Option<Decimal>,
}

impl SampleRecord {
    pub fn parse(line: &str) -> Result<Self> {
        let mut fields = line.trim().splitn(3, ',');
        let (Some(millis), Some(source), Some(value)) = (fields.next(), fields.next(), fields.next()) else {
            return Err(SmuError::decode(format!("malformed sample line '{line}'")));
        };
        let value = value.trim();
        let value = if is_non_finite(value) {
            None
        } else {
            Some(parse_decimal(value)?)
        };
        Ok(Self {
            millis: parse_integral(millis)?,
            source: source.trim().to_string(),
            value,
        })
    }
}

/// Stateful reader that returns each logged sample exactly once.
///
/// The first call to [`SampleBuffer::get`] only records the current log
/// position and yields nothing; later calls yield what was logged in between.
pub struct SampleBuffer<'a, T> {
    transport: &'a T,
    cursor: Option<u64>,
}

impl<'a, T: Transport> SampleBuffer<'a, T> {
    pub fn new(transport: &'a T) -> Self {
        Self { transport, cursor: None }
    }

    /// Position of the next unread sample, once known.
    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Fetch the samples logged since the previous call.
    ///
    /// On any error the cursor is left unchanged, so the next call retries the
    /// same window.
    pub async fn get(&mut self) -> Result<Vec<SampleRecord>> {
        let path = match self.cursor {
            None => SAMPLES_PATH.to_string(),
            Some(cursor) => format!("{SAMPLES_PATH}?start={cursor}"),
        };
        let reply = self.transport.get(&path).await?;
        if !reply.is_success() {
            return Err(SmuError::Http {
                status: reply.status,
                path,
            });
        }

        let (records, next) = match self.cursor {
            None => (Vec::new(), parse_cursor(reply.body.trim())?),
            Some(_) => parse_window(&reply.body)?,
        };
        if let Some(previous) = self.cursor.filter(|&previous| next < previous) {
            return Err(SmuError::decode(format!("sample cursor went backwards from {previous} to {next}")));
        }

        debug!(cursor = next, samples = records.len(), "Read sample window");
        self.cursor = Some(next);
        Ok(records)
    }
}

fn parse_cursor(line: &str) -> Result<u64> {
    if line.is_empty() {
        return Err(SmuError::decode("sample response has no cursor"));
    }
    parse_integral(line)
}

fn parse_window(body: &str) -> Result<(Vec<SampleRecord>, u64)> {
    let body = body.strip_suffix('\n').unwrap_or(body);
    let body = body.strip_suffix('\r').unwrap_or(body);
    let mut lines: Vec<&str> = body.split('\n').collect();
    let cursor = lines.pop().map(str::trim).unwrap_or_default();
    let cursor = parse_cursor(cursor)?;
    let records = lines
        .into_iter()
        .map(SampleRecord::parse)
        .collect::<Result<Vec<_>>>()?;
    Ok((records, cursor))
}

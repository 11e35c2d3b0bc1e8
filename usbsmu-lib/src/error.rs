use std::io;
use thiserror::Error;

/// The primary error type for the `usbsmu-lib` library.
#[derive(Error, Debug)]
pub enum SmuError {
    #[error("Request to {path} failed with HTTP status {status}")]
    Http { status: u16, path: String },

    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Malformed device response: {0}")]
    Decode(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Insufficient data for regression: {0}")]
    InsufficientData(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Disabling the output failed after the procedure itself had already failed.
    #[error("Failed to disable output ({cleanup}) after procedure error: {original}")]
    OutputCleanup {
        cleanup: Box<SmuError>,
        original: Box<SmuError>,
    },
}

impl SmuError {
    /// True for failures talking to the device: bad status, transport, or unparseable payload.
    pub fn is_communication(&self) -> bool {
        match self {
            SmuError::Http { .. } | SmuError::Transport(_) | SmuError::Decode(_) => true,
            SmuError::OutputCleanup { cleanup, .. } => cleanup.is_communication(),
            _ => false,
        }
    }

    pub(crate) fn decode(message: impl Into<String>) -> Self {
        SmuError::Decode(message.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        SmuError::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, SmuError>;

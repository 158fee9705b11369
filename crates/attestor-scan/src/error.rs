//! Scan failure taxonomy.

use thiserror::Error;

pub type ScanResult<T> = std::result::Result<T, ScanError>;

/// Typed scan failures. An infected verdict is not an error.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Scanner could not be spawned, crashed, exited above the found
    /// threshold, or timed out.
    #[error("Scan engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Scanner ran but its output could not be classified.
    #[error("Unparseable scanner response: {0}")]
    UnparseableResponse(String),

    /// Artifact could not be resolved to a byte stream.
    #[error("Artifact fetch failed: {0}")]
    Fetch(String),

    /// Local I/O while materializing the artifact.
    #[error("Scan I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    /// Stable category recorded in scan findings.
    pub fn category(&self) -> &'static str {
        match self {
            ScanError::EngineUnavailable(_) => "engine_unavailable",
            ScanError::UnparseableResponse(_) => "unparseable_response",
            ScanError::Fetch(_) => "fetch_failed",
            ScanError::Io(_) => "io_error",
        }
    }
}

impl From<reqwest::Error> for ScanError {
    fn from(e: reqwest::Error) -> Self {
        ScanError::Fetch(e.to_string())
    }
}

//! Error types for the attestor worker.

use thiserror::Error;

/// Result type alias using attestor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for attestor operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Evidence item not found
    #[error("Evidence not found: {0}")]
    EvidenceNotFound(uuid::Uuid),

    /// Schedule not found
    #[error("Schedule not found: {0}")]
    ScheduleNotFound(uuid::Uuid),

    /// Scan record not found
    #[error("Scan record not found: {0}")]
    ScanNotFound(uuid::Uuid),

    /// Job queue error
    #[error("Job error: {0}")]
    Job(String),

    /// A processor is already bound to this job name
    #[error("Processor already registered for job '{0}'")]
    DuplicateProcessor(String),

    /// No processor is bound to this job name
    #[error("No processor registered for job '{0}'")]
    UnknownProcessor(String),

    /// Record is not in a state that allows the requested change
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

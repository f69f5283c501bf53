use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SpectreError>;

/// Error contract for the whole service.
///
/// Variants follow the caller-facing error kinds: `NotFound` and
/// `Validation` are never retried, `Transient`/`Timeout` may be retried
/// once, `Corruption` degrades the result with a warning, everything
/// else is `Internal`.
#[derive(Debug, Error)]
pub enum SpectreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("corruption detected: {0}")]
    Corruption(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    Validation(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
}

impl SpectreError {
    /// Wire code for the `{code, message}` error envelope.
    pub fn kind_code(&self) -> &'static str {
        match self {
            SpectreError::NotFound(_) => "not_found",
            SpectreError::Validation(_) => "validation",
            SpectreError::Timeout(_) => "timeout",
            SpectreError::Transient(_) => "transient",
            SpectreError::Corruption(_) => "corruption",
            SpectreError::Cancelled => "cancelled",
            SpectreError::Io(_) | SpectreError::Serialization(_) | SpectreError::Internal(_) => {
                "internal"
            }
        }
    }

    /// Whether a single retry with backoff is permitted for this error.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SpectreError::Timeout(_) | SpectreError::Transient(_))
    }
}

impl From<serde_json::Error> for SpectreError {
    fn from(err: serde_json::Error) -> Self {
        SpectreError::Serialization(err.to_string())
    }
}

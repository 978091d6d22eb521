//! Error types for image-meta-io

use std::io;

/// Result type for image-meta-io operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while reading or editing container metadata
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error (zlib streams for PNG `iCCP`)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Buffer is not the container the handler expects
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// No handler recognizes the buffer
    #[error("Unsupported format")]
    UnsupportedFormat,

    /// Truncated or structurally invalid container data
    #[error("Malformed container at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    /// A mutation's structural precondition is not met
    #[error("Unsupported feature: {0}")]
    Unsupported(String),

    /// Caller-supplied value cannot be stored
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Data size exceeds maximum allowed
    #[error("Data too large: {size} bytes (max: {max})")]
    DataTooLarge { size: usize, max: usize },
}

impl Error {
    pub(crate) fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        Error::Malformed {
            offset: offset as u64,
            reason: reason.into(),
        }
    }

    pub(crate) fn unsupported(what: impl Into<String>) -> Self {
        Error::Unsupported(what.into())
    }
}

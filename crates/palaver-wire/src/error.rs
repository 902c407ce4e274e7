//! Wire protocol error types.

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while framing or (un)marshalling records.
#[derive(Debug, Error)]
pub enum WireError {
    /// The record does not match any operation schema: wrong field count,
    /// unknown tag, or a non-numeric numeric field.
    #[error("malformed record: {0}")]
    Malformed(String),

    /// A payload field contains a reserved separator and cannot be
    /// marshalled losslessly.
    #[error("payload field {field:?} contains reserved separator {separator:?}")]
    SeparatorInPayload {
        field: &'static str,
        separator: &'static str,
    },

    /// A frame exceeded the maximum permitted size.
    #[error("frame exceeds {max} bytes")]
    FrameTooLarge { max: usize },

    /// A frame was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    NotUtf8,

    /// The underlying transport failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

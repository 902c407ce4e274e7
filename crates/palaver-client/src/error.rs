//! Client connector error types.

use palaver_wire::WireError;
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced to the embedding application. Transient transport
/// failures are absorbed by the connector's retry loop and never appear
/// here.
#[derive(Debug, Error)]
pub enum ClientError {
    /// A socket operation failed outside the retryable path.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The request or a response could not be (un)marshalled. For
    /// requests this means the caller bypassed input validation.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// The configured number of search cycles elapsed without finding a
    /// primary.
    #[error("no primary found after {cycles} search cycles")]
    NoPrimary { cycles: u64 },

    /// The cluster refused the subscription.
    #[error("subscription refused: {0}")]
    SubscriptionRefused(String),

    /// A subscription was requested before any primary was found.
    #[error("not connected to a primary")]
    NotConnected,
}

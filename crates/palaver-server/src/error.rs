//! Server error types.

use palaver_config::ConfigError;
use palaver_log::LogError;
use palaver_replica::ReplicaError;
use palaver_wire::WireError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that bring a replica (or one of its listeners) down. Semantic
/// refusals never appear here; they travel inside response envelopes.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener or socket failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol failure on a channel the server owns.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// The durable log failed; fatal to the replica.
    #[error("durable log error: {0}")]
    Log(#[from] LogError),

    /// Coordination subsystem failure.
    #[error("replication error: {0}")]
    Replica(#[from] ReplicaError),

    /// The replica was started with an unusable configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

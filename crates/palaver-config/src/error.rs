//! Configuration error types.

use thiserror::Error;

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from loading or validating the cluster configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Merging the configuration sources failed.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    /// The replica table is empty.
    #[error("replica table must name at least one replica")]
    EmptyReplicaTable,

    /// A replica row has an empty name.
    #[error("every replica must have a non-empty name")]
    UnnamedReplica,

    /// Two replica rows share a name.
    #[error("replica names must be unique")]
    DuplicateReplicaName,

    /// A name was requested that the table does not contain.
    #[error("replica {0:?} is not in the configured table")]
    UnknownReplica(String),
}

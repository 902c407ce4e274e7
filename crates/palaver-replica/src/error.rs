//! Replica coordination error types.

use palaver_log::LogError;
use palaver_types::ReplicaName;
use palaver_wire::WireError;
use thiserror::Error;

/// Result type for replica coordination.
pub type ReplicaResult<T> = Result<T, ReplicaError>;

/// Errors from the coordination subsystem. Most per-peer failures are
/// handled in place (the peer is simply treated as dead); the variants
/// here are the ones that abort boot or the replica itself.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Binding or accepting on a listener failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A peer channel produced an unusable record during setup.
    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    /// The durable log failed; fatal to the replica.
    #[error("durable log error: {0}")]
    Log(#[from] LogError),

    /// A peer introduced itself with an unexpected name.
    #[error("dialed {expected} but peer introduced itself as {actual}")]
    PeerMismatch {
        expected: ReplicaName,
        actual: ReplicaName,
    },

    /// An INTERNAL operation referenced a peer without a live channel.
    #[error("no channel to peer {0}")]
    NoChannel(ReplicaName),

    /// The replica was asked to shut down while still booting.
    #[error("shut down during boot")]
    ShutdownDuringBoot,
}

//! # palaver-server: the Palaver replica server
//!
//! The client-facing half of a replica — the CLIENT gateway and the
//! NOTIF dispatcher — plus the dispatch loop and the assembly that wires
//! them to the coordination subsystem in `palaver-replica`.
//!
//! Embed a replica with [`start`] (own thread, [`ReplicaHandle`] for
//! lifecycle) or [`run`] (calling thread); the node binary does the
//! latter.

mod dispatch;
mod error;
mod gateway;
mod notif;
mod replica;

pub use dispatch::Command;
pub use error::{ServerError, ServerResult};
pub use gateway::NOT_PRIMARY;
pub use notif::ALREADY_LOGGED_IN;
pub use replica::{ReplicaHandle, run, start};

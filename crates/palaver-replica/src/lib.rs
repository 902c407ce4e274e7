//! # palaver-replica: Replica coordination
//!
//! The coordination subsystem of a Palaver replica:
//!
//! - [`mesh::PeerMesh`] — the INTERNAL channels between replicas,
//! - [`health`] — heartbeat answering, sibling probing, primacy,
//! - [`catchup`] — boot-time log reconciliation,
//! - [`store::Store`] — kernel state and durable log in lockstep,
//! - [`intake`] — the replication-side input of the dispatch loop,
//! - [`view::ClusterView`] — the living set and the primacy flag.
//!
//! The server crate assembles these with the client gateway and the
//! notification dispatcher into a running replica.

pub mod catchup;
mod error;
pub mod health;
mod intake;
pub mod mesh;
mod store;
mod view;

pub use error::{ReplicaError, ReplicaResult};
pub use intake::{Intake, intake_queue};
pub use store::{CommitOutcome, Store};
pub use view::{ClusterView, Shutdown};

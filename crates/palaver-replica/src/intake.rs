//! The replication intake queue.
//!
//! Backup-mode input of the dispatch loop: operations replicated from
//! the primary, plus the in-memory takeover sentinel. The sentinel is a
//! distinct variant rather than a fake operation, so it can never be
//! logged, broadcast, or confused with client traffic.

use crossbeam_channel::{Receiver, Sender, unbounded};
use palaver_wire::Op;

/// One item on the replication intake queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intake {
    /// An operation replicated from the primary over INTERNAL (or a
    /// catch-up slice entry, which arrives the same way).
    Replicated(Op),

    /// In-memory sentinel from the health monitor: this replica is now
    /// the lexicographic minimum of the living set and must switch its
    /// dispatch loop to the client-facing source.
    Takeover,
}

/// Creates the intake queue. Unbounded: producers are the per-peer
/// consumers and the health monitor, both naturally rate-limited.
pub fn intake_queue() -> (Sender<Intake>, Receiver<Intake>) {
    unbounded()
}

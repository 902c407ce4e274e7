//! # palaver-kernel: the deterministic core of Palaver
//!
//! The kernel applies replicated operations to the account-and-message
//! state and answers read-only queries. It is completely deterministic:
//! no I/O, no clocks, no randomness. Two replicas that apply the same
//! prefix of operations hold identical state, which is the whole basis of
//! the replication scheme.
//!
//! The runtime around the kernel decides what to do with the returned
//! [`Effect`]s: the primary pushes deliveries to live NOTIF subscribers,
//! backups drop them (their subscribers are re-seeded from the queues on
//! takeover).

mod kernel;
mod state;

pub use kernel::{Effect, KernelError, KernelResult, PAGE_SIZE, apply, list_accounts, user_logs};
pub use state::ChatState;

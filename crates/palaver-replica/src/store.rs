//! The replica's store: kernel state plus the durable log, kept in
//! lockstep behind one lock.
//!
//! The pairing matters: an operation is committed by applying it to the
//! kernel and appending it to the log as one unit, so the on-disk line
//! count (progress) always equals the number of operations the in-memory
//! state has absorbed. Catch-up slice reads take the same lock and
//! therefore see a consistent position.

use std::path::Path;
use std::sync::Mutex;

use tracing::warn;

use palaver_kernel::{ChatState, Effect, KernelError, apply};
use palaver_log::{LogResult, OpLog};
use palaver_types::Progress;
use palaver_wire::Op;

/// Outcome of committing one operation.
#[derive(Debug)]
pub enum CommitOutcome {
    /// Applied and durably appended; effects for the runtime to execute.
    Applied(Vec<Effect>),
    /// Semantic refusal. State and log are untouched.
    Refused(KernelError),
}

struct StoreInner {
    state: ChatState,
    log: OpLog,
}

/// Shared ownership of one replica's state and log.
pub struct Store {
    inner: Mutex<StoreInner>,
}

impl Store {
    /// Opens the log at `path` and rehydrates the kernel state from it.
    ///
    /// Every line on disk was once committed, so a refusal during replay
    /// means the file was tampered with or the code regressed; it is
    /// logged loudly and skipped rather than taken fatal, matching how
    /// the replica treats divergence at runtime.
    pub fn open(path: impl AsRef<Path>) -> LogResult<Store> {
        let (log, replay) = OpLog::open(path)?;
        let mut state = ChatState::new();
        for (idx, op) in replay.iter().enumerate() {
            if let Err(refusal) = apply(&mut state, op) {
                warn!(position = idx, %refusal, "replayed op refused; log diverged");
            }
        }
        Ok(Store {
            inner: Mutex::new(StoreInner { state, log }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().expect("store mutex poisoned")
    }

    /// Current durable progress.
    pub fn progress(&self) -> Progress {
        self.lock().log.progress()
    }

    /// Applies `op` and, if it succeeds, durably appends it.
    ///
    /// A refusal is a normal outcome; a log error is fatal and the
    /// caller must bring the replica down.
    pub fn commit(&self, op: &Op) -> LogResult<CommitOutcome> {
        let mut inner = self.lock();
        match apply(&mut inner.state, op) {
            Ok(effects) => {
                inner.log.append(op)?;
                Ok(CommitOutcome::Applied(effects))
            }
            Err(refusal) => Ok(CommitOutcome::Refused(refusal)),
        }
    }

    /// Serves a catch-up slice `[lo, hi)` from the durable log.
    pub fn slice(&self, lo: u64, hi: u64) -> LogResult<Vec<Op>> {
        self.lock().log.slice(lo, hi)
    }

    /// Runs a read-only query against the kernel state.
    pub fn with_state<R>(&self, f: impl FnOnce(&ChatState) -> R) -> R {
        f(&self.lock().state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_types::UserId;
    use tempfile::tempdir;

    fn uid(s: &str) -> UserId {
        UserId::unchecked(s)
    }

    #[test]
    fn commit_keeps_state_and_log_in_lockstep() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("A.log")).unwrap();

        let outcome = store.commit(&Op::Create { user: uid("ream") }).unwrap();
        assert!(matches!(outcome, CommitOutcome::Applied(_)));
        assert_eq!(store.progress(), Progress::new(1));

        // Refusal advances nothing.
        let outcome = store.commit(&Op::Create { user: uid("ream") }).unwrap();
        assert!(matches!(
            outcome,
            CommitOutcome::Refused(KernelError::DuplicateUser(_))
        ));
        assert_eq!(store.progress(), Progress::new(1));
        assert!(store.with_state(|s| s.contains(&uid("ream"))));
    }

    #[test]
    fn reopen_restores_state_from_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("A.log");
        {
            let store = Store::open(&path).unwrap();
            store.commit(&Op::Create { user: uid("ream") }).unwrap();
            store.commit(&Op::Create { user: uid("mark") }).unwrap();
            store
                .commit(&Op::Send {
                    author: uid("ream"),
                    recipient: uid("mark"),
                    text: "hi".into(),
                })
                .unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.progress(), Progress::new(3));
        store.with_state(|s| {
            assert!(s.contains(&uid("ream")));
            assert_eq!(s.undelivered(&uid("mark")).count(), 1);
        });
    }

    #[test]
    fn slice_serves_committed_positions() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path().join("A.log")).unwrap();
        store.commit(&Op::Create { user: uid("ream") }).unwrap();
        store.commit(&Op::Create { user: uid("mark") }).unwrap();

        let ops = store.slice(1, 2).unwrap();
        assert_eq!(ops, vec![Op::Create { user: uid("mark") }]);
    }
}

//! The replica's view of the cluster: who is alive, who leads.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use palaver_types::ReplicaName;

/// Cooperative shutdown flag shared by every thread of a replica.
///
/// Listener loops poll it between accepts, consumers check it on read
/// timeouts, and the dispatcher exits when it trips.
#[derive(Debug, Clone, Default)]
pub struct Shutdown(std::sync::Arc<AtomicBool>);

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleeps for `total`, waking early if shutdown triggers. Returns
    /// `false` if shutdown was triggered.
    pub fn sleep_unless_triggered(&self, total: Duration) -> bool {
        let step = Duration::from_millis(50);
        let mut remaining = total;
        while remaining > Duration::ZERO {
            if self.is_triggered() {
                return false;
            }
            let chunk = remaining.min(step);
            std::thread::sleep(chunk);
            remaining -= chunk;
        }
        !self.is_triggered()
    }
}

/// Shared liveness-and-leadership state.
///
/// Every sibling starts out presumed alive; the health monitor removes
/// the ones that stop answering. Siblings are never re-added: a replica
/// that crashed must restart its process (and catch up) to rejoin.
#[derive(Debug)]
pub struct ClusterView {
    self_name: ReplicaName,
    living: Mutex<BTreeSet<ReplicaName>>,
    is_primary: AtomicBool,
}

impl ClusterView {
    pub fn new(self_name: ReplicaName, siblings: impl IntoIterator<Item = ReplicaName>) -> Self {
        Self {
            self_name,
            living: Mutex::new(siblings.into_iter().collect()),
            is_primary: AtomicBool::new(false),
        }
    }

    pub fn self_name(&self) -> &ReplicaName {
        &self.self_name
    }

    /// Whether this replica currently considers itself primary.
    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn is_living(&self, name: &ReplicaName) -> bool {
        self.living().contains(name)
    }

    /// Snapshot of the living siblings.
    pub fn living(&self) -> BTreeSet<ReplicaName> {
        self.living
            .lock()
            .expect("living-set mutex poisoned")
            .clone()
    }

    /// Removes a sibling that failed its health probe. Returns whether it
    /// was present.
    pub fn remove_sibling(&self, name: &ReplicaName) -> bool {
        self.living
            .lock()
            .expect("living-set mutex poisoned")
            .remove(name)
    }

    /// The replica that should lead: lexicographically first among self
    /// and the living siblings.
    pub fn leader(&self) -> ReplicaName {
        let living = self.living();
        living
            .first()
            .filter(|first| **first < self.self_name)
            .cloned()
            .unwrap_or_else(|| self.self_name.clone())
    }

    /// Recomputes `is_primary` from the current living set. Returns
    /// `true` exactly when this call transitioned the flag false→true.
    pub fn recompute_primary(&self) -> bool {
        let should_lead = self.leader() == self.self_name;
        let was = self.is_primary.swap(should_lead, Ordering::SeqCst);
        should_lead && !was
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn view(self_name: &str, siblings: &[&str]) -> ClusterView {
        ClusterView::new(
            ReplicaName::from(self_name),
            siblings.iter().map(|s| ReplicaName::from(*s)),
        )
    }

    #[test_case("A", &["B", "C"], "A"; "smallest name leads")]
    #[test_case("B", &["A", "C"], "A"; "living smaller sibling leads")]
    #[test_case("B", &["C"], "B"; "leads once smaller sibling dies")]
    #[test_case("C", &[], "C"; "alone means leading")]
    fn leader_is_lexicographic_minimum(self_name: &str, siblings: &[&str], expected: &str) {
        assert_eq!(view(self_name, siblings).leader(), ReplicaName::from(expected));
    }

    #[test]
    fn primary_transition_fires_once() {
        let v = view("B", &["A", "C"]);
        assert!(!v.recompute_primary());
        assert!(!v.is_primary());

        v.remove_sibling(&ReplicaName::from("A"));
        assert!(v.recompute_primary());
        assert!(v.is_primary());

        // Stays primary without a second transition.
        assert!(!v.recompute_primary());
        assert!(v.is_primary());
    }

    #[test]
    fn exactly_one_replica_claims_primacy() {
        // All replicas mutually reachable: only A computes primary.
        for (name, siblings) in [("A", ["B", "C"]), ("B", ["A", "C"]), ("C", ["A", "B"])] {
            let v = view(name, &siblings);
            v.recompute_primary();
            assert_eq!(v.is_primary(), name == "A");
        }
    }

    #[test]
    fn shutdown_interrupts_sleep() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        assert!(!shutdown.sleep_unless_triggered(Duration::from_secs(5)));
    }
}

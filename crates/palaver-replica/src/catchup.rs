//! Boot-time catch-up: reconcile this replica's log with the living
//! majority before serving.
//!
//! Runs exactly once, after the mesh is up (so every peer's handshake
//! progress is known) and before the client gateway opens. The
//! presumptive leader — lexicographically first among the mesh — is the
//! only initiator, so no replica ever receives the same slice twice:
//!
//! - a **behind leader** requests the missing slice from the most
//!   advanced peer and commits it, then
//! - an **ahead (or caught-up) leader** pushes the missing tail to every
//!   lagging peer, whose normal consumers apply it, while
//! - a **behind non-leader** just waits for the leader's push, and an
//!   ahead non-leader does nothing at all.
//!
//! There is no deadline: a replica that cannot reconcile must not serve.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use palaver_types::{Progress, ReplicaName};

use crate::error::ReplicaResult;
use crate::intake::Intake;
use crate::mesh::PeerMesh;
use crate::store::{CommitOutcome, Store};
use crate::view::Shutdown;

/// Runs catch-up. Returns the non-replication intake items (takeover
/// sentinels) observed while draining, for the dispatcher to handle
/// first.
pub fn run(
    mesh: &PeerMesh,
    self_name: &ReplicaName,
    store: &Store,
    intake: &Receiver<Intake>,
    shutdown: &Shutdown,
) -> ReplicaResult<Vec<Intake>> {
    let mut deferred = Vec::new();
    let peers = mesh.peer_progress();
    let best = peers.values().copied().max().unwrap_or_default();
    let is_leader = mesh
        .connected_peers()
        .into_iter()
        .all(|peer| *self_name < peer);

    if is_leader {
        if store.progress() < best {
            // Any peer advertising the best progress will do; take the
            // first in name order for determinism.
            let donor = peers
                .iter()
                .filter(|(_, p)| **p == best)
                .map(|(name, _)| name.clone())
                .min()
                .expect("a peer with the best progress exists");
            info!(
                replica = %self_name,
                %donor,
                from = store.progress().as_u64(),
                to = best.as_u64(),
                "catching up from peer"
            );
            mesh.request_slice(&donor, store.progress().as_u64(), best.as_u64())?;
            drain_until(store, intake, best, shutdown, &mut deferred)?;
        }

        // Fix up every lagging peer from our (now maximal) log.
        let own = store.progress();
        for (peer, their) in &peers {
            if *their < own {
                info!(
                    replica = %self_name,
                    %peer,
                    from = their.as_u64(),
                    to = own.as_u64(),
                    "pushing catch-up tail to lagging peer"
                );
                let ops = store.slice(their.as_u64(), own.as_u64())?;
                mesh.send_ops(peer, &ops)?;
            }
        }
    } else if store.progress() < best {
        // The leader will push the tail; wait for it to arrive.
        info!(
            replica = %self_name,
            from = store.progress().as_u64(),
            to = best.as_u64(),
            "awaiting catch-up push from the leader"
        );
        drain_until(store, intake, best, shutdown, &mut deferred)?;
    }

    if store.progress() >= best {
        info!(replica = %self_name, progress = %store.progress(), "catch-up complete");
    }
    Ok(deferred)
}

/// Commits replicated intake items until progress reaches `target` (or
/// shutdown). Anything that is not a replicated op is deferred for the
/// dispatcher.
fn drain_until(
    store: &Store,
    intake: &Receiver<Intake>,
    target: Progress,
    shutdown: &Shutdown,
    deferred: &mut Vec<Intake>,
) -> ReplicaResult<()> {
    while store.progress() < target {
        if shutdown.is_triggered() {
            return Ok(());
        }
        match intake.recv_timeout(Duration::from_millis(250)) {
            Ok(Intake::Replicated(op)) => match store.commit(&op)? {
                CommitOutcome::Applied(_) => {}
                CommitOutcome::Refused(refusal) => {
                    warn!(op = op.tag(), %refusal, "catch-up op refused; log diverged");
                }
            },
            Ok(other) => deferred.push(other),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

//! Replica assembly: boot order and lifecycle.
//!
//! Boot follows the protocol's required order:
//!
//! 1. open the durable log and rehydrate the kernel state,
//! 2. establish the INTERNAL mesh (handshakes exchange progress),
//! 3. start the per-peer consumers,
//! 4. start the HEALTH listener and probe,
//! 5. run catch-up against the living majority,
//! 6. open the NOTIF listener and the client gateway,
//! 7. run the dispatch loop until shutdown.
//!
//! Catch-up must precede the gateway so a recovering replica never
//! serves stale state; the gateway greeting advertises not-primary until
//! the first probe pass elects this replica anyway.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use palaver_config::PalaverConfig;
use palaver_replica::mesh::PeerMesh;
use palaver_replica::{ClusterView, Shutdown, Store, catchup, health, intake_queue};
use palaver_types::ReplicaName;

use crate::dispatch::Dispatcher;
use crate::error::ServerResult;
use crate::gateway::{self, ClientTable};
use crate::notif::{self, NotifRegistry};

/// A running replica, for embedding (the node binary and the test
/// clusters both drive this).
pub struct ReplicaHandle {
    name: ReplicaName,
    shutdown: Shutdown,
    thread: JoinHandle<ServerResult<()>>,
}

impl ReplicaHandle {
    /// The replica's configured name.
    pub fn name(&self) -> &ReplicaName {
        &self.name
    }

    /// Requests a cooperative shutdown.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Whether the replica's main thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the replica to stop and returns its outcome.
    pub fn join(self) -> ServerResult<()> {
        match self.thread.join() {
            Ok(outcome) => outcome,
            Err(_) => Err(std::io::Error::other("replica thread panicked").into()),
        }
    }
}

/// Starts a replica on its own thread.
pub fn start(cfg: PalaverConfig, name: &str) -> ServerResult<ReplicaHandle> {
    let spec = cfg.replica(name)?.clone();
    let replica_name = spec.name();
    let shutdown = Shutdown::new();

    let thread = {
        let shutdown = shutdown.clone();
        let name = name.to_string();
        thread::Builder::new()
            .name(format!("replica-{name}"))
            .spawn(move || {
                let outcome = run(&cfg, &name, shutdown);
                if let Err(ref err) = outcome {
                    error!(replica = %name, %err, "replica stopped with error");
                }
                outcome
            })?
    };

    Ok(ReplicaHandle {
        name: replica_name,
        shutdown,
        thread,
    })
}

/// Runs a replica to completion on the calling thread.
pub fn run(cfg: &PalaverConfig, name: &str, shutdown: Shutdown) -> ServerResult<()> {
    let spec = cfg.replica(name)?.clone();
    let store = Arc::new(Store::open(cfg.log_path(name))?);
    info!(
        replica = %spec.name,
        progress = %store.progress(),
        "replica booting"
    );

    let siblings: Vec<_> = cfg.siblings(name).into_iter().cloned().collect();
    let view = Arc::new(ClusterView::new(
        spec.name(),
        siblings.iter().map(palaver_config::ReplicaSpec::name),
    ));
    let (intake_tx, intake_rx) = intake_queue();

    let mesh = Arc::new(PeerMesh::establish(
        cfg,
        &spec,
        store.progress(),
        &shutdown,
    )?);
    PeerMesh::start_consumers(&mesh, Arc::clone(&store), intake_tx.clone(), shutdown.clone())?;

    health::spawn_listener(&spec, shutdown.clone())?;
    health::spawn_probe(
        siblings,
        Arc::clone(&view),
        intake_tx.clone(),
        shutdown.clone(),
    )?;

    let deferred = catchup::run(&mesh, view.self_name(), &store, &intake_rx, &shutdown)?;

    let (command_tx, command_rx) = crossbeam_channel::unbounded();
    let registry = Arc::new(NotifRegistry::new());
    notif::spawn(&spec, Arc::clone(&registry), command_tx.clone(), shutdown.clone())?;

    let table = Arc::new(ClientTable::new());
    gateway::spawn(
        &spec,
        Arc::clone(&view),
        Arc::clone(&table),
        command_tx,
        shutdown.clone(),
    )?;

    let dispatcher = Dispatcher::new(
        store, mesh, view, table, registry, command_rx, intake_rx, shutdown,
    );
    let outcome = dispatcher.run(deferred);
    info!(replica = %spec.name, "replica stopped");
    outcome
}

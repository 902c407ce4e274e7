//! Two-replica coordination tests against real sockets: mesh bring-up
//! with the progress handshake, replication and slice service over the
//! INTERNAL channel, and the boot-time catch-up protocol.

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use tempfile::TempDir;

use palaver_config::{PalaverConfig, ReplicaSpec};
use palaver_replica::mesh::PeerMesh;
use palaver_replica::{CommitOutcome, Intake, Shutdown, Store, catchup, intake_queue};
use palaver_types::{Progress, ReplicaName, UserId};
use palaver_wire::Op;

fn uid(s: &str) -> UserId {
    UserId::unchecked(s)
}

fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr").port())
        .collect()
}

fn two_replica_config(data_dir: &TempDir) -> PalaverConfig {
    let ports = free_ports(8);
    let replica = |name: &str, base: usize| ReplicaSpec {
        name: name.to_string(),
        host: "127.0.0.1".to_string(),
        internal_port: ports[base],
        client_port: ports[base + 1],
        health_port: ports[base + 2],
        notif_port: ports[base + 3],
    };
    PalaverConfig {
        data_dir: data_dir.path().to_path_buf(),
        replicas: vec![replica("A", 0), replica("B", 4)],
    }
}

/// Brings up both sides of an A↔B mesh. A listens, B dials.
fn establish_pair(
    cfg: &PalaverConfig,
    progress_a: Progress,
    progress_b: Progress,
    shutdown: &Shutdown,
) -> (Arc<PeerMesh>, Arc<PeerMesh>) {
    let spec_a = cfg.replica("A").expect("A configured").clone();
    let cfg_a = cfg.clone();
    let shutdown_a = shutdown.clone();
    let side_a = thread::spawn(move || {
        PeerMesh::establish(&cfg_a, &spec_a, progress_a, &shutdown_a).expect("A mesh")
    });

    let spec_b = cfg.replica("B").expect("B configured").clone();
    let mesh_b = PeerMesh::establish(cfg, &spec_b, progress_b, shutdown).expect("B mesh");
    let mesh_a = side_a.join().expect("A mesh thread");
    (Arc::new(mesh_a), Arc::new(mesh_b))
}

fn seed_store(store: &Store, ops: &[Op]) {
    for op in ops {
        match store.commit(op).expect("commit") {
            CommitOutcome::Applied(_) => {}
            CommitOutcome::Refused(refusal) => panic!("seed op refused: {refusal}"),
        }
    }
}

fn seeded_ops() -> Vec<Op> {
    vec![
        Op::Create { user: uid("mark") },
        Op::Create { user: uid("ream") },
        Op::Send {
            author: uid("ream"),
            recipient: uid("mark"),
            text: "hi".into(),
        },
    ]
}

#[test]
fn handshake_reports_progress_and_channels_replicate() {
    let data = TempDir::new().expect("data dir");
    let cfg = two_replica_config(&data);
    let shutdown = Shutdown::new();

    let store_a = Arc::new(Store::open(cfg.log_path("A")).expect("A store"));
    let store_b = Arc::new(Store::open(cfg.log_path("B")).expect("B store"));
    seed_store(&store_a, &seeded_ops());

    let (mesh_a, mesh_b) =
        establish_pair(&cfg, store_a.progress(), store_b.progress(), &shutdown);

    // Both sides learned the other's progress from the handshake.
    let a_sees = mesh_a.peer_progress();
    assert_eq!(a_sees.get(&ReplicaName::from("B")), Some(&Progress::ZERO));
    let b_sees = mesh_b.peer_progress();
    assert_eq!(b_sees.get(&ReplicaName::from("A")), Some(&Progress::new(3)));

    // A broadcast lands on B's intake queue through its consumer.
    let (intake_a_tx, _intake_a_rx) = intake_queue();
    let (intake_b_tx, intake_b_rx) = intake_queue();
    PeerMesh::start_consumers(&mesh_a, Arc::clone(&store_a), intake_a_tx, shutdown.clone())
        .expect("A consumers");
    PeerMesh::start_consumers(&mesh_b, Arc::clone(&store_b), intake_b_tx, shutdown.clone())
        .expect("B consumers");

    let op = Op::Create { user: uid("joe") };
    let living: std::collections::BTreeSet<ReplicaName> =
        [ReplicaName::from("B")].into_iter().collect();
    mesh_a.broadcast(&op, &living);
    match intake_b_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Intake::Replicated(received)) => assert_eq!(received, op),
        other => panic!("expected the broadcast op, got {other:?}"),
    }

    // A slice request is served from the peer's log over the same
    // channel, in order.
    mesh_b
        .request_slice(&ReplicaName::from("A"), 0, 2)
        .expect("slice request");
    let mut received = Vec::new();
    while received.len() < 2 {
        match intake_b_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Intake::Replicated(op)) => received.push(op),
            Ok(Intake::Takeover) => panic!("unexpected takeover"),
            Err(RecvTimeoutError::Timeout) => panic!("slice never arrived"),
            Err(RecvTimeoutError::Disconnected) => panic!("intake closed"),
        }
    }
    assert_eq!(received, seeded_ops()[0..2].to_vec());

    shutdown.trigger();
}

#[test]
fn boot_catch_up_converges_both_directions() {
    let data = TempDir::new().expect("data dir");
    let cfg = two_replica_config(&data);
    let shutdown = Shutdown::new();

    // A holds the history; B starts empty.
    let store_a = Arc::new(Store::open(cfg.log_path("A")).expect("A store"));
    let store_b = Arc::new(Store::open(cfg.log_path("B")).expect("B store"));
    seed_store(&store_a, &seeded_ops());

    let (mesh_a, mesh_b) =
        establish_pair(&cfg, store_a.progress(), store_b.progress(), &shutdown);

    let (intake_a_tx, intake_a_rx) = intake_queue();
    let (intake_b_tx, intake_b_rx) = intake_queue();
    PeerMesh::start_consumers(&mesh_a, Arc::clone(&store_a), intake_a_tx, shutdown.clone())
        .expect("A consumers");
    PeerMesh::start_consumers(&mesh_b, Arc::clone(&store_b), intake_b_tx, shutdown.clone())
        .expect("B consumers");

    // A (the leader) pushes the tail; B waits for it. Run both ends the
    // way a booting replica would.
    let side_a = {
        let mesh_a = Arc::clone(&mesh_a);
        let store_a = Arc::clone(&store_a);
        let shutdown = shutdown.clone();
        thread::spawn(move || {
            catchup::run(&mesh_a, &ReplicaName::from("A"), &store_a, &intake_a_rx, &shutdown)
                .expect("A catch-up")
        })
    };
    let deferred_b = catchup::run(
        &mesh_b,
        &ReplicaName::from("B"),
        &store_b,
        &intake_b_rx,
        &shutdown,
    )
    .expect("B catch-up");
    side_a.join().expect("A catch-up thread");

    assert!(deferred_b.is_empty());
    assert_eq!(store_b.progress(), Progress::new(3));
    let state_a = store_a.with_state(Clone::clone);
    let state_b = store_b.with_state(Clone::clone);
    assert_eq!(state_a, state_b);

    // The log files are byte-identical after convergence.
    let a = std::fs::read(cfg.log_path("A")).expect("A log");
    let b = std::fs::read(cfg.log_path("B")).expect("B log");
    assert_eq!(a, b);

    shutdown.trigger();
}

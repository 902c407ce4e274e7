//! In-process cluster scenarios: whole replicas on real sockets, driven
//! through the client connector exactly as the interactive shell would
//! drive them.
//!
//! Every cluster gets its own OS-assigned port range and its own data
//! directory, so the scenarios can run in parallel.

use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use tempfile::TempDir;

use palaver_client::{ClientError, Connector, Subscription};
use palaver_config::{PalaverConfig, ReplicaSpec};
use palaver_log::OpLog;
use palaver_server::{ALREADY_LOGGED_IN, ReplicaHandle};
use palaver_types::UserId;
use palaver_wire::{FrameReader, Op, Request, Response, write_frame};

fn uid(s: &str) -> UserId {
    UserId::unchecked(s)
}

/// Reserves `count` distinct localhost ports by holding them open
/// simultaneously, then releasing them all at once.
fn free_ports(count: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr").port())
        .collect()
}

fn cluster_config(names: &[&str], data_dir: &TempDir) -> PalaverConfig {
    let ports = free_ports(names.len() * 4);
    let replicas = names
        .iter()
        .enumerate()
        .map(|(i, name)| ReplicaSpec {
            name: (*name).to_string(),
            host: "127.0.0.1".to_string(),
            internal_port: ports[i * 4],
            client_port: ports[i * 4 + 1],
            health_port: ports[i * 4 + 2],
            notif_port: ports[i * 4 + 3],
        })
        .collect();
    PalaverConfig {
        data_dir: data_dir.path().to_path_buf(),
        replicas,
    }
}

struct TestCluster {
    cfg: PalaverConfig,
    replicas: Vec<ReplicaHandle>,
    data: TempDir,
}

impl TestCluster {
    fn launch(names: &[&str]) -> TestCluster {
        let data = TempDir::new().expect("temp data dir");
        let cfg = cluster_config(names, &data);
        Self::launch_with(cfg, data, names)
    }

    fn launch_with(cfg: PalaverConfig, data: TempDir, names: &[&str]) -> TestCluster {
        let replicas = names
            .iter()
            .map(|name| palaver_server::start(cfg.clone(), name).expect("replica starts"))
            .collect();
        TestCluster {
            cfg,
            replicas,
            data,
        }
    }

    /// Connects a client, riding out the initial election.
    fn connector(&self) -> Connector {
        Connector::connect_with_limit(&self.cfg, Some(150)).expect("a primary gets elected")
    }

    fn stop(self) -> TempDir {
        for replica in &self.replicas {
            replica.shutdown();
        }
        for replica in self.replicas {
            let _ = replica.join();
        }
        self.data
    }
}

// Request helpers in the shape the shell would issue them.

fn create(conn: &mut Connector, user: &str) -> Response {
    conn.send_request(&Request::Op(Op::Create { user: uid(user) }))
        .expect("request completes")
}

fn login(conn: &mut Connector, user: &str) -> Response {
    conn.send_request(&Request::Op(Op::Login { user: uid(user) }))
        .expect("request completes")
}

fn delete(conn: &mut Connector, user: &str) -> Response {
    conn.send_request(&Request::Op(Op::Delete { user: uid(user) }))
        .expect("request completes")
}

fn send_chat(conn: &mut Connector, author: &str, recipient: &str, text: &str) -> Response {
    conn.send_request(&Request::Op(Op::Send {
        author: uid(author),
        recipient: uid(recipient),
        text: text.into(),
    }))
    .expect("request completes")
}

fn list(conn: &mut Connector, wildcard: &str, page: u64) -> Vec<UserId> {
    match conn
        .send_request(&Request::List {
            user: uid("tester"),
            wildcard: wildcard.into(),
            page,
        })
        .expect("request completes")
    {
        Response::List { accounts, .. } => accounts,
        other => panic!("expected a list response, got {other:?}"),
    }
}

fn logs(conn: &mut Connector, user: &str, wildcard: &str, page: u64) -> Vec<String> {
    match conn
        .send_request(&Request::Logs {
            user: uid(user),
            wildcard: wildcard.into(),
            page,
        })
        .expect("request completes")
    {
        Response::Logs { chats, .. } => chats.into_iter().map(|c| c.text).collect(),
        other => panic!("expected a logs response, got {other:?}"),
    }
}

fn fallover(conn: &mut Connector) {
    let response = conn
        .send_request(&Request::Fallover { user: uid("tester") })
        .expect("request completes");
    assert!(response.success(), "fallover should be acknowledged");
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn basic_workload_and_pagination() {
    let cluster = TestCluster::launch(&["A", "B", "C"]);
    let mut conn = cluster.connector();

    for user in ["ream", "mark", "achele", "joe", "bob"] {
        assert!(create(&mut conn, user).success(), "create {user}");
    }

    // Duplicate create refuses and leaves the account count alone.
    let dup = create(&mut conn, "ream");
    assert!(!dup.success());
    match &dup {
        Response::Basic { error, .. } => assert_eq!(error, "User already exists"),
        other => panic!("expected basic refusal, got {other:?}"),
    }

    // Login against a missing account names the problem.
    let missing = login(&mut conn, "faker");
    assert!(!missing.success());
    match &missing {
        Response::Basic { error, .. } => assert!(error.contains("does not exist")),
        other => panic!("expected basic refusal, got {other:?}"),
    }
    assert!(login(&mut conn, "ream").success());

    // Pagination in insertion order, pages of four.
    let expect = |ids: &[&str]| ids.iter().map(|s| uid(s)).collect::<Vec<_>>();
    assert_eq!(list(&mut conn, "", 0), expect(&["ream", "mark", "achele", "joe"]));
    assert_eq!(list(&mut conn, "", 1), expect(&["bob"]));
    assert_eq!(list(&mut conn, "", 2), expect(&[]));
    assert_eq!(list(&mut conn, "e", 0), expect(&["ream", "achele", "joe"]));

    cluster.stop();
}

#[test]
fn send_ordering_and_account_lifecycle() {
    let cluster = TestCluster::launch(&["A", "B"]);
    let mut conn = cluster.connector();

    assert!(create(&mut conn, "ream").success());
    assert!(create(&mut conn, "mark").success());

    let ghost = send_chat(&mut conn, "ream", "ghost", "boo");
    assert!(!ghost.success());

    assert!(send_chat(&mut conn, "ream", "mark", "first").success());
    assert!(send_chat(&mut conn, "ream", "mark", "second").success());

    // Newest first, and both present exactly once.
    assert_eq!(logs(&mut conn, "mark", "", 0), vec!["second", "first"]);

    assert!(delete(&mut conn, "mark").success());
    let gone = login(&mut conn, "mark");
    assert!(!gone.success());

    cluster.stop();
}

#[test]
fn notification_delivery_and_backlog() {
    let cluster = TestCluster::launch(&["A", "B"]);
    let mut conn = cluster.connector();

    assert!(create(&mut conn, "ream").success());
    assert!(create(&mut conn, "mark").success());
    assert!(create(&mut conn, "bob").success());

    // Live delivery: subscribed recipient sees the chat promptly.
    let sub = conn.subscribe(&uid("mark")).expect("subscription accepted");
    assert!(send_chat(&mut conn, "ream", "mark", "hello").success());
    let delivered = sub
        .recv_timeout(Duration::from_secs(5))
        .expect("chat delivered in real time");
    assert_eq!(delivered.author, uid("ream"));
    assert_eq!(delivered.text, "hello");

    // Exactly once: nothing else arrives.
    assert!(sub.recv_timeout(Duration::from_secs(1)).is_err());

    // Backlog delivery: chats sent before the subscription arrive when
    // the recipient finally subscribes, oldest first.
    assert!(send_chat(&mut conn, "ream", "bob", "early one").success());
    assert!(send_chat(&mut conn, "ream", "bob", "early two").success());
    let bob = conn.subscribe(&uid("bob")).expect("subscription accepted");
    assert_eq!(
        bob.recv_timeout(Duration::from_secs(5)).expect("backlog").text,
        "early one"
    );
    assert_eq!(
        bob.recv_timeout(Duration::from_secs(5)).expect("backlog").text,
        "early two"
    );

    cluster.stop();
}

#[test]
fn subscription_exclusivity_and_stuck_release() {
    let cluster = TestCluster::launch(&["A", "B"]);
    let mut conn = cluster.connector();
    assert!(create(&mut conn, "mark").success());

    // A silent subscriber that will never answer pings.
    let primary = conn.primary().expect("connected").clone();
    let silent = TcpStream::connect(primary.notif_addr()).expect("notif connects");
    write_frame(&mut silent.try_clone().expect("clone"), "mark").expect("send id");
    let mut reader = FrameReader::new(silent.try_clone().expect("clone"));
    let verdict = Response::unmarshal(&reader.read_frame().expect("verdict").expect("frame"))
        .expect("well-formed verdict");
    assert!(verdict.success(), "first subscription wins");

    // While that registration lives, the id is taken.
    match conn.subscribe(&uid("mark")) {
        Err(ClientError::SubscriptionRefused(reason)) => {
            assert!(reason.contains(ALREADY_LOGGED_IN));
        }
        other => panic!("expected refusal, got {other:?}"),
    }

    // Drop the TCP connection without a word. The ping check must free
    // the id within a couple of dequeue timeouts.
    drop(reader);
    drop(silent);
    let deadline = Instant::now() + Duration::from_secs(15);
    let sub: Subscription = loop {
        match conn.subscribe(&uid("mark")) {
            Ok(sub) => break sub,
            Err(_) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(500));
            }
            Err(err) => panic!("stuck subscriber never released: {err}"),
        }
    };

    // And the fresh subscription actually works.
    assert!(create(&mut conn, "ream").success());
    assert!(send_chat(&mut conn, "ream", "mark", "you there?").success());
    assert_eq!(
        sub.recv_timeout(Duration::from_secs(5)).expect("delivery").text,
        "you there?"
    );

    cluster.stop();
}

#[test]
fn failover_preserves_chats_and_elects_the_next_name() {
    let cluster = TestCluster::launch(&["A", "B", "C"]);
    let mut conn = cluster.connector();
    assert_eq!(conn.primary().expect("connected").name, "A");

    assert!(create(&mut conn, "mark").success());
    assert!(send_chat(&mut conn, "mark", "mark", "hi").success());
    assert!(conn.ping_primary(), "a live primary answers heartbeats");

    // Crash the primary out from under the client.
    fallover(&mut conn);

    // The next request rides the reconnect loop to the new primary and
    // sees the replicated chat exactly once.
    let after = logs(&mut conn, "mark", "", 0);
    assert_eq!(after, vec!["hi"]);
    assert_eq!(conn.primary().expect("reconnected").name, "B");

    // The new primary serves writes.
    assert!(create(&mut conn, "ream").success());
    assert!(send_chat(&mut conn, "ream", "mark", "after failover").success());
    assert_eq!(logs(&mut conn, "mark", "", 0), vec!["after failover", "hi"]);

    cluster.stop();
}

#[test]
fn failover_does_not_redeliver_notified_chats() {
    let cluster = TestCluster::launch(&["A", "B"]);
    let mut conn = cluster.connector();

    assert!(create(&mut conn, "ream").success());
    assert!(create(&mut conn, "mark").success());

    // Two chats queue up for an unsubscribed recipient, then a notif
    // record consumes the first — replicated to the backup like any op.
    assert!(send_chat(&mut conn, "ream", "mark", "seen").success());
    assert!(send_chat(&mut conn, "ream", "mark", "unseen").success());
    assert!(
        conn.send_request(&Request::Op(Op::Notif { user: uid("mark") }))
            .expect("request completes")
            .success()
    );

    // Over-draining refuses.
    let empty = conn
        .send_request(&Request::Op(Op::Notif { user: uid("ream") }))
        .expect("request completes");
    assert!(!empty.success());

    // The backup takes over; only the un-notified remainder may be
    // delivered.
    fallover(&mut conn);
    assert_eq!(logs(&mut conn, "mark", "", 0), vec!["unseen", "seen"]);
    let sub = conn.subscribe(&uid("mark")).expect("subscription accepted");
    assert_eq!(
        sub.recv_timeout(Duration::from_secs(5)).expect("remainder").text,
        "unseen"
    );
    assert!(
        sub.recv_timeout(Duration::from_secs(2)).is_err(),
        "an already-notified chat must not be re-delivered"
    );

    cluster.stop();
}

#[test]
fn lagging_replica_catches_up_and_logs_converge() {
    // Seed A's log before boot; B starts empty and must reconcile.
    let data = TempDir::new().expect("temp data dir");
    let cfg = cluster_config(&["A", "B"], &data);
    {
        let (mut log, _) = OpLog::open(cfg.log_path("A")).expect("seed log");
        for op in [
            Op::Create { user: uid("mark") },
            Op::Create { user: uid("ream") },
            Op::Send {
                author: uid("ream"),
                recipient: uid("mark"),
                text: "hi".into(),
            },
        ] {
            log.append(&op).expect("seed append");
        }
    }

    let cluster = TestCluster::launch_with(cfg.clone(), data, &["A", "B"]);
    let mut conn = cluster.connector();

    // A leads and already serves the seeded state.
    assert_eq!(logs(&mut conn, "mark", "", 0), vec!["hi"]);

    // Kill A; B must have caught up at boot and now serves the same
    // state.
    fallover(&mut conn);
    assert_eq!(logs(&mut conn, "mark", "", 0), vec!["hi"]);
    assert_eq!(conn.primary().expect("reconnected").name, "B");

    // After a full stop the two log files are byte-identical.
    let data = cluster.stop();
    let a = std::fs::read(cfg.log_path("A")).expect("A log");
    let b = std::fs::read(cfg.log_path("B")).expect("B log");
    assert!(!a.is_empty());
    assert_eq!(a, b);
    drop(data);
}

#[test]
fn replicated_logs_converge_after_a_workload() {
    let cluster = TestCluster::launch(&["A", "B", "C"]);
    let mut conn = cluster.connector();

    for user in ["ream", "mark"] {
        assert!(create(&mut conn, user).success());
    }
    for i in 0..5 {
        assert!(send_chat(&mut conn, "ream", "mark", &format!("m{i}")).success());
    }
    // Queries must not widen the logs.
    let _ = list(&mut conn, "", 0);
    let _ = logs(&mut conn, "mark", "", 0);

    // Give the backups a beat to drain the broadcast channel.
    std::thread::sleep(Duration::from_secs(1));

    let cfg = cluster.cfg.clone();
    let data = cluster.stop();
    let a = std::fs::read(cfg.log_path("A")).expect("A log");
    let b = std::fs::read(cfg.log_path("B")).expect("B log");
    let c = std::fs::read(cfg.log_path("C")).expect("C log");
    assert_eq!(a, b);
    assert_eq!(b, c);
    // 2 creates + 5 sends, one line each.
    assert_eq!(a.iter().filter(|&&byte| byte == b'\n').count(), 7);
    drop(data);
}

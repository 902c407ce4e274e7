//! The HEALTH channel: heartbeat answering and sibling probing.
//!
//! Liveness is detected out of band from replication. Each replica
//! answers one-shot heartbeat connections on its HEALTH port, and a probe
//! thread walks the living siblings every two seconds, removing the ones
//! that stop answering. After every probe pass the primacy rule is
//! re-evaluated: the lexicographically first replica of the living set
//! leads, and a false→true transition pushes the takeover sentinel onto
//! the intake queue.

use std::io::Read;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use palaver_config::ReplicaSpec;
use palaver_wire::{Response, write_frame};

use crate::error::ReplicaResult;
use crate::intake::Intake;
use crate::view::{ClusterView, Shutdown};

/// Time between probe passes, and the per-probe connect/read deadline.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(2);

/// Starts the HEALTH listener: accept, read whatever arrives, answer one
/// ping, close.
pub fn spawn_listener(spec: &ReplicaSpec, shutdown: Shutdown) -> ReplicaResult<JoinHandle<()>> {
    let listener = TcpListener::bind(spec.health_addr())?;
    listener.set_nonblocking(true)?;
    info!(replica = %spec.name, addr = %spec.health_addr(), "health listener up");

    let handle = thread::Builder::new()
        .name("health-listen".into())
        .spawn(move || {
            while !shutdown.is_triggered() {
                match listener.accept() {
                    Ok((mut stream, _)) => answer_probe(&mut stream),
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        warn!(%e, "health accept failed");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

fn answer_probe(stream: &mut TcpStream) {
    let _ = stream.set_read_timeout(Some(PROBE_INTERVAL));
    let mut scratch = [0u8; 64];
    let _ = stream.read(&mut scratch);
    if let Ok(line) = Response::Ping.marshal() {
        let _ = write_frame(stream, &line);
    }
    // Dropping the stream closes the one-shot connection.
}

/// Starts the probe thread over the configured siblings.
pub fn spawn_probe(
    siblings: Vec<ReplicaSpec>,
    view: std::sync::Arc<ClusterView>,
    intake: Sender<Intake>,
    shutdown: Shutdown,
) -> ReplicaResult<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("health-probe".into())
        .spawn(move || {
            // First pass only after one full interval, giving the rest of
            // the cluster time to open its listeners.
            while shutdown.sleep_unless_triggered(PROBE_INTERVAL) {
                for sibling in &siblings {
                    let name = sibling.name();
                    if !view.is_living(&name) {
                        continue;
                    }
                    if !probe_once(sibling) {
                        warn!(replica = %view.self_name(), peer = %name, "sibling is dead");
                        view.remove_sibling(&name);
                    }
                }
                if view.recompute_primary() {
                    info!(replica = %view.self_name(), "this replica is now primary");
                    let _ = intake.send(Intake::Takeover);
                }
            }
        })?;
    Ok(handle)
}

/// One connect–send–receive round against a sibling's HEALTH port.
fn probe_once(sibling: &ReplicaSpec) -> bool {
    let Ok(mut addrs) = sibling.health_addr().to_socket_addrs() else {
        return false;
    };
    let Some(addr) = addrs.next() else {
        return false;
    };
    let Ok(mut stream) = TcpStream::connect_timeout(&addr, PROBE_INTERVAL) else {
        return false;
    };
    if stream.set_read_timeout(Some(PROBE_INTERVAL)).is_err()
        || stream.set_write_timeout(Some(PROBE_INTERVAL)).is_err()
    {
        return false;
    }

    let Ok(line) = Response::Ping.marshal() else {
        return false;
    };
    if write_frame(&mut stream, &line).is_err() {
        return false;
    }

    let mut scratch = [0u8; 64];
    match stream.read(&mut scratch) {
        Ok(n) if n > 0 => {
            debug!(peer = %sibling.name, "sibling answered probe");
            true
        }
        _ => false,
    }
}

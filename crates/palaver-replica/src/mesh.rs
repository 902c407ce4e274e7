//! The INTERNAL peer mesh.
//!
//! At boot every replica simultaneously listens for its
//! lexicographically-greater peers and dials its smaller ones, so each
//! pair of replicas shares exactly one channel. The first frame in each
//! direction is the [`Handshake`] carrying the sender's name and log
//! progress; both sides record the peer's progress for catch-up.
//!
//! After setup, one consumer thread per peer decodes [`PeerFrame`]s:
//! replicated operations go onto the intake queue, slice requests are
//! answered from the durable log over the same channel.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use palaver_config::{PalaverConfig, ReplicaSpec};
use palaver_types::{Progress, ReplicaName};
use palaver_wire::{FrameReader, Handshake, Op, PeerFrame, WireError, write_frame};

use crate::error::{ReplicaError, ReplicaResult};
use crate::intake::Intake;
use crate::store::Store;
use crate::view::Shutdown;

/// Redial delay while a peer is still coming up.
const DIAL_RETRY: Duration = Duration::from_secs(1);

/// How long a freshly-connected peer gets to introduce itself.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumers wake this often to honour the shutdown flag.
const CONSUME_TIMEOUT: Duration = Duration::from_secs(1);

/// A fully-established channel to one peer.
struct PeerChannel {
    name: ReplicaName,
    progress: Progress,
    reader: FrameReader<TcpStream>,
    writer: TcpStream,
}

/// The established mesh of INTERNAL channels.
pub struct PeerMesh {
    self_name: ReplicaName,
    writers: Mutex<HashMap<ReplicaName, Arc<Mutex<TcpStream>>>>,
    readers: Mutex<Vec<(ReplicaName, FrameReader<TcpStream>)>>,
    progress: Mutex<HashMap<ReplicaName, Progress>>,
}

impl PeerMesh {
    /// Brings up every INTERNAL channel: accepts exactly `num_listens`
    /// inbound peers while dialing each configured smaller name until it
    /// answers. Blocks until the mesh is complete (or shutdown).
    pub fn establish(
        cfg: &PalaverConfig,
        self_spec: &ReplicaSpec,
        own_progress: Progress,
        shutdown: &Shutdown,
    ) -> ReplicaResult<PeerMesh> {
        let self_name = self_spec.name();
        let num_listens = cfg.num_listens(&self_spec.name);
        let dial_targets: Vec<ReplicaSpec> =
            cfg.dial_targets(&self_spec.name).into_iter().cloned().collect();
        let expected = num_listens + dial_targets.len();

        let hello = Handshake {
            name: self_name.clone(),
            progress: own_progress,
        };
        let (tx, rx) = crossbeam_channel::unbounded::<ReplicaResult<PeerChannel>>();

        let listener = TcpListener::bind(self_spec.internal_addr())?;
        listener.set_nonblocking(true)?;
        info!(replica = %self_name, addr = %self_spec.internal_addr(), "internal listener up");

        let accept_handle = {
            let tx = tx.clone();
            let hello = hello.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("mesh-accept".into())
                .spawn(move || accept_peers(&listener, num_listens, &hello, &tx, &shutdown))?
        };
        let dial_handle = {
            let tx = tx.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("mesh-dial".into())
                .spawn(move || dial_peers(&dial_targets, &hello, &tx, &shutdown))?
        };
        drop(tx);

        let mut channels = Vec::with_capacity(expected);
        while channels.len() < expected {
            match rx.recv_timeout(Duration::from_millis(250)) {
                Ok(Ok(channel)) => channels.push(channel),
                Ok(Err(err)) => return Err(err),
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                    if shutdown.is_triggered() {
                        return Err(ReplicaError::ShutdownDuringBoot);
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                    return Err(ReplicaError::ShutdownDuringBoot);
                }
            }
        }
        let _ = accept_handle.join();
        let _ = dial_handle.join();

        let mut writers = HashMap::new();
        let mut readers = Vec::new();
        let mut progress = HashMap::new();
        for channel in channels {
            info!(
                replica = %self_name,
                peer = %channel.name,
                peer_progress = %channel.progress,
                "internal channel up"
            );
            progress.insert(channel.name.clone(), channel.progress);
            writers.insert(channel.name.clone(), Arc::new(Mutex::new(channel.writer)));
            readers.push((channel.name, channel.reader));
        }

        Ok(PeerMesh {
            self_name,
            writers: Mutex::new(writers),
            readers: Mutex::new(readers),
            progress: Mutex::new(progress),
        })
    }

    /// The progress each peer advertised in its handshake.
    pub fn peer_progress(&self) -> HashMap<ReplicaName, Progress> {
        self.progress
            .lock()
            .expect("progress-map mutex poisoned")
            .clone()
    }

    /// Peers with a currently-usable channel.
    pub fn connected_peers(&self) -> Vec<ReplicaName> {
        self.writers
            .lock()
            .expect("peer-socket mutex poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Starts one consumer thread per established channel. Consumed
    /// operations land on `intake`; slice requests are served from
    /// `store` over the requesting peer's channel.
    pub fn start_consumers(
        mesh: &Arc<PeerMesh>,
        store: Arc<Store>,
        intake: Sender<Intake>,
        shutdown: Shutdown,
    ) -> ReplicaResult<()> {
        let readers: Vec<(ReplicaName, FrameReader<TcpStream>)> = mesh
            .readers
            .lock()
            .expect("peer-socket mutex poisoned")
            .drain(..)
            .collect();

        for (peer, reader) in readers {
            let mesh = Arc::clone(mesh);
            let store = Arc::clone(&store);
            let intake = intake.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("peer-consume-{peer}"))
                .spawn(move || {
                    mesh.consume_from(&peer, reader, &store, &intake, &shutdown);
                })?;
        }
        Ok(())
    }

    fn consume_from(
        &self,
        peer: &ReplicaName,
        mut reader: FrameReader<TcpStream>,
        store: &Store,
        intake: &Sender<Intake>,
        shutdown: &Shutdown,
    ) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match reader.read_frame() {
                Ok(Some(line)) => match PeerFrame::unmarshal(&line) {
                    Ok(PeerFrame::Op(op)) => {
                        debug!(%peer, op = op.tag(), "replicated op received");
                        if intake.send(Intake::Replicated(op)).is_err() {
                            break;
                        }
                    }
                    Ok(PeerFrame::SliceRequest { lo, hi }) => {
                        self.serve_slice(peer, store, lo, hi);
                    }
                    Err(err) => {
                        warn!(%peer, %err, "malformed peer record; closing channel");
                        break;
                    }
                },
                Ok(None) => {
                    info!(%peer, "peer closed internal channel");
                    break;
                }
                Err(WireError::Io(ref e)) if is_timeout(e) => {}
                Err(err) => {
                    warn!(%peer, %err, "peer channel failed");
                    break;
                }
            }
        }
        self.drop_peer(peer);
    }

    fn serve_slice(&self, peer: &ReplicaName, store: &Store, lo: u64, hi: u64) {
        match store.slice(lo, hi) {
            Ok(ops) => {
                info!(%peer, lo, hi, count = ops.len(), "serving catch-up slice");
                if let Err(err) = self.send_ops(peer, &ops) {
                    warn!(%peer, %err, "failed to send catch-up slice");
                }
            }
            Err(err) => warn!(%peer, lo, hi, %err, "unservable slice request"),
        }
    }

    /// Sends one operation to every living sibling. A write failure
    /// drops that peer's channel; the health monitor will confirm the
    /// death on its next probe.
    pub fn broadcast(&self, op: &Op, living: &std::collections::BTreeSet<ReplicaName>) {
        let line = match op.marshal() {
            Ok(line) => line,
            Err(err) => {
                warn!(%err, "unmarshalable op cannot be broadcast");
                return;
            }
        };
        for peer in living {
            if let Err(err) = self.write_line(peer, &line) {
                warn!(%peer, %err, "broadcast failed; dropping peer channel");
                self.drop_peer(peer);
            }
        }
        debug!(op = op.tag(), peers = living.len(), "op broadcast");
    }

    /// Sends a run of operations to one peer (catch-up push).
    pub fn send_ops(&self, peer: &ReplicaName, ops: &[Op]) -> ReplicaResult<()> {
        for op in ops {
            let frame = PeerFrame::Op(op.clone()).marshal()?;
            self.write_line(peer, &frame)?;
        }
        Ok(())
    }

    /// Asks `peer` for its logged operations at positions `[lo, hi)`.
    pub fn request_slice(&self, peer: &ReplicaName, lo: u64, hi: u64) -> ReplicaResult<()> {
        let frame = PeerFrame::SliceRequest { lo, hi }.marshal()?;
        self.write_line(peer, &frame)
    }

    fn write_line(&self, peer: &ReplicaName, line: &str) -> ReplicaResult<()> {
        let writer = {
            let writers = self.writers.lock().expect("peer-socket mutex poisoned");
            writers
                .get(peer)
                .cloned()
                .ok_or_else(|| ReplicaError::NoChannel(peer.clone()))?
        };
        let mut stream = writer.lock().expect("peer stream mutex poisoned");
        write_frame(&mut *stream, line)?;
        Ok(())
    }

    fn drop_peer(&self, peer: &ReplicaName) {
        let removed = self
            .writers
            .lock()
            .expect("peer-socket mutex poisoned")
            .remove(peer);
        if removed.is_some() {
            debug!(replica = %self.self_name, %peer, "peer channel dropped");
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn accept_peers(
    listener: &TcpListener,
    num_listens: usize,
    hello: &Handshake,
    tx: &Sender<ReplicaResult<PeerChannel>>,
    shutdown: &Shutdown,
) {
    let mut accepted = 0;
    while accepted < num_listens {
        if shutdown.is_triggered() {
            return;
        }
        match listener.accept() {
            Ok((stream, addr)) => match accept_handshake(stream, hello) {
                Ok(channel) => {
                    accepted += 1;
                    if tx.send(Ok(channel)).is_err() {
                        return;
                    }
                }
                // A connection that cannot introduce itself does not
                // consume one of the peer slots.
                Err(err) => warn!(%addr, %err, "inbound peer failed handshake"),
            },
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                let _ = tx.send(Err(e.into()));
                return;
            }
        }
    }
}

/// Acceptor side: the dialer speaks first, then we answer.
fn accept_handshake(stream: TcpStream, hello: &Handshake) -> ReplicaResult<PeerChannel> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = FrameReader::new(stream);

    let line = reader
        .read_frame()?
        .ok_or_else(|| WireError::Malformed("peer closed before handshake".into()))?;
    let theirs = Handshake::unmarshal(&line)?;
    write_frame(&mut writer, &hello.marshal()?)?;

    finish_handshake(theirs, reader, writer)
}

fn dial_peers(
    targets: &[ReplicaSpec],
    hello: &Handshake,
    tx: &Sender<ReplicaResult<PeerChannel>>,
    shutdown: &Shutdown,
) {
    for target in targets {
        loop {
            if shutdown.is_triggered() {
                return;
            }
            match TcpStream::connect(target.internal_addr()) {
                Ok(stream) => match dial_handshake(stream, &target.name(), hello) {
                    Ok(channel) => {
                        if tx.send(Ok(channel)).is_err() {
                            return;
                        }
                        break;
                    }
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                },
                Err(_) => {
                    debug!(peer = %target.name, "peer not up yet; retrying in 1 second");
                    if !shutdown.sleep_unless_triggered(DIAL_RETRY) {
                        return;
                    }
                }
            }
        }
    }
}

/// Dialer side: we speak first, then read the acceptor's answer.
fn dial_handshake(
    stream: TcpStream,
    expected: &ReplicaName,
    hello: &Handshake,
) -> ReplicaResult<PeerChannel> {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    write_frame(&mut writer, &hello.marshal()?)?;
    let mut reader = FrameReader::new(stream);

    let line = reader
        .read_frame()?
        .ok_or_else(|| WireError::Malformed("peer closed before handshake".into()))?;
    let theirs = Handshake::unmarshal(&line)?;
    if &theirs.name != expected {
        return Err(ReplicaError::PeerMismatch {
            expected: expected.clone(),
            actual: theirs.name,
        });
    }

    finish_handshake(theirs, reader, writer)
}

fn finish_handshake(
    theirs: Handshake,
    reader: FrameReader<TcpStream>,
    writer: TcpStream,
) -> ReplicaResult<PeerChannel> {
    // From here on, reads wake periodically so consumers can observe
    // shutdown. The timeout applies to the shared descriptor, which is
    // exactly what the consumer reads.
    writer.set_read_timeout(Some(CONSUME_TIMEOUT))?;
    Ok(PeerChannel {
        name: theirs.name,
        progress: theirs.progress,
        reader,
        writer,
    })
}

//! The client gateway: the CLIENT listener and its per-connection
//! handlers.
//!
//! Every accepted connection is greeted with a basic response whose
//! success flag is the replica's current primacy; the client connector
//! reads this probe to find the primary. Handlers keep reading framed
//! requests even while not primary, answering each with the not-primary
//! refusal (the connector drops and re-searches anyway; keeping the
//! socket open is the documented choice).

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use palaver_config::ReplicaSpec;
use palaver_replica::{ClusterView, Shutdown};
use palaver_types::UserId;
use palaver_wire::{FrameReader, Request, Response, WireError, write_frame};

use crate::dispatch::Command;
use crate::error::ServerResult;

/// Handlers wake this often to honour the shutdown flag.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The not-primary refusal text, also used in the greeting.
pub const NOT_PRIMARY: &str = "Error: Not primary";

/// Connected client sockets, keyed by connection id, so the dispatcher
/// can route a response back to the socket its request arrived on.
pub struct ClientTable {
    next_id: AtomicU64,
    sockets: Mutex<HashMap<u64, Arc<Mutex<TcpStream>>>>,
}

impl ClientTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            sockets: Mutex::new(HashMap::new()),
        }
    }

    fn register(&self, stream: TcpStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sockets
            .lock()
            .expect("client-socket mutex poisoned")
            .insert(id, Arc::new(Mutex::new(stream)));
        id
    }

    fn deregister(&self, id: u64) {
        self.sockets
            .lock()
            .expect("client-socket mutex poisoned")
            .remove(&id);
    }

    /// Writes a response to the connection it belongs to. A vanished or
    /// broken socket is not an error: the client has moved on.
    pub fn respond(&self, id: u64, response: &Response) {
        let socket = {
            let sockets = self.sockets.lock().expect("client-socket mutex poisoned");
            sockets.get(&id).cloned()
        };
        let Some(socket) = socket else {
            debug!(conn = id, "client gone before response");
            return;
        };
        let line = match response.marshal() {
            Ok(line) => line,
            Err(err) => {
                warn!(conn = id, %err, "unmarshalable response dropped");
                return;
            }
        };
        let mut stream = socket.lock().expect("client stream mutex poisoned");
        if let Err(err) = write_frame(&mut *stream, &line) {
            warn!(conn = id, %err, "client write failed");
        }
    }
}

impl Default for ClientTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the CLIENT listener.
pub fn spawn(
    spec: &ReplicaSpec,
    view: Arc<ClusterView>,
    table: Arc<ClientTable>,
    commands: Sender<Command>,
    shutdown: Shutdown,
) -> ServerResult<JoinHandle<()>> {
    let listener = TcpListener::bind(spec.client_addr())?;
    listener.set_nonblocking(true)?;
    info!(replica = %spec.name, addr = %spec.client_addr(), "client gateway up");

    let handle = thread::Builder::new()
        .name("client-listen".into())
        .spawn(move || {
            while !shutdown.is_triggered() {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        debug!(%addr, "client connected");
                        if let Err(err) =
                            admit(stream, &view, &table, &commands, &shutdown)
                        {
                            warn!(%addr, %err, "failed to admit client");
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        warn!(%e, "client accept failed");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// Greets a fresh connection with the primacy probe and hands it to its
/// handler thread.
fn admit(
    stream: TcpStream,
    view: &Arc<ClusterView>,
    table: &Arc<ClientTable>,
    commands: &Sender<Command>,
    shutdown: &Shutdown,
) -> ServerResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    let greeting = if view.is_primary() {
        Response::ok(UserId::unchecked(""))
    } else {
        Response::refusal(UserId::unchecked(""), NOT_PRIMARY)
    };
    let mut write_half = stream.try_clone()?;
    write_frame(&mut write_half, &greeting.marshal()?)?;

    let reader = FrameReader::new(stream);
    let conn_id = table.register(write_half);

    let view = Arc::clone(view);
    let table = Arc::clone(table);
    let commands = commands.clone();
    let shutdown = shutdown.clone();
    thread::Builder::new()
        .name(format!("client-conn-{conn_id}"))
        .spawn(move || {
            handle_client(conn_id, reader, &view, &table, &commands, &shutdown);
            table.deregister(conn_id);
        })?;
    Ok(())
}

fn handle_client(
    conn_id: u64,
    mut reader: FrameReader<TcpStream>,
    view: &ClusterView,
    table: &ClientTable,
    commands: &Sender<Command>,
    shutdown: &Shutdown,
) {
    loop {
        if shutdown.is_triggered() {
            return;
        }
        let line = match reader.read_frame() {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!(conn = conn_id, "client disconnected");
                return;
            }
            Err(WireError::Io(ref e)) if is_timeout(e) => continue,
            Err(err) => {
                debug!(conn = conn_id, %err, "client read failed");
                return;
            }
        };
        let request = match Request::unmarshal(&line) {
            Ok(request) => request,
            Err(err) => {
                // Codec failure closes the socket; the client is expected
                // to reconnect.
                warn!(conn = conn_id, %err, "malformed client record; closing");
                return;
            }
        };
        if !view.is_primary() {
            table.respond(
                conn_id,
                &Response::refusal(request.user().clone(), NOT_PRIMARY),
            );
            continue;
        }
        if commands
            .send(Command::Client { conn_id, request })
            .is_err()
        {
            return;
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

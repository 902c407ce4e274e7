//! The notification dispatcher: NOTIF subscriptions and real-time chat
//! delivery.
//!
//! A subscription claims a user id exclusively: the first frame on a
//! NOTIF connection is the id, and registration succeeds iff no live
//! subscriber holds it. Registration and seeding go through the
//! dispatcher (see `dispatch`), which is what makes the exclusivity
//! verdict and the backlog snapshot race-free: the dispatcher is the
//! only thread that touches the kernel queues and the registry together.
//!
//! Each subscriber has a delivery channel. On the primary the dispatcher
//! feeds it (seed on subscribe, takeover re-seed, and one push per
//! applied `send`); on backups it stays empty, so subscriber threads do
//! nothing but answer liveness pings until a takeover.

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, unbounded};
use tracing::{debug, info, warn};

use palaver_config::ReplicaSpec;
use palaver_replica::Shutdown;
use palaver_types::{Chat, UserId};
use palaver_wire::{FrameReader, Response, WireError, write_frame};

use crate::dispatch::Command;
use crate::error::ServerResult;

/// How long a subscriber may sit idle before a liveness ping.
const DEQUEUE_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a pinged subscriber gets to answer.
const PING_DEADLINE: Duration = Duration::from_secs(2);

/// Refusal text for a user id that already has a live subscription.
pub const ALREADY_LOGGED_IN: &str = "Already logged in";

struct Subscriber {
    generation: u64,
    chats: Sender<Chat>,
}

/// The registered NOTIF subscribers.
///
/// Mutated only by the dispatcher thread (register, deliver, seed,
/// disconnect) and by dying subscriber threads (release); the lock keeps
/// those two sides coherent.
pub struct NotifRegistry {
    inner: Mutex<HashMap<UserId, Subscriber>>,
    generations: std::sync::atomic::AtomicU64,
}

impl NotifRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            generations: std::sync::atomic::AtomicU64::new(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Subscriber>> {
        self.inner.lock().expect("notif-socket mutex poisoned")
    }

    /// Claims `user` for a new subscriber and seeds its channel with the
    /// given backlog (oldest first). Fails if the id is already held.
    ///
    /// Returns the delivery channel and the registration's generation,
    /// which the subscriber thread quotes back on release so a stale
    /// thread can never evict its successor.
    pub fn register(&self, user: &UserId, backlog: Vec<Chat>) -> Option<(Receiver<Chat>, u64)> {
        let mut inner = self.lock();
        if inner.contains_key(user) {
            return None;
        }
        let generation = self
            .generations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = unbounded();
        for chat in backlog {
            let _ = tx.send(chat);
        }
        inner.insert(
            user.clone(),
            Subscriber {
                generation,
                chats: tx,
            },
        );
        Some((rx, generation))
    }

    /// Pushes one applied chat to its recipient's subscriber, if any.
    /// An unsubscribed recipient keeps the chat queued in the kernel
    /// until a later subscription seeds it.
    pub fn deliver(&self, chat: &Chat) {
        let inner = self.lock();
        if let Some(subscriber) = inner.get(&chat.recipient) {
            let _ = subscriber.chats.send(chat.clone());
        }
    }

    /// Re-seeds one registered subscriber from a backlog snapshot
    /// (takeover path).
    pub fn seed(&self, user: &UserId, backlog: Vec<Chat>) {
        let inner = self.lock();
        if let Some(subscriber) = inner.get(user) {
            for chat in backlog {
                let _ = subscriber.chats.send(chat);
            }
        }
    }

    /// Snapshot of the currently-registered user ids.
    pub fn users(&self) -> Vec<UserId> {
        self.lock().keys().cloned().collect()
    }

    /// Drops a registration (account deleted, or replica shutting down).
    /// Closing the channel unblocks the subscriber thread, which closes
    /// the socket on its way out.
    pub fn disconnect(&self, user: &UserId) {
        if self.lock().remove(user).is_some() {
            debug!(%user, "notif registration dropped");
        }
    }

    /// Releases a registration from its own subscriber thread. No-op if
    /// the slot was already re-claimed by a newer subscription.
    fn release(&self, user: &UserId, generation: u64) {
        let mut inner = self.lock();
        if inner.get(user).is_some_and(|s| s.generation == generation) {
            inner.remove(user);
        }
    }
}

impl Default for NotifRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts the NOTIF listener.
pub fn spawn(
    spec: &ReplicaSpec,
    registry: Arc<NotifRegistry>,
    commands: Sender<Command>,
    shutdown: Shutdown,
) -> ServerResult<JoinHandle<()>> {
    let listener = TcpListener::bind(spec.notif_addr())?;
    listener.set_nonblocking(true)?;
    info!(replica = %spec.name, addr = %spec.notif_addr(), "notif listener up");

    let handle = thread::Builder::new()
        .name("notif-listen".into())
        .spawn(move || {
            while !shutdown.is_triggered() {
                match listener.accept() {
                    Ok((stream, addr)) => {
                        let registry = Arc::clone(&registry);
                        let commands = commands.clone();
                        let shutdown = shutdown.clone();
                        let spawned = thread::Builder::new()
                            .name("notif-sub".into())
                            .spawn(move || {
                                if let Err(err) =
                                    subscribe(stream, &registry, &commands, &shutdown)
                                {
                                    debug!(%addr, %err, "subscription ended");
                                }
                            });
                        if let Err(err) = spawned {
                            warn!(%addr, %err, "failed to spawn subscriber thread");
                        }
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(Duration::from_millis(50));
                    }
                    Err(e) => {
                        warn!(%e, "notif accept failed");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// One subscription, start to finish: read the user id, ask the
/// dispatcher to register it, answer the verdict, then run delivery.
fn subscribe(
    stream: TcpStream,
    registry: &NotifRegistry,
    commands: &Sender<Command>,
    shutdown: &Shutdown,
) -> ServerResult<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(PING_DEADLINE))?;
    let mut writer = stream.try_clone()?;
    let mut reader = FrameReader::new(stream);

    let Some(first) = reader.read_frame()? else {
        return Ok(());
    };
    let user = UserId::unchecked(first.trim());

    let (done_tx, done_rx) = bounded(1);
    if commands
        .send(Command::Subscribe {
            user: user.clone(),
            done: done_tx,
        })
        .is_err()
    {
        return Ok(());
    }
    let granted = done_rx.recv().ok().flatten();

    let Some((chats, generation)) = granted else {
        write_frame(&mut writer, &Response::refusal(user, ALREADY_LOGGED_IN).marshal()?)?;
        return Ok(());
    };
    write_frame(&mut writer, &Response::ok(user.clone()).marshal()?)?;
    info!(%user, "subscriber registered");

    let result = deliver_loop(
        &user, &mut reader, &mut writer, &chats, commands, shutdown,
    );
    registry.release(&user, generation);
    info!(%user, "subscriber released");
    result
}

fn deliver_loop(
    user: &UserId,
    reader: &mut FrameReader<TcpStream>,
    writer: &mut TcpStream,
    chats: &Receiver<Chat>,
    commands: &Sender<Command>,
    shutdown: &Shutdown,
) -> ServerResult<()> {
    loop {
        if shutdown.is_triggered() {
            return Ok(());
        }
        match chats.recv_timeout(DEQUEUE_TIMEOUT) {
            Ok(chat) => {
                // Record the delivery durably and on every backup before
                // the subscriber sees the chat.
                let (done_tx, done_rx) = bounded(1);
                if commands
                    .send(Command::Notif {
                        user: user.clone(),
                        done: done_tx,
                    })
                    .is_err()
                {
                    return Ok(());
                }
                match done_rx.recv() {
                    Ok(true) => {
                        let response = Response::Notif {
                            user: user.clone(),
                            success: true,
                            error: String::new(),
                            chat,
                        };
                        write_frame(writer, &response.marshal()?)?;
                    }
                    // The queue no longer matched (account deleted out
                    // from under us); drop the stale chat.
                    Ok(false) => debug!(%user, "stale delivery dropped"),
                    Err(_) => return Ok(()),
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !ping_check(user, reader, writer)? {
                    warn!(%user, "subscriber is dead");
                    return Ok(());
                }
            }
            // Registration dropped (delete op or shutdown).
            Err(RecvTimeoutError::Disconnected) => return Ok(()),
        }
    }
}

/// Sends a ping and requires an answering ping within the deadline.
/// This is what releases a user id whose client vanished silently.
fn ping_check(
    user: &UserId,
    reader: &mut FrameReader<TcpStream>,
    writer: &mut TcpStream,
) -> ServerResult<bool> {
    write_frame(writer, &Response::Ping.marshal()?)?;
    match reader.read_frame() {
        Ok(Some(line)) => match Response::unmarshal(&line) {
            Ok(Response::Ping) => Ok(true),
            Ok(other) => {
                debug!(%user, ?other, "unexpected answer to ping");
                Ok(false)
            }
            Err(_) => Ok(false),
        },
        Ok(None) => Ok(false),
        Err(WireError::Io(ref e))
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Ok(false)
        }
        Err(err) => Err(err.into()),
    }
}

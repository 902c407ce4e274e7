//! The subscription channel: NOTIF registration and the background
//! watcher that answers pings and surfaces delivered chats.

use std::net::{TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::{debug, info};

use palaver_config::ReplicaSpec;
use palaver_types::{Chat, UserId};
use palaver_wire::{FrameReader, Response, write_frame};

use crate::error::{ClientError, ClientResult};

/// Deadline for the registration verdict.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The server pings every three seconds of silence; a stretch this long
/// without any frame means the primary is gone.
const SILENCE_LIMIT: Duration = Duration::from_secs(10);

/// A live NOTIF subscription.
///
/// Delivered chats arrive on [`Subscription::chats`]; the channel
/// disconnecting means the subscription was lost (server died, account
/// deleted, or ping exchange broke) and the embedder should re-subscribe
/// after the connector finds a primary again.
#[derive(Debug)]
pub struct Subscription {
    user: UserId,
    chats: Receiver<Chat>,
}

impl Subscription {
    /// Registers `user` on the given replica's NOTIF port and spawns the
    /// watcher thread.
    pub(crate) fn open(spec: &ReplicaSpec, user: &UserId) -> ClientResult<Subscription> {
        let addr = spec
            .notif_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::other("unresolvable replica address"))?;
        let stream = TcpStream::connect_timeout(&addr, SUBSCRIBE_TIMEOUT)?;
        stream.set_read_timeout(Some(SUBSCRIBE_TIMEOUT))?;
        let mut writer = stream.try_clone()?;
        let mut reader = FrameReader::new(stream);

        write_frame(&mut writer, user.as_str())?;
        let line = reader
            .read_frame()?
            .ok_or_else(|| std::io::Error::other("server closed during subscription"))?;
        let verdict = Response::unmarshal(&line)?;
        if !verdict.success() {
            let reason = match verdict {
                Response::Basic { error, .. } => error,
                _ => "unexpected subscription answer".to_string(),
            };
            return Err(ClientError::SubscriptionRefused(reason));
        }
        info!(%user, "subscribed");

        writer.set_read_timeout(Some(SILENCE_LIMIT))?;
        let (tx, rx) = unbounded();
        {
            let user = user.clone();
            thread::Builder::new()
                .name("notif-watch".into())
                .spawn(move || watch(&user, reader, writer, &tx))?;
        }

        Ok(Subscription {
            user: user.clone(),
            chats: rx,
        })
    }

    /// The subscribed user id.
    pub fn user(&self) -> &UserId {
        &self.user
    }

    /// The delivery channel.
    pub fn chats(&self) -> &Receiver<Chat> {
        &self.chats
    }

    /// Waits up to `timeout` for the next delivered chat. A
    /// `Disconnected` error means the subscription was lost.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Chat, RecvTimeoutError> {
        self.chats.recv_timeout(timeout)
    }
}

/// Interprets server frames until the channel dies: pings are answered,
/// notifs are forwarded to the delivery channel, anything else ends the
/// subscription.
fn watch(user: &UserId, mut reader: FrameReader<TcpStream>, mut writer: TcpStream, tx: &Sender<Chat>) {
    loop {
        let frame = match reader.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(%user, "server closed the subscription");
                return;
            }
            Err(err) => {
                debug!(%user, %err, "subscription channel failed");
                return;
            }
        };
        match Response::unmarshal(&frame) {
            Ok(Response::Ping) => {
                let Ok(line) = Response::Ping.marshal() else {
                    return;
                };
                if write_frame(&mut writer, &line).is_err() {
                    debug!(%user, "ping answer failed");
                    return;
                }
            }
            Ok(Response::Notif {
                success: true,
                chat,
                ..
            }) => {
                if tx.send(chat).is_err() {
                    // Embedder dropped the subscription.
                    return;
                }
            }
            Ok(other) => {
                debug!(%user, ?other, "unexpected frame on subscription channel");
                return;
            }
            Err(err) => {
                debug!(%user, %err, "malformed frame on subscription channel");
                return;
            }
        }
    }
}

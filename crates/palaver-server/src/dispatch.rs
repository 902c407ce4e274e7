//! The dispatch loop: the single thread that orders every state
//! transition of a replica.
//!
//! A replica starts in backup mode, draining the replication intake
//! queue. The takeover sentinel switches the loop to primary mode, where
//! it drains the command queue instead: client requests from the
//! gateway, delivery records from the subscriber threads, and
//! subscription registrations. The switch is one-way — a replica that
//! has led only stops leading by dying.
//!
//! Serializing subscriptions and deliveries through the same thread as
//! the kernel mutations is what keeps the delivery channels exactly in
//! step with the kernel's undelivered queues.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, info, warn};

use palaver_kernel::{Effect, list_accounts, user_logs};
use palaver_replica::{ClusterView, CommitOutcome, Intake, Shutdown, Store};
use palaver_replica::mesh::PeerMesh;
use palaver_types::{Chat, UserId};
use palaver_wire::{Op, Request, Response};

use crate::error::ServerResult;
use crate::gateway::{ClientTable, NOT_PRIMARY};
use crate::notif::NotifRegistry;

/// How often the loops wake to honour the shutdown flag.
const IDLE_TICK: Duration = Duration::from_millis(250);

/// One item on the command queue (the primary-mode input source).
pub enum Command {
    /// A framed request from a client connection, tagged with the socket
    /// it arrived on so the response can be routed back.
    Client { conn_id: u64, request: Request },

    /// A subscriber thread dequeued a chat: record the delivery (append
    /// + broadcast) before the push. `done` carries the verdict.
    Notif { user: UserId, done: Sender<bool> },

    /// A fresh NOTIF connection wants to claim `user`. On success the
    /// subscriber receives its delivery channel, seeded with the user's
    /// undelivered backlog when this replica is primary.
    Subscribe {
        user: UserId,
        done: Sender<Option<(Receiver<Chat>, u64)>>,
    },
}

/// The dispatcher owns every shared component it mutates.
pub struct Dispatcher {
    store: Arc<Store>,
    mesh: Arc<PeerMesh>,
    view: Arc<ClusterView>,
    table: Arc<ClientTable>,
    registry: Arc<NotifRegistry>,
    commands: Receiver<Command>,
    intake: Receiver<Intake>,
    shutdown: Shutdown,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        mesh: Arc<PeerMesh>,
        view: Arc<ClusterView>,
        table: Arc<ClientTable>,
        registry: Arc<NotifRegistry>,
        commands: Receiver<Command>,
        intake: Receiver<Intake>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            store,
            mesh,
            view,
            table,
            registry,
            commands,
            intake,
            shutdown,
        }
    }

    /// Runs the dispatch loop to completion. `deferred` holds intake
    /// items the catch-up coordinator drained past. Returns when the
    /// replica shuts down; a log failure aborts with the error (fatal).
    pub fn run(&self, deferred: Vec<Intake>) -> ServerResult<()> {
        let mut primary = false;
        for item in deferred {
            match item {
                Intake::Replicated(op) => self.apply_replicated(&op)?,
                Intake::Takeover => {
                    self.become_primary();
                    primary = true;
                }
            }
        }
        if !primary {
            primary = self.backup_loop()?;
        }
        if primary {
            self.primary_loop()?;
        }
        Ok(())
    }

    /// Backup mode: apply what the primary replicates, until takeover.
    /// Returns `true` on takeover, `false` on shutdown.
    fn backup_loop(&self) -> ServerResult<bool> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(false);
            }
            select! {
                recv(self.intake) -> item => match item {
                    Ok(Intake::Replicated(op)) => self.apply_replicated(&op)?,
                    Ok(Intake::Takeover) => {
                        self.become_primary();
                        return Ok(true);
                    }
                    Err(_) => return Ok(false),
                },
                recv(self.commands) -> command => match command {
                    Ok(command) => self.serve_as_backup(command),
                    Err(_) => return Ok(false),
                },
                default(IDLE_TICK) => {}
            }
        }
    }

    /// Primary mode: serve the command queue until shutdown.
    fn primary_loop(&self) -> ServerResult<()> {
        loop {
            if self.shutdown.is_triggered() {
                return Ok(());
            }
            match self.commands.recv_timeout(IDLE_TICK) {
                Ok(command) => {
                    if !self.serve_as_primary(command)? {
                        return Ok(());
                    }
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return Ok(()),
            }
        }
    }

    /// An operation replicated from the primary: apply and log it. A
    /// refusal here means this replica's state diverged from the
    /// primary's; it is loud but not fatal.
    fn apply_replicated(&self, op: &Op) -> ServerResult<()> {
        match self.store.commit(op)? {
            CommitOutcome::Applied(effects) => {
                debug!(op = op.tag(), progress = %self.store.progress(), "replicated op applied");
                // Backups do not deliver; their subscribers are fed only
                // by the takeover re-seed.
                self.execute(effects, false);
            }
            CommitOutcome::Refused(refusal) => {
                warn!(op = op.tag(), %refusal, "replicated op refused; state diverged");
            }
        }
        Ok(())
    }

    /// The few commands a backup can serve. Client requests only land
    /// here when the gateway raced a primacy change.
    fn serve_as_backup(&self, command: Command) {
        match command {
            Command::Client { conn_id, request } => {
                self.table.respond(
                    conn_id,
                    &Response::refusal(request.user().clone(), NOT_PRIMARY),
                );
            }
            Command::Notif { done, .. } => {
                let _ = done.send(false);
            }
            Command::Subscribe { user, done } => {
                let _ = done.send(self.registry.register(&user, Vec::new()));
            }
        }
    }

    /// Switches to the client-facing input source and re-seeds every
    /// registered subscriber from the kernel's undelivered queues: those
    /// hold exactly the chats the old primary never recorded a `notif`
    /// for, so nothing is re-delivered and nothing is dropped.
    fn become_primary(&self) {
        info!("switching dispatch source to the client gateway");
        for user in self.registry.users() {
            let backlog = self.undelivered_backlog(&user);
            if !backlog.is_empty() {
                info!(%user, count = backlog.len(), "re-seeding subscriber after takeover");
                self.registry.seed(&user, backlog);
            }
        }
    }

    /// Serves one command as primary. Returns `false` when the replica
    /// should stop (fallover).
    fn serve_as_primary(&self, command: Command) -> ServerResult<bool> {
        match command {
            Command::Client { conn_id, request } => match request {
                Request::Op(op) => {
                    let response = self.commit_as_primary(&op)?;
                    self.table.respond(conn_id, &response);
                }
                Request::List {
                    user,
                    wildcard,
                    page,
                } => {
                    let accounts = self
                        .store
                        .with_state(|state| list_accounts(state, &wildcard, page));
                    self.table.respond(
                        conn_id,
                        &Response::List {
                            user,
                            success: true,
                            error: String::new(),
                            accounts,
                        },
                    );
                }
                Request::Logs {
                    user,
                    wildcard,
                    page,
                } => {
                    let result = self
                        .store
                        .with_state(|state| user_logs(state, &user, &wildcard, page));
                    let response = match result {
                        Ok(chats) => Response::Logs {
                            user,
                            success: true,
                            error: String::new(),
                            chats,
                        },
                        Err(refusal) => Response::refusal(user, refusal.to_string()),
                    };
                    self.table.respond(conn_id, &response);
                }
                Request::Fallover { user } => {
                    info!("fallover requested; shutting down");
                    self.table.respond(conn_id, &Response::ok(user));
                    self.shutdown.trigger();
                    return Ok(false);
                }
            },

            Command::Notif { user, done } => {
                let op = Op::Notif { user };
                match self.store.commit(&op)? {
                    CommitOutcome::Applied(_) => {
                        self.mesh.broadcast(&op, &self.view.living());
                        let _ = done.send(true);
                    }
                    CommitOutcome::Refused(refusal) => {
                        warn!(%refusal, "delivery no longer matches the queue");
                        let _ = done.send(false);
                    }
                }
            }

            Command::Subscribe { user, done } => {
                let backlog = self.undelivered_backlog(&user);
                let _ = done.send(self.registry.register(&user, backlog));
            }
        }
        Ok(true)
    }

    /// The primary path for an important op: apply, durably append,
    /// broadcast to the living siblings, then execute delivery effects.
    fn commit_as_primary(&self, op: &Op) -> ServerResult<Response> {
        let user = op.user().clone();
        match self.store.commit(op)? {
            CommitOutcome::Applied(effects) => {
                self.mesh.broadcast(op, &self.view.living());
                self.execute(effects, true);
                Ok(Response::ok(user))
            }
            CommitOutcome::Refused(refusal) => Ok(Response::refusal(user, refusal.to_string())),
        }
    }

    fn execute(&self, effects: Vec<Effect>, deliver: bool) {
        for effect in effects {
            match effect {
                Effect::Deliver { chat } => {
                    if deliver {
                        self.registry.deliver(&chat);
                    }
                }
                Effect::Disconnect { user } => self.registry.disconnect(&user),
            }
        }
    }

    fn undelivered_backlog(&self, user: &UserId) -> Vec<Chat> {
        self.store
            .with_state(|state| state.undelivered(user).cloned().collect())
    }
}

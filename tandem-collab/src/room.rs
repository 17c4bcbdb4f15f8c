//! One actor task per document.
//!
//! ```text
//! connection tasks ──RoomCommand──► mpsc ──► RoomActor ─┬─ DocumentState
//!        ▲                                              ├─ PresenceTable
//!        │                                              ├─ DocumentStore
//!        └──────────── Arc<RoomEvent> ◄── broadcast ◄───┘
//! ```
//!
//! The actor is the only code that touches a document, so submissions,
//! subscriptions and presence changes are totally ordered without locks.
//! When the last member leaves, the room snapshots its state. With a store
//! behind it, an idle room whose snapshot succeeded then stops and removes
//! itself from the manager; the next subscriber reloads it from the store.
//! Without a store the room is the only copy of the document and stays
//! resident.

use std::collections::HashMap;
use std::sync::Arc;

use tandem_core::Operation;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::broadcast::{BroadcastGroup, BroadcastStats, RoomEvent, RoomReceiver};
use crate::document::{DocumentState, LoggedOp, SubmitError};
use crate::presence::{PresenceEntry, PresenceTable};
use crate::protocol::{ConnectionId, DocumentKey};
use crate::storage::{DocumentStore, StoredSnapshot};

type Registry = Arc<RwLock<HashMap<DocumentKey, RoomHandle>>>;

/// Subscribe attempts against a room that stopped between lookup and join.
const SUBSCRIBE_ATTEMPTS: usize = 3;

/// Per-room tuning.
#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Events a connection may fall behind before it must resync.
    pub broadcast_capacity: usize,
    /// Applied operations kept for rebasing late submissions.
    pub log_window: usize,
    /// Snapshot to the store every this many versions (0 = only when the
    /// room empties).
    pub snapshot_interval: u64,
    /// Queued commands per room.
    pub command_capacity: usize,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            log_window: 1_000,
            snapshot_interval: 100,
            command_capacity: 1_024,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("room {0} is closed")]
    Closed(DocumentKey),
}

/// A member's view of the room at the moment it joined.
#[derive(Debug)]
pub struct Subscription {
    pub events: RoomReceiver,
    pub version: u64,
    pub content: String,
    /// Everyone else's presence.
    pub presence: Vec<PresenceEntry>,
}

/// Read-only copy of a room's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub version: u64,
    pub content: String,
    pub members: usize,
    pub presence: usize,
    pub broadcast: BroadcastStats,
}

enum RoomCommand {
    Subscribe {
        connection: ConnectionId,
        reply: oneshot::Sender<Subscription>,
    },
    Submit {
        connection: ConnectionId,
        base_version: u64,
        op: Operation,
        reply: oneshot::Sender<Result<u64, SubmitError>>,
    },
    Cursor {
        connection: ConnectionId,
        start: usize,
        end: usize,
    },
    Leave {
        connection: ConnectionId,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Inspect {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Cheap, cloneable address of a room actor.
#[derive(Clone)]
pub struct RoomHandle {
    key: DocumentKey,
    commands: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The actor has stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn send(&self, command: RoomCommand) -> Result<(), RoomError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| RoomError::Closed(self.key.clone()))
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, RoomError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply)).await?;
        response.await.map_err(|_| RoomError::Closed(self.key.clone()))
    }

    /// Join the room, or rejoin it with a fresh receiver and snapshot.
    pub async fn subscribe(&self, connection: ConnectionId) -> Result<Subscription, RoomError> {
        self.request(|reply| RoomCommand::Subscribe { connection, reply })
            .await
    }

    /// Submit an operation. Returns the version it was applied at; the
    /// rebased op reaches every member, the submitter included, as a
    /// `RoomEvent::Applied`.
    pub async fn submit(
        &self,
        connection: ConnectionId,
        base_version: u64,
        op: Operation,
    ) -> Result<u64, RoomError> {
        self.request(|reply| RoomCommand::Submit {
            connection,
            base_version,
            op,
            reply,
        })
        .await?
        .map_err(RoomError::from)
    }

    pub async fn cursor(
        &self,
        connection: ConnectionId,
        start: usize,
        end: usize,
    ) -> Result<(), RoomError> {
        self.send(RoomCommand::Cursor {
            connection,
            start,
            end,
        })
        .await
    }

    /// Drop presence but stay subscribed.
    pub async fn leave(&self, connection: ConnectionId) -> Result<(), RoomError> {
        self.send(RoomCommand::Leave { connection }).await
    }

    /// The connection is gone: drop membership and presence.
    pub async fn disconnect(&self, connection: ConnectionId) -> Result<(), RoomError> {
        self.send(RoomCommand::Disconnect { connection }).await
    }

    pub async fn inspect(&self) -> Result<RoomSnapshot, RoomError> {
        self.request(|reply| RoomCommand::Inspect { reply }).await
    }
}

struct RoomActor {
    state: DocumentState,
    group: BroadcastGroup,
    presence: PresenceTable,
    store: Option<Arc<dyn DocumentStore>>,
    snapshot_interval: u64,
    /// Version of the last snapshot handed to the store.
    persisted_version: u64,
    /// The store missed an op; the next submit snapshots regardless of the
    /// interval so recovery never meets a gap in the log.
    snapshot_due: bool,
    /// Set when the room is idle and fully persisted.
    retire: bool,
    /// Manager map to unregister from on retirement. Only set with a store.
    registry: Option<Registry>,
    commands: mpsc::Receiver<RoomCommand>,
}

impl RoomActor {
    async fn run(mut self) {
        log::debug!(
            "Room {} started at version {}",
            self.state.key(),
            self.state.version()
        );
        while let Some(command) = self.commands.recv().await {
            self.handle(command);
            if self.retire {
                break;
            }
        }
        // Commands queued behind the retirement are dropped, so their
        // callers see `RoomError::Closed` and go through the manager again.
        self.commands.close();
        while self.commands.try_recv().is_ok() {}
        self.persist_snapshot();

        if let Some(registry) = &self.registry {
            let key = self.state.key();
            let mut rooms = registry.write().await;
            if rooms.get(key).is_some_and(RoomHandle::is_closed) {
                rooms.remove(key);
            }
        }
        log::debug!(
            "Room {} stopped at version {}",
            self.state.key(),
            self.state.version()
        );
    }

    fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Subscribe { connection, reply } => {
                let subscription = Subscription {
                    events: self.group.add_member(connection),
                    version: self.state.version(),
                    content: self.state.content().to_owned(),
                    presence: self.presence.others(&connection),
                };
                log::info!(
                    "Connection {connection} subscribed to {} at version {}",
                    self.state.key(),
                    subscription.version
                );
                if reply.send(subscription).is_err() {
                    self.drop_member(connection);
                }
            }

            RoomCommand::Submit {
                connection,
                base_version,
                op,
                reply,
            } => {
                let result = self.submit(connection, base_version, op);
                let _ = reply.send(result);
            }

            RoomCommand::Cursor {
                connection,
                start,
                end,
            } => {
                if !self.group.has_member(&connection) {
                    log::debug!("Ignoring cursor from non-member {connection}");
                    return;
                }
                let len = self.state.char_len();
                let entry = self.presence.update(connection, start.min(len), end.min(len));
                self.group.publish(RoomEvent::Presence(entry));
            }

            RoomCommand::Leave { connection } => self.remove_presence(connection),

            RoomCommand::Disconnect { connection } => self.drop_member(connection),

            RoomCommand::Inspect { reply } => {
                let _ = reply.send(RoomSnapshot {
                    version: self.state.version(),
                    content: self.state.content().to_owned(),
                    members: self.group.member_count(),
                    presence: self.presence.len(),
                    broadcast: self.group.stats(),
                });
            }
        }
    }

    fn submit(
        &mut self,
        connection: ConnectionId,
        base_version: u64,
        op: Operation,
    ) -> Result<u64, SubmitError> {
        let applied = match self.state.submit(connection, base_version, op) {
            Ok(applied) => applied,
            Err(e) => {
                match &e {
                    SubmitError::Malformed(_) => log::error!(
                        "Rejected operation from {connection} on {}: {e}",
                        self.state.key()
                    ),
                    SubmitError::Conflict { .. } => log::warn!(
                        "Conflict from {connection} on {}: {e}",
                        self.state.key()
                    ),
                }
                return Err(e);
            }
        };

        if applied.rebased_over > 0 {
            log::trace!(
                "Rebased op from {connection} over {} ops to version {}",
                applied.rebased_over,
                applied.version
            );
        }

        self.presence.transform(&applied.op, connection);

        if let Some(store) = &self.store {
            let logged = LoggedOp {
                version: applied.version,
                origin: connection,
                op: applied.op.clone(),
            };
            if let Err(e) = store.append_op(self.state.key(), &logged) {
                log::error!(
                    "Failed to persist version {} of {}: {e}",
                    applied.version,
                    self.state.key()
                );
                self.snapshot_due = true;
            }
        }
        if self.snapshot_due
            || (self.snapshot_interval > 0
                && applied.version - self.persisted_version >= self.snapshot_interval)
        {
            self.persist_snapshot();
        }

        self.group.publish(RoomEvent::Applied {
            origin: connection,
            version: applied.version,
            op: applied.op,
        });
        Ok(applied.version)
    }

    fn remove_presence(&mut self, connection: ConnectionId) {
        if self.presence.remove(&connection).is_some() {
            self.group.publish(RoomEvent::PresenceLeft(connection));
        }
    }

    fn drop_member(&mut self, connection: ConnectionId) {
        self.remove_presence(connection);
        if self.group.remove_member(&connection) {
            log::info!("Connection {connection} left {}", self.state.key());
        }
        if self.group.member_count() == 0 {
            self.persist_snapshot();
            self.retire = self.registry.is_some()
                && !self.snapshot_due
                && self.persisted_version == self.state.version();
        }
    }

    fn persist_snapshot(&mut self) {
        let Some(store) = &self.store else {
            return;
        };
        let version = self.state.version();
        if version == self.persisted_version {
            return;
        }
        let snapshot = StoredSnapshot {
            version,
            content: self.state.content().to_owned(),
        };
        let key = self.state.key();
        match store.save_snapshot(key, &snapshot) {
            Ok(()) => {
                self.persisted_version = version;
                self.snapshot_due = false;
                match store.compact_ops(key, version) {
                    Ok(removed) if removed > 0 => {
                        log::debug!("Compacted {removed} ops of {key} up to version {version}")
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Failed to compact ops of {key}: {e}"),
                }
            }
            Err(e) => log::error!("Failed to snapshot {key} at version {version}: {e}"),
        }
    }
}

/// Maps document keys to running room actors.
pub struct RoomManager {
    rooms: Registry,
    config: RoomConfig,
    store: Option<Arc<dyn DocumentStore>>,
}

impl RoomManager {
    pub fn new(config: RoomConfig, store: Option<Arc<dyn DocumentStore>>) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            config,
            store,
        }
    }

    /// Get the room for `key`, loading it from the store and spawning its
    /// actor on first use or after the previous actor retired.
    pub async fn get_or_spawn(&self, key: &DocumentKey) -> Result<RoomHandle, RoomError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key).filter(|r| !r.is_closed()) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key).filter(|r| !r.is_closed()) {
            return Ok(room.clone());
        }

        let state = self.load(key)?;
        let (commands, receiver) = mpsc::channel(self.config.command_capacity.max(1));
        let actor = RoomActor {
            persisted_version: state.version(),
            state,
            group: BroadcastGroup::new(self.config.broadcast_capacity),
            presence: PresenceTable::new(),
            store: self.store.clone(),
            snapshot_interval: self.config.snapshot_interval,
            snapshot_due: false,
            retire: false,
            registry: self.store.as_ref().map(|_| self.rooms.clone()),
            commands: receiver,
        };
        tokio::spawn(actor.run());

        let handle = RoomHandle {
            key: key.clone(),
            commands,
        };
        rooms.insert(key.clone(), handle.clone());
        Ok(handle)
    }

    /// Join the room for `key`, spawning it if needed. A room that retires
    /// between lookup and join is replaced and the join retried.
    pub async fn subscribe(
        &self,
        key: &DocumentKey,
        connection: ConnectionId,
    ) -> Result<(RoomHandle, Subscription), RoomError> {
        let mut attempt = 1;
        loop {
            let room = self.get_or_spawn(key).await?;
            match room.subscribe(connection).await {
                Ok(subscription) => return Ok((room, subscription)),
                Err(RoomError::Closed(_)) if attempt < SUBSCRIBE_ATTEMPTS => {
                    log::debug!("Room {key} closed during subscribe, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn load(&self, key: &DocumentKey) -> Result<DocumentState, RoomError> {
        let window = self.config.log_window;
        let Some(store) = &self.store else {
            return Ok(DocumentState::new(key.clone(), window));
        };
        let stored = match store.load(key) {
            Ok(stored) => stored,
            Err(e) => {
                // Starting empty would fork the document from what is on disk.
                log::error!("Failed to load {key}: {e}");
                return Err(RoomError::Closed(key.clone()));
            }
        };
        let state = DocumentState::recover(key.clone(), stored, window)?;
        if state.version() > 0 {
            log::info!("Recovered {key} at version {}", state.version());
        }
        Ok(state)
    }

    /// Rooms with a running actor.
    pub async fn room_count(&self) -> usize {
        self.rooms
            .read()
            .await
            .values()
            .filter(|r| !r.is_closed())
            .count()
    }

    pub async fn active_documents(&self) -> Vec<DocumentKey> {
        let mut keys: Vec<DocumentKey> = self
            .rooms
            .read()
            .await
            .iter()
            .filter(|(_, r)| !r.is_closed())
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }
}

//! WebSocket client for one document.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with back-off)
//! - Local edits through the [`Session`] state machine
//! - Remote operations, acks and resyncs applied in arrival order
//! - Remote cursor tracking
//!
//! One `tokio::sync::Mutex` guards the session. Outgoing messages are queued
//! while it is held, so the wire sees submissions in the order the state
//! machine produced them.
//!
//! Cursor positions on the wire are in server coordinates: the text at the
//! session's acknowledged version. Locally they are in replica coordinates,
//! which add whatever is in flight or buffered. Incoming cursors are mapped
//! through the pending operations; the local cursor is held back until the
//! session is synced and the two coincide.
//!
//! Events go out with `try_send`. An application that stops draining them
//! loses events rather than stalling the reader.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tandem_core::{encode, Operation, Side};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::presence::{PresenceEntry, RemoteCursors};
use crate::protocol::{
    ClientMessage, ConnectionId, DocumentKey, ProtocolError, RejectReason, ServerMessage,
};
use crate::session::{Session, SessionError, SessionState, Submission};

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9090`
    pub server_url: String,
    pub key: DocumentKey,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Buffered [`SyncEvent`]s before the reader waits on the application.
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>, key: DocumentKey) -> Self {
        Self {
            server_url: server_url.into(),
            key,
            reconnect_initial_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            event_capacity: 256,
        }
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// The replica was replaced by a server snapshot. `discarded` holds the
    /// local text that was thrown away, if it had unacknowledged changes.
    Resynced {
        version: u64,
        content: String,
        discarded: Option<String>,
    },
    /// A remote operation, as applied to the local text.
    RemoteEdit {
        origin: ConnectionId,
        version: u64,
        op: Operation,
        content: String,
    },
    Acknowledged {
        version: u64,
    },
    PresenceUpdated(PresenceEntry),
    PresenceRemoved(ConnectionId),
    Rejected {
        base_version: u64,
        reason: RejectReason,
    },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("gave up reconnecting after {0} attempts")]
    ReconnectFailed(u32),
}

struct Shared {
    session: Session,
    cursors: RemoteCursors,
    outgoing: Option<mpsc::Sender<ClientMessage>>,
    /// Local cursor waiting for the session to sync, in replica coordinates.
    unsent_cursor: Option<(usize, usize)>,
}

impl Shared {
    async fn send(&self, msg: ClientMessage) -> Result<(), ProtocolError> {
        match &self.outgoing {
            Some(tx) => tx.send(msg).await.map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    async fn submit(&self, submission: Submission) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Submit {
            base_version: submission.base_version,
            op: submission.op,
        })
        .await
    }

    fn shift_unsent_cursor(&mut self, op: &Operation, side: Side) {
        if let Some((start, end)) = &mut self.unsent_cursor {
            *start = op.transform_position(*start, side);
            *end = op.transform_position(*end, side);
        }
    }

    /// Map a cursor from server coordinates onto the local replica.
    fn to_local(&self, mut entry: PresenceEntry) -> PresenceEntry {
        if let Some(own) = self.session.connection_id() {
            for op in self.session.in_flight().into_iter().chain(self.session.buffer()) {
                entry.transform(op, own);
            }
        }
        entry
    }

    /// Throw away what the server has not acknowledged and ask for a fresh
    /// snapshot.
    async fn request_resync(&mut self, key: &DocumentKey) {
        self.session.mark_stale();
        self.unsent_cursor = None;
        if let Err(e) = self.send(ClientMessage::Subscribe { key: key.clone() }).await {
            log::warn!("Could not request resync of {key}: {e}");
        }
    }
}

/// Everything the reader task needs.
#[derive(Clone)]
struct Link {
    key: DocumentKey,
    shared: Arc<Mutex<Shared>>,
    state: Arc<RwLock<ConnectionState>>,
    events: mpsc::Sender<SyncEvent>,
    generation: Arc<AtomicU64>,
}

impl Link {
    fn emit(&self, event: SyncEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::warn!("Event queue of {} full, dropping {event:?}", self.key)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn read_loop(self, mut reader: WsReader, generation: u64) {
        while let Some(frame) = reader.next().await {
            match frame {
                Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                    Ok(msg) => self.handle(msg).await,
                    Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                },
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    log::warn!("WebSocket error on {}: {e}", self.key);
                    break;
                }
                _ => {}
            }
        }

        // A newer connection owns the session now.
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut shared = self.shared.lock().await;
            shared.session.mark_stale();
            shared.cursors.clear();
            shared.outgoing = None;
            shared.unsent_cursor = None;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        log::info!("Disconnected from {}", self.key);
        self.emit(SyncEvent::Disconnected);
    }

    async fn handle(&self, msg: ServerMessage) {
        let mut shared = self.shared.lock().await;
        let event = match msg {
            ServerMessage::Snapshot {
                connection_id,
                key,
                version,
                content,
                presence,
            } => {
                if key != self.key {
                    log::warn!("Ignoring snapshot of {key} on a {} client", self.key);
                    return;
                }
                let discarded = shared.session.resync(connection_id, version, content.clone());
                shared.cursors.reset(connection_id, presence);
                shared.unsent_cursor = None;
                if discarded.is_some() {
                    log::info!("Resynced {} at version {version}, local changes dropped", self.key);
                } else {
                    log::debug!("Synced {} at version {version}", self.key);
                }
                Some(SyncEvent::Resynced {
                    version,
                    content,
                    discarded,
                })
            }

            ServerMessage::Op { origin, version, op } => {
                match shared.session.apply_remote(origin, version, &op) {
                    Ok(Some(applied)) => {
                        shared.cursors.transform(&applied, origin);
                        shared.shift_unsent_cursor(&applied, Side::Left);
                        Some(SyncEvent::RemoteEdit {
                            origin,
                            version,
                            op: applied,
                            content: shared.session.content().to_owned(),
                        })
                    }
                    Ok(None) => None,
                    Err(e) => {
                        log::warn!("Remote op at version {version} not applicable ({e}), resyncing");
                        shared.request_resync(&self.key).await;
                        None
                    }
                }
            }

            ServerMessage::Ack { version, .. } => match shared.session.ack(version) {
                Ok(next) => {
                    if let Some(submission) = next {
                        if let Err(e) = shared.submit(submission).await {
                            log::warn!("Could not send buffered edit: {e}");
                        }
                    } else if let Some((start, end)) = shared.unsent_cursor.take() {
                        if let Err(e) = shared.send(ClientMessage::Cursor { start, end }).await {
                            log::warn!("Could not send cursor: {e}");
                        }
                    }
                    Some(SyncEvent::Acknowledged { version })
                }
                Err(e) => {
                    log::warn!("Ack for version {version} not applicable ({e}), resyncing");
                    shared.request_resync(&self.key).await;
                    None
                }
            },

            ServerMessage::Presence(entry) => {
                let entry = shared.to_local(entry);
                shared
                    .cursors
                    .upsert(entry.clone())
                    .then_some(SyncEvent::PresenceUpdated(entry))
            }

            ServerMessage::PresenceLeft { connection_id } => shared
                .cursors
                .remove(&connection_id)
                .map(|_| SyncEvent::PresenceRemoved(connection_id)),

            ServerMessage::Rejected {
                base_version,
                reason,
            } => {
                match &reason {
                    RejectReason::Malformed(detail) => log::error!(
                        "Server rejected edit based on version {base_version}: {detail}"
                    ),
                    RejectReason::Conflict => {
                        log::warn!("Edit based on version {base_version} conflicted")
                    }
                }
                shared.request_resync(&self.key).await;
                Some(SyncEvent::Rejected {
                    base_version,
                    reason,
                })
            }

            ServerMessage::ResyncRequired => {
                log::warn!("Server asked for a resync of {}", self.key);
                shared.request_resync(&self.key).await;
                None
            }

            ServerMessage::Pong => {
                log::trace!("Pong");
                None
            }
        };
        drop(shared);

        if let Some(event) = event {
            self.emit(event);
        }
    }
}

/// The sync client.
///
/// Manages a WebSocket connection to the sync server and keeps a local
/// replica of one document in step with it.
pub struct SyncClient {
    config: ClientConfig,
    link: Link,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let (events, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let link = Link {
            key: config.key.clone(),
            shared: Arc::new(Mutex::new(Shared {
                session: Session::new(),
                cursors: RemoteCursors::new(),
                outgoing: None,
                unsent_cursor: None,
            })),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            events,
            generation: Arc::new(AtomicU64::new(0)),
        };
        Self {
            config,
            link,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and subscribe to the configured document.
    ///
    /// Spawns the reader and writer tasks. The replica stays stale until the
    /// server's snapshot arrives as [`SyncEvent::Resynced`].
    pub async fn connect(&self) -> Result<(), ClientError> {
        *self.link.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(&self.config.server_url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.link.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let bytes = match msg.encode() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        log::error!("Failed to encode {msg:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let generation = self.link.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut shared = self.link.shared.lock().await;
            shared.session.mark_stale();
            shared.outgoing = Some(out_tx);
            shared
                .send(ClientMessage::Subscribe {
                    key: self.config.key.clone(),
                })
                .await?;
        }

        *self.link.state.write().await = ConnectionState::Connected;
        log::info!("Connected to {} for {}", self.config.server_url, self.config.key);
        self.link.emit(SyncEvent::Connected);

        tokio::spawn(self.link.clone().read_loop(ws_reader, generation));
        Ok(())
    }

    /// Reconnect with exponential back-off.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        *self.link.state.write().await = ConnectionState::Reconnecting;
        let mut delay = self.config.reconnect_initial_delay;
        for attempt in 1..=self.config.max_reconnect_attempts {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Reconnect attempt {attempt} failed: {e}");
                    *self.link.state.write().await = ConnectionState::Reconnecting;
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.config.reconnect_max_delay);
                }
            }
        }
        *self.link.state.write().await = ConnectionState::Disconnected;
        Err(ClientError::ReconnectFailed(self.config.max_reconnect_attempts))
    }

    /// Close the connection. The session goes stale once the socket is down.
    pub async fn disconnect(&self) {
        self.link.shared.lock().await.outgoing = None;
    }

    /// The editor's text is now `new_text`.
    ///
    /// Offline or stale, the change is kept locally and reported as discarded
    /// by the next resync.
    pub async fn edit(&self, new_text: &str) -> Result<(), ClientError> {
        let mut shared = self.link.shared.lock().await;
        let Some(op) = encode(shared.session.content(), new_text) else {
            return Ok(());
        };
        let submission = shared.session.apply_local(op.clone())?;
        if let Some(own) = shared.session.connection_id() {
            shared.cursors.transform(&op, own);
        }
        shared.shift_unsent_cursor(&op, Side::Right);
        if let Some(submission) = submission {
            shared.submit(submission).await?;
        }
        Ok(())
    }

    /// Share the local cursor, in positions of [`SyncClient::content`].
    ///
    /// Sent at once when synced. With an edit awaiting its ack the cursor is
    /// kept, shifted through later edits, and sent once the ack lands.
    /// Dropped silently while offline or stale.
    pub async fn set_cursor(&self, start: usize, end: usize) -> Result<(), ClientError> {
        let mut shared = self.link.shared.lock().await;
        if shared.outgoing.is_none() {
            return Ok(());
        }
        match shared.session.state() {
            SessionState::Synced => {
                shared.unsent_cursor = None;
                shared.send(ClientMessage::Cursor { start, end }).await?;
            }
            SessionState::AwaitingAck | SessionState::AwaitingAckWithBuffer => {
                shared.unsent_cursor = Some((start, end));
            }
            SessionState::Stale => log::debug!("Dropping cursor while stale"),
        }
        Ok(())
    }

    /// Withdraw the local cursor without disconnecting.
    pub async fn leave(&self) -> Result<(), ClientError> {
        self.link.shared.lock().await.unsent_cursor = None;
        self.send_if_connected(ClientMessage::Leave).await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send_if_connected(ClientMessage::Ping).await
    }

    async fn send_if_connected(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let shared = self.link.shared.lock().await;
        if shared.outgoing.is_none() {
            return Ok(());
        }
        shared.send(msg).await?;
        Ok(())
    }

    async fn shared(&self) -> MutexGuard<'_, Shared> {
        self.link.shared.lock().await
    }

    pub async fn content(&self) -> String {
        self.shared().await.session.content().to_owned()
    }

    pub async fn version(&self) -> u64 {
        self.shared().await.session.version()
    }

    pub async fn session_state(&self) -> SessionState {
        self.shared().await.session.state()
    }

    /// Assigned by the server; `None` before the first snapshot.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        self.shared().await.session.connection_id()
    }

    pub async fn remote_cursors(&self) -> Vec<PresenceEntry> {
        self.shared().await.cursors.entries()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.link.state.read().await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

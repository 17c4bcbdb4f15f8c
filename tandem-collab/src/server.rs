//! WebSocket sync server with per-document room actors.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── DocumentState (version, text, op log)
//!            ├── connection tasks ──┤   RoomActor (one task per document)
//! Client B ──┘        ▲             └── PresenceTable
//!                     │                       │
//!                     └──── BroadcastGroup ◄──┘
//!                                 │
//!                          DocumentStore (optional)
//! ```
//!
//! A connection task owns its socket. It forwards client messages to the
//! room actor and turns room events into server messages: its own applied op
//! becomes an `Ack`, everyone else's an `Op`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::broadcast::{RoomEvent, RoomReceiver};
use crate::document::SubmitError;
use crate::protocol::{ClientMessage, ConnectionId, RejectReason, ServerMessage};
use crate::room::{RoomConfig, RoomError, RoomHandle, RoomManager};
use crate::storage::DocumentStore;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Events a connection may fall behind before it must resync
    pub broadcast_capacity: usize,
    /// Applied operations kept per document for rebasing late submissions
    pub log_window: usize,
    /// Snapshot every this many versions (0 = only when a room empties)
    pub snapshot_interval: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            log_window: 1_000,
            snapshot_interval: 100,
            storage_path: None,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid number")]
    InvalidNumber { var: &'static str, value: String },
}

impl ServerConfig {
    /// Defaults overridden by `TANDEM_BIND_ADDR`, `TANDEM_BROADCAST_CAPACITY`,
    /// `TANDEM_LOG_WINDOW`, `TANDEM_SNAPSHOT_INTERVAL` and
    /// `TANDEM_STORAGE_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn number<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            var: &'static str,
            default: T,
        ) -> Result<T, ConfigError> {
            match lookup(var) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidNumber { var, value }),
                None => Ok(default),
            }
        }

        let defaults = Self::default();
        Ok(Self {
            bind_addr: lookup("TANDEM_BIND_ADDR").unwrap_or(defaults.bind_addr),
            broadcast_capacity: number(
                &lookup,
                "TANDEM_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            )?,
            log_window: number(&lookup, "TANDEM_LOG_WINDOW", defaults.log_window)?,
            snapshot_interval: number(
                &lookup,
                "TANDEM_SNAPSHOT_INTERVAL",
                defaults.snapshot_interval,
            )?,
            storage_path: lookup("TANDEM_STORAGE_PATH")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }

    pub fn room_config(&self) -> RoomConfig {
        RoomConfig {
            broadcast_capacity: self.broadcast_capacity,
            log_window: self.log_window,
            snapshot_interval: self.snapshot_interval,
            ..RoomConfig::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub applied_ops: u64,
    pub rejected_ops: u64,
    pub resyncs_forced: u64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// In-memory only: documents live as long as the process.
    pub fn new(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self::build(config, Some(store))
    }

    /// Open a RocksDB store at `config.storage_path`, if set.
    #[cfg(feature = "rocksdb")]
    pub fn open(config: ServerConfig) -> Result<Self, crate::storage::StoreError> {
        use crate::storage::{RocksStore, StoreConfig};

        match config.storage_path.clone() {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::at(path))?;
                Ok(Self::with_store(config, Arc::new(store)))
            }
            None => Ok(Self::new(config)),
        }
    }

    fn build(config: ServerConfig, store: Option<Arc<dyn DocumentStore>>) -> Self {
        let rooms = Arc::new(RoomManager::new(config.room_config(), store));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `config.bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, rooms, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }
}

async fn send(sink: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

async fn next_event(events: &mut Option<RoomReceiver>) -> Result<Arc<RoomEvent>, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut source) = ws_stream.split();
    let connection = ConnectionId::new();
    log::info!("WebSocket connection {connection} established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut room: Option<RoomHandle> = None;
    let mut events: Option<RoomReceiver> = None;

    let result: Result<(), BoxError> = async {
        loop {
            tokio::select! {
                frame = source.next() => match frame {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match ClientMessage::decode(&data) {
                            Ok(msg) => {
                                handle_client_message(
                                    msg, connection, &rooms, &stats, &mut room, &mut events, &mut sink,
                                )
                                .await?
                            }
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => sink.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                event = next_event(&mut events) => match event {
                    Ok(event) => {
                        if let Some(msg) = event.for_connection(connection) {
                            send(&mut sink, &msg).await?;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Connection {connection} lagged by {skipped} events, forcing resync");
                        events = None;
                        stats.write().await.resyncs_forced += 1;
                        send(&mut sink, &ServerMessage::ResyncRequired).await?;
                    }
                    Err(RecvError::Closed) => {
                        log::warn!("Room closed under connection {connection}");
                        events = None;
                    }
                },
            }
        }
    }
    .await;

    if let Some(room) = room {
        if let Err(e) = room.disconnect(connection).await {
            log::debug!("Could not detach {connection}: {e}");
        }
    }
    stats.write().await.active_connections -= 1;
    result
}

async fn handle_client_message(
    msg: ClientMessage,
    connection: ConnectionId,
    rooms: &RoomManager,
    stats: &RwLock<ServerStats>,
    room: &mut Option<RoomHandle>,
    events: &mut Option<RoomReceiver>,
    sink: &mut WsSink,
) -> Result<(), BoxError> {
    match msg {
        ClientMessage::Subscribe { key } => {
            if let Some(previous) = room.as_ref().filter(|r| r.key() != &key) {
                previous.disconnect(connection).await?;
                *events = None;
            }
            let (handle, subscription) = rooms.subscribe(&key, connection).await?;
            *events = Some(subscription.events);
            send(
                sink,
                &ServerMessage::Snapshot {
                    connection_id: connection,
                    key,
                    version: subscription.version,
                    content: subscription.content,
                    presence: subscription.presence,
                },
            )
            .await?;
            *room = Some(handle);
        }

        ClientMessage::Submit { base_version, op } => {
            let Some(handle) = room.as_ref() else {
                log::warn!("Submit from {connection} before subscribing");
                return Ok(());
            };
            match handle.submit(connection, base_version, op).await {
                Ok(version) => {
                    log::trace!("Applied op from {connection} at version {version}");
                    stats.write().await.applied_ops += 1;
                }
                Err(RoomError::Submit(e)) => {
                    // Logged by the room.
                    stats.write().await.rejected_ops += 1;
                    let reason = match e {
                        SubmitError::Conflict { .. } => RejectReason::Conflict,
                        SubmitError::Malformed(e) => RejectReason::Malformed(e.to_string()),
                    };
                    send(
                        sink,
                        &ServerMessage::Rejected {
                            base_version,
                            reason,
                        },
                    )
                    .await?;
                }
                Err(e @ RoomError::Closed(_)) => return Err(e.into()),
            }
        }

        ClientMessage::Cursor { start, end } => {
            if let Some(handle) = room.as_ref() {
                handle.cursor(connection, start, end).await?;
            }
        }

        ClientMessage::Leave => {
            if let Some(handle) = room.as_ref() {
                handle.leave(connection).await?;
            }
        }

        ClientMessage::Ping => send(sink, &ServerMessage::Pong).await?,
    }
    Ok(())
}

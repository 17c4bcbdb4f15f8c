//! # tandem-collab — Real-time collaborative editing over WebSocket
//!
//! A central server keeps the authoritative text of each document and a
//! version counter. Clients submit operations against the version they last
//! saw; the server rebases them over whatever landed in between, applies
//! them and fans the result out.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per user)  │    Binary Proto    │ (central)    │
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ Session     │                    │ RoomActor    │
//! │ (replica +  │                    │ (one per doc)│
//! │  pending)   │                    └──────┬───────┘
//! └─────────────┘                           │
//!                                   ┌───────┴────────┐
//!                                   │ BroadcastGroup │
//!                                   │ DocumentStore  │
//!                                   └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded messages)
//! - [`document`] — Authoritative state: version, text, op log
//! - [`room`] — Single-writer actor per document
//! - [`broadcast`] — Room fan-out with lag detection
//! - [`presence`] — Cursor sharing
//! - [`session`] — Client state machine
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client
//! - [`storage`] — Snapshot and op persistence

pub mod broadcast;
pub mod client;
pub mod document;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, RoomEvent};
pub use client::{ClientConfig, ClientError, ConnectionState, SyncClient, SyncEvent};
pub use document::{DocumentState, LoggedOp, SubmitError};
pub use presence::{color_seed, CursorColor, PresenceEntry, PresenceTable, RemoteCursors};
pub use protocol::{
    ClientMessage, ConnectionId, DocumentKey, ProtocolError, RejectReason, ServerMessage,
};
pub use room::{RoomConfig, RoomError, RoomHandle, RoomManager};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
pub use session::{Session, SessionError, SessionState, Submission};
pub use storage::{DocumentStore, MemoryStore, StoreError, StoredDocument, StoredSnapshot};
#[cfg(feature = "rocksdb")]
pub use storage::{RocksStore, StoreConfig};

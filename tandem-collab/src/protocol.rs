//! Binary wire protocol between editors and the sync server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`ClientMessage`] or [`ServerMessage`]:
//!
//! ```text
//! client                                  server
//!   │ ── Subscribe { key } ──────────────► │
//!   │ ◄──────────── Snapshot { version } ── │
//!   │ ── Submit { base_version, op } ────► │
//!   │ ◄──────────────── Ack { version } ─── │   own op
//!   │ ◄────────── Op { origin, version } ── │   everyone else's
//!   │ ── Cursor { start, end } ──────────► │
//!   │ ◄──────────────── Presence(entry) ─── │
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_core::Operation;
use thiserror::Error;
use uuid::Uuid;

use crate::presence::PresenceEntry;

/// Server-assigned identity of one WebSocket connection.
///
/// Ordered, so two peers can agree on the insert tie-break without talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Addresses one document: a collection name and an id within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Why a submission was turned down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The base version is no longer (or not yet) known to the server.
    Conflict,
    /// The operation does not fit the document it was rebased onto.
    Malformed(String),
}

/// Editor → server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a document, or re-join it to resync. Answered with `Snapshot`.
    Subscribe { key: DocumentKey },
    /// An operation built against `base_version`.
    Submit { base_version: u64, op: Operation },
    /// Cursor or selection moved. `start == end` for a caret.
    Cursor { start: usize, end: usize },
    /// Drop this connection's presence without closing the socket.
    Leave,
    Ping,
}

/// Server → editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Snapshot {
        connection_id: ConnectionId,
        key: DocumentKey,
        version: u64,
        content: String,
        presence: Vec<PresenceEntry>,
    },
    /// Someone else's operation, as applied at `version`.
    Op {
        origin: ConnectionId,
        version: u64,
        op: Operation,
    },
    /// This connection's own operation was applied at `version`. `op` is the
    /// rebased form the server actually applied.
    Ack { version: u64, op: Operation },
    Presence(PresenceEntry),
    PresenceLeft { connection_id: ConnectionId },
    Rejected {
        base_version: u64,
        reason: RejectReason,
    },
    /// The connection fell behind the room's broadcast buffer; subscribe
    /// again for a fresh snapshot.
    ResyncRequired,
    Pong,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

#[inline(always)]
fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

#[inline(always)]
fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not subscribed to a document")]
    NotSubscribed,
}

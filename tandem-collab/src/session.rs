//! Client-side replica of one document and the operations it has in flight.
//!
//! ```text
//!             local edit                 local edit
//!   Synced ───────────────► AwaitingAck ───────────────► AwaitingAckWithBuffer
//!     ▲                      │     ▲                        │        │ local edit
//!     └──────── ack ─────────┘     └──── ack (send buffer) ─┘        └─ (compose)
//!
//!   any ── connection lost ──► Stale ── resync(snapshot) ──► Synced
//! ```
//!
//! At most one operation is in flight. Edits made meanwhile are composed into
//! a single buffered operation that is sent when the ack arrives. Remote
//! operations are transformed past both before they touch the local text, and
//! both are transformed past the remote operation, so the local text always
//! equals `server text + in flight + buffer`.
//!
//! The session does no I/O. Callers send the [`Submission`]s it hands back.

use serde::{Deserialize, Serialize};
use tandem_core::{encode, transform, Operation, OperationError, Side};
use thiserror::Error;

use crate::protocol::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Synced,
    AwaitingAck,
    AwaitingAckWithBuffer,
    Stale,
}

/// An operation to send as `Submit { base_version, op }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub base_version: u64,
    pub op: Operation,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("acknowledgement received with nothing in flight")]
    UnexpectedAck,
    #[error("expected version {expected}, received {received}")]
    VersionGap { expected: u64, received: u64 },
    #[error(transparent)]
    Apply(#[from] OperationError),
}

#[derive(Debug, Clone, Default)]
enum Pending {
    #[default]
    None,
    InFlight(Operation),
    Buffered {
        in_flight: Operation,
        buffer: Operation,
    },
}

#[derive(Debug, Clone)]
pub struct Session {
    connection_id: Option<ConnectionId>,
    version: u64,
    content: String,
    pending: Pending,
    stale: bool,
    /// Local changes the server never saw since the last resync.
    unsynced: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// A session that has not seen a snapshot yet.
    pub fn new() -> Self {
        Self {
            connection_id: None,
            version: 0,
            content: String::new(),
            pending: Pending::None,
            stale: true,
            unsynced: false,
        }
    }

    pub fn state(&self) -> SessionState {
        if self.stale {
            return SessionState::Stale;
        }
        match self.pending {
            Pending::None => SessionState::Synced,
            Pending::InFlight(_) => SessionState::AwaitingAck,
            Pending::Buffered { .. } => SessionState::AwaitingAckWithBuffer,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn in_flight(&self) -> Option<&Operation> {
        match &self.pending {
            Pending::None => None,
            Pending::InFlight(op) | Pending::Buffered { in_flight: op, .. } => Some(op),
        }
    }

    pub fn buffer(&self) -> Option<&Operation> {
        match &self.pending {
            Pending::Buffered { buffer, .. } => Some(buffer),
            _ => None,
        }
    }

    /// The editor's text changed to `new_text`.
    ///
    /// Returns what to send, if anything: only a change made while synced
    /// goes out immediately.
    pub fn local_edit(&mut self, new_text: &str) -> Option<Submission> {
        let op = encode(&self.content, new_text)?;
        self.content = new_text.to_owned();
        self.enqueue(op)
    }

    /// Apply an operation built against the current local text.
    pub fn apply_local(&mut self, op: Operation) -> Result<Option<Submission>, SessionError> {
        if op.is_noop() {
            return Ok(None);
        }
        self.content = op.apply_to(&self.content)?;
        Ok(self.enqueue(op))
    }

    fn enqueue(&mut self, op: Operation) -> Option<Submission> {
        if self.stale {
            log::debug!("Local edit while stale; held until resync");
            self.unsynced = true;
            return None;
        }
        match std::mem::take(&mut self.pending) {
            Pending::None => {
                self.pending = Pending::InFlight(op.clone());
                Some(Submission {
                    base_version: self.version,
                    op,
                })
            }
            Pending::InFlight(in_flight) => {
                self.pending = Pending::Buffered {
                    in_flight,
                    buffer: op,
                };
                None
            }
            Pending::Buffered { in_flight, buffer } => {
                self.pending = Pending::Buffered {
                    in_flight,
                    buffer: buffer.compose(&op),
                };
                None
            }
        }
    }

    /// The server applied our in-flight operation at `version`.
    ///
    /// Returns the buffered operation, now in flight, if there was one.
    pub fn ack(&mut self, version: u64) -> Result<Option<Submission>, SessionError> {
        if self.stale || matches!(self.pending, Pending::None) {
            return Err(SessionError::UnexpectedAck);
        }
        if version != self.version + 1 {
            return Err(SessionError::VersionGap {
                expected: self.version + 1,
                received: version,
            });
        }
        self.version = version;
        match std::mem::take(&mut self.pending) {
            Pending::Buffered { buffer, .. } => {
                self.pending = Pending::InFlight(buffer.clone());
                Ok(Some(Submission {
                    base_version: version,
                    op: buffer,
                }))
            }
            _ => Ok(None),
        }
    }

    /// Someone else's operation, applied by the server at `version`.
    ///
    /// Returns the operation as applied to the local text, or `None` when it
    /// was skipped (stale session, or a version already seen). On error
    /// nothing changes and the caller should resync.
    pub fn apply_remote(
        &mut self,
        origin: ConnectionId,
        version: u64,
        op: &Operation,
    ) -> Result<Option<Operation>, SessionError> {
        if self.stale {
            return Ok(None);
        }
        if version <= self.version {
            log::debug!("Skipping duplicate remote op at version {version}");
            return Ok(None);
        }
        if version != self.version + 1 {
            return Err(SessionError::VersionGap {
                expected: self.version + 1,
                received: version,
            });
        }

        // Same tie-break the server uses when it rebases our op over this one.
        let ours = match self.connection_id {
            Some(own) => Side::from_ids(&own, &origin),
            None => Side::Right,
        };
        let theirs = ours.flip();

        let (remote, pending) = match &self.pending {
            Pending::None => (op.clone(), Pending::None),
            Pending::InFlight(in_flight) => (
                transform(op, in_flight, theirs),
                Pending::InFlight(transform(in_flight, op, ours)),
            ),
            Pending::Buffered { in_flight, buffer } => {
                let past_in_flight = transform(op, in_flight, theirs);
                let remote = transform(&past_in_flight, buffer, theirs);
                (
                    remote,
                    Pending::Buffered {
                        in_flight: transform(in_flight, op, ours),
                        buffer: transform(buffer, &past_in_flight, ours),
                    },
                )
            }
        };

        self.content = remote.apply_to(&self.content)?;
        self.pending = pending;
        self.version = version;
        Ok(Some(remote))
    }

    /// The connection dropped, or the server turned down our operation.
    /// Anything not yet acknowledged is discarded.
    pub fn mark_stale(&mut self) {
        if !matches!(self.pending, Pending::None) {
            self.unsynced = true;
        }
        self.pending = Pending::None;
        self.stale = true;
    }

    /// Replace the replica with a server snapshot.
    ///
    /// Returns the local text that was thrown away, if it held changes the
    /// server never acknowledged, so the caller can diff it against the new
    /// content and re-apply what it wants to keep.
    pub fn resync(
        &mut self,
        connection_id: ConnectionId,
        version: u64,
        content: String,
    ) -> Option<String> {
        let had_unsynced = self.unsynced || !matches!(self.pending, Pending::None);
        let previous = std::mem::replace(&mut self.content, content);
        self.connection_id = Some(connection_id);
        self.version = version;
        self.pending = Pending::None;
        self.stale = false;
        self.unsynced = false;
        (had_unsynced && previous != self.content).then_some(previous)
    }
}

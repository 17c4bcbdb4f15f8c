//! Authoritative state of one document on the server.
//!
//! `DocumentState` is plain data with no locking: the room actor owning it is
//! the single writer. Every applied operation gets the next version and goes
//! into a bounded log, which is what lets a submission built against an older
//! version be rebased instead of refused.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tandem_core::{transform, Operation, OperationError, Side};
use thiserror::Error;

use crate::protocol::{ConnectionId, DocumentKey};
use crate::storage::StoredDocument;

/// An applied operation as the server recorded it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedOp {
    /// Version the document reached by applying `op`.
    pub version: u64,
    pub origin: ConnectionId,
    /// Rebased form, applicable to the text at `version - 1`.
    pub op: Operation,
}

/// Result of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub version: u64,
    pub op: Operation,
    /// Number of logged operations the submission was transformed against.
    pub rebased_over: usize,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// The base version is older than the retained log, or newer than the
    /// document. The client has to resync.
    #[error("base version {base_version} outside retained history {oldest_available}..={current}")]
    Conflict {
        base_version: u64,
        oldest_available: u64,
        current: u64,
    },
    /// The rebased operation does not fit the document.
    #[error("malformed operation: {0}")]
    Malformed(#[from] OperationError),
}

#[derive(Debug, Clone)]
pub struct DocumentState {
    key: DocumentKey,
    version: u64,
    content: String,
    log: VecDeque<LoggedOp>,
    log_window: usize,
}

impl DocumentState {
    /// An empty document at version 0.
    pub fn new(key: DocumentKey, log_window: usize) -> Self {
        Self::restore(key, 0, String::new(), log_window)
    }

    /// A document resumed from a snapshot. The log starts empty, so only
    /// submissions based on `version` or later are accepted.
    pub fn restore(key: DocumentKey, version: u64, content: String, log_window: usize) -> Self {
        Self {
            key,
            version,
            content,
            log: VecDeque::with_capacity(log_window.min(1024)),
            log_window,
        }
    }

    /// Rebuild from persisted state: the snapshot, then each logged op
    /// replayed at its recorded version.
    pub fn recover(
        key: DocumentKey,
        stored: StoredDocument,
        log_window: usize,
    ) -> Result<Self, SubmitError> {
        let mut state = match stored.snapshot {
            Some(snapshot) => Self::restore(key, snapshot.version, snapshot.content, log_window),
            None => Self::new(key, log_window),
        };
        for logged in stored.ops {
            state.replay(logged)?;
        }
        Ok(state)
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Length of the content in characters, the unit positions use.
    pub fn char_len(&self) -> usize {
        self.content.chars().count()
    }

    /// Oldest base version a submission may still use.
    pub fn oldest_available(&self) -> u64 {
        self.version - self.log.len() as u64
    }

    /// Logged operations newer than `version`, oldest first.
    pub fn ops_since(&self, version: u64) -> impl Iterator<Item = &LoggedOp> {
        self.log.iter().filter(move |logged| logged.version > version)
    }

    /// Apply `op`, built by `origin` against `base_version`.
    ///
    /// The operation is transformed against everything logged after its base,
    /// in order, with the tie-break taken from the two origins. On error the
    /// document is untouched.
    pub fn submit(
        &mut self,
        origin: ConnectionId,
        base_version: u64,
        op: Operation,
    ) -> Result<Applied, SubmitError> {
        let oldest_available = self.oldest_available();
        if base_version > self.version || base_version < oldest_available {
            return Err(SubmitError::Conflict {
                base_version,
                oldest_available,
                current: self.version,
            });
        }

        let mut rebased = op;
        let mut rebased_over = 0;
        for logged in self.ops_since(base_version) {
            rebased = transform(&rebased, &logged.op, Side::from_ids(&origin, &logged.origin));
            rebased_over += 1;
        }

        let content = rebased.apply_to(&self.content)?;
        let version = self.commit(origin, rebased.clone(), content);
        Ok(Applied {
            version,
            op: rebased,
            rebased_over,
        })
    }

    /// Re-apply a persisted operation. It must carry exactly the next version.
    fn replay(&mut self, logged: LoggedOp) -> Result<(), SubmitError> {
        if logged.version != self.version + 1 {
            return Err(SubmitError::Conflict {
                base_version: logged.version.saturating_sub(1),
                oldest_available: self.oldest_available(),
                current: self.version,
            });
        }
        let content = logged.op.apply_to(&self.content)?;
        self.commit(logged.origin, logged.op, content);
        Ok(())
    }

    fn commit(&mut self, origin: ConnectionId, op: Operation, content: String) -> u64 {
        self.content = content;
        self.version += 1;
        self.log.push_back(LoggedOp {
            version: self.version,
            origin,
            op,
        });
        while self.log.len() > self.log_window {
            self.log.pop_front();
        }
        self.version
    }
}

//! Persistence for documents: snapshots plus the operations applied since.
//!
//! ```text
//! ┌────────────┐  append_op (every applied op)     ┌───────────────┐
//! │ room actor │ ────────────────────────────────► │ DocumentStore │
//! │            │  save_snapshot (every N ops and   │               │
//! │            │  when the last member leaves)     │  snapshots    │
//! └─────┬──────┘                                   │  ops          │
//!       │ on first subscribe: load = snapshot + ops since      └───────────────┘
//!       ▼
//! DocumentState::restore
//! ```
//!
//! Stores are synchronous; the room actor calls them inline. A failed write
//! is logged and never fails the submission that caused it.

mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;

pub use memory::MemoryStore;
#[cfg(feature = "rocksdb")]
pub use rocks::{RocksStore, StoreConfig};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::LoggedOp;
use crate::protocol::DocumentKey;

/// Full text of a document at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub version: u64,
    pub content: String,
}

/// What a room needs to come back: the latest snapshot, if any, and every
/// operation logged after it, in version order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredDocument {
    pub snapshot: Option<StoredSnapshot>,
    pub ops: Vec<LoggedOp>,
}

/// Storage errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("corrupt key in {0}")]
    CorruptKey(&'static str),
}

pub trait DocumentStore: Send + Sync {
    fn load_snapshot(&self, key: &DocumentKey) -> Result<Option<StoredSnapshot>, StoreError>;

    fn save_snapshot(&self, key: &DocumentKey, snapshot: &StoredSnapshot) -> Result<(), StoreError>;

    fn append_op(&self, key: &DocumentKey, op: &LoggedOp) -> Result<(), StoreError>;

    /// Logged operations with a version strictly greater than `version`.
    fn ops_since(&self, key: &DocumentKey, version: u64) -> Result<Vec<LoggedOp>, StoreError>;

    /// Drop logged operations up to and including `version`, once a snapshot
    /// covers them. Returns how many were removed.
    fn compact_ops(&self, key: &DocumentKey, version: u64) -> Result<u64, StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentKey>, StoreError>;

    fn load(&self, key: &DocumentKey) -> Result<StoredDocument, StoreError> {
        let snapshot = self.load_snapshot(key)?;
        let since = snapshot.as_ref().map_or(0, |s| s.version);
        let ops = self.ops_since(key, since)?;
        Ok(StoredDocument { snapshot, ops })
    }
}

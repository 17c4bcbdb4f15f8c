//! Process-local store. Survives room restarts, not process restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use super::{DocumentStore, StoreError, StoredSnapshot};
use crate::document::LoggedOp;
use crate::protocol::DocumentKey;

#[derive(Debug, Default)]
struct Entry {
    snapshot: Option<StoredSnapshot>,
    ops: BTreeMap<u64, LoggedOp>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentKey, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> Result<MutexGuard<'_, HashMap<DocumentKey, Entry>>, StoreError> {
        self.documents
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    /// Logged operations currently held for `key`.
    pub fn op_count(&self, key: &DocumentKey) -> Result<usize, StoreError> {
        Ok(self.documents()?.get(key).map_or(0, |e| e.ops.len()))
    }
}

impl DocumentStore for MemoryStore {
    fn load_snapshot(&self, key: &DocumentKey) -> Result<Option<StoredSnapshot>, StoreError> {
        Ok(self.documents()?.get(key).and_then(|e| e.snapshot.clone()))
    }

    fn save_snapshot(&self, key: &DocumentKey, snapshot: &StoredSnapshot) -> Result<(), StoreError> {
        let mut documents = self.documents()?;
        let entry = documents.entry(key.clone()).or_default();
        // Never regress to an older snapshot.
        if entry.snapshot.as_ref().map_or(true, |s| s.version <= snapshot.version) {
            entry.snapshot = Some(snapshot.clone());
        }
        Ok(())
    }

    fn append_op(&self, key: &DocumentKey, op: &LoggedOp) -> Result<(), StoreError> {
        self.documents()?
            .entry(key.clone())
            .or_default()
            .ops
            .insert(op.version, op.clone());
        Ok(())
    }

    fn ops_since(&self, key: &DocumentKey, version: u64) -> Result<Vec<LoggedOp>, StoreError> {
        let documents = self.documents()?;
        let Some(entry) = documents.get(key) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .ops
            .range(version.saturating_add(1)..)
            .map(|(_, op)| op.clone())
            .collect())
    }

    fn compact_ops(&self, key: &DocumentKey, version: u64) -> Result<u64, StoreError> {
        let mut documents = self.documents()?;
        let Some(entry) = documents.get_mut(key) else {
            return Ok(0);
        };
        let kept = entry.ops.split_off(&version.saturating_add(1));
        let removed = entry.ops.len() as u64;
        entry.ops = kept;
        Ok(removed)
    }

    fn list_documents(&self) -> Result<Vec<DocumentKey>, StoreError> {
        let mut keys: Vec<DocumentKey> = self.documents()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

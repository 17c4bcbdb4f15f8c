//! RocksDB-backed document store.
//!
//! Column families:
//! - `snapshots` — full document text, LZ4 compressed, keyed by document
//! - `ops`       — applied operations, keyed by `<document><version:8 bytes BE>`
//!
//! Document keys are length-prefixed (`<len:4 BE><collection><len:4 BE><id>`)
//! so a document's ops form one contiguous, version-ordered key range.

use std::collections::BTreeSet;
use std::path::PathBuf;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, WriteBatch, WriteOptions, DB,
};

use super::{DocumentStore, StoreError, StoredSnapshot};
use crate::document::LoggedOp;
use crate::protocol::DocumentKey;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_OPS: &str = "ops";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_OPS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tandem_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            max_open_files: 64,
            ..Self::default()
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DB,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened document store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(f64::from(config.bloom_filter_bits), false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_SNAPSHOTS => {
                // Values are LZ4 frames already.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(4);
            }
            _ => {}
        }
        opts
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

fn document_prefix(key: &DocumentKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + key.collection.len() + key.id.len());
    for part in [&key.collection, &key.id] {
        out.extend_from_slice(&(part.len() as u32).to_be_bytes());
        out.extend_from_slice(part.as_bytes());
    }
    out
}

/// Inverse of [`document_prefix`]; returns the key and the bytes after it.
fn split_document_prefix(bytes: &[u8]) -> Option<(DocumentKey, &[u8])> {
    fn part(bytes: &[u8]) -> Option<(String, &[u8])> {
        let len_bytes: [u8; 4] = bytes.get(..4)?.try_into().ok()?;
        let len = u32::from_be_bytes(len_bytes) as usize;
        let text = bytes.get(4..4 + len)?;
        Some((String::from_utf8(text.to_vec()).ok()?, &bytes[4 + len..]))
    }
    let (collection, rest) = part(bytes)?;
    let (id, rest) = part(rest)?;
    Some((DocumentKey { collection, id }, rest))
}

fn op_key(key: &DocumentKey, version: u64) -> Vec<u8> {
    let mut out = document_prefix(key);
    out.extend_from_slice(&version.to_be_bytes());
    out
}

fn op_version(prefix_len: usize, raw: &[u8]) -> Result<u64, StoreError> {
    let bytes: [u8; 8] = raw
        .get(prefix_len..)
        .and_then(|b| b.try_into().ok())
        .ok_or(StoreError::CorruptKey(CF_OPS))?;
    Ok(u64::from_be_bytes(bytes))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl DocumentStore for RocksStore {
    fn load_snapshot(&self, key: &DocumentKey) -> Result<Option<StoredSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, document_prefix(key))? {
            Some(compressed) => {
                let raw = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(decode(&raw)?))
            }
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, key: &DocumentKey, snapshot: &StoredSnapshot) -> Result<(), StoreError> {
        if let Some(existing) = self.load_snapshot(key)? {
            if existing.version > snapshot.version {
                return Ok(());
            }
        }
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(&encode(snapshot)?);
        self.db
            .put_cf_opt(cf, document_prefix(key), compressed, &self.write_options())?;
        log::debug!("Saved snapshot of {key} at version {}", snapshot.version);
        Ok(())
    }

    fn append_op(&self, key: &DocumentKey, op: &LoggedOp) -> Result<(), StoreError> {
        let cf = self.cf(CF_OPS)?;
        self.db
            .put_cf_opt(cf, op_key(key, op.version), encode(op)?, &self.write_options())?;
        Ok(())
    }

    fn ops_since(&self, key: &DocumentKey, version: u64) -> Result<Vec<LoggedOp>, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = document_prefix(key);
        let start = op_key(key, version.saturating_add(1));

        let mut ops = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (raw_key, value) = item?;
            if !raw_key.starts_with(&prefix) || raw_key.len() != prefix.len() + 8 {
                break;
            }
            let op: LoggedOp = decode(&value)?;
            if op.version != op_version(prefix.len(), &raw_key)? {
                return Err(StoreError::CorruptKey(CF_OPS));
            }
            ops.push(op);
        }
        Ok(ops)
    }

    fn compact_ops(&self, key: &DocumentKey, version: u64) -> Result<u64, StoreError> {
        let cf = self.cf(CF_OPS)?;
        let prefix = document_prefix(key);
        let start = op_key(key, 0);

        let mut batch = WriteBatch::default();
        let mut removed = 0u64;
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            let (raw_key, _) = item?;
            if !raw_key.starts_with(&prefix) || raw_key.len() != prefix.len() + 8 {
                break;
            }
            if op_version(prefix.len(), &raw_key)? > version {
                break;
            }
            batch.delete_cf(cf, &raw_key);
            removed += 1;
        }
        if removed > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(removed)
    }

    fn list_documents(&self) -> Result<Vec<DocumentKey>, StoreError> {
        let mut keys = BTreeSet::new();
        for (name, expect_suffix) in [(CF_SNAPSHOTS, 0usize), (CF_OPS, 8)] {
            let cf = self.cf(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (raw_key, _) = item?;
                match split_document_prefix(&raw_key) {
                    Some((key, rest)) if rest.len() == expect_suffix => {
                        keys.insert(key);
                    }
                    _ => return Err(StoreError::CorruptKey(name)),
                }
            }
        }
        Ok(keys.into_iter().collect())
    }
}

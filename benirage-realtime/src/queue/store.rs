//! Durable storage for queued operations.
//!
//! Column families:
//! - `offline_queue`: one record per pending operation, keyed by
//!   `<target bytes><0x00><sequence:8 bytes big-endian>` so a forward scan
//!   yields every target's operations in enqueue order.
//!
//! Record value: bincode-encoded [`QueueRecord`] holding the LZ4-compressed
//! JSON payload and a checksum over all fields. Records failing the
//! checksum are skipped on load instead of poisoning the whole queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::QueuedOperation;

const CF_QUEUE: &str = "offline_queue";

/// Separates the target from the sequence in record keys.
const KEY_SEPARATOR: u8 = 0x00;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("checksum mismatch for record {0}")]
    Checksum(Uuid),
    #[error("invalid target name: {0:?}")]
    InvalidTarget(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Key of one stored operation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub target: String,
    pub sequence: u64,
}

impl RecordKey {
    pub fn of(op: &QueuedOperation) -> Self {
        Self {
            target: op.target.clone(),
            sequence: op.sequence,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.target.len() + 9);
        key.extend_from_slice(self.target.as_bytes());
        key.push(KEY_SEPARATOR);
        key.extend_from_slice(&self.sequence.to_be_bytes());
        key
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 9 || bytes[bytes.len() - 9] != KEY_SEPARATOR {
            return None;
        }
        let (target, rest) = bytes.split_at(bytes.len() - 9);
        let sequence = u64::from_be_bytes(rest[1..].try_into().ok()?);
        Some(Self {
            target: String::from_utf8(target.to_vec()).ok()?,
            sequence,
        })
    }
}

/// Atomic set of writes applied by [`QueueStore::commit`].
#[derive(Debug, Default)]
pub struct StoreBatch {
    pub puts: Vec<QueuedOperation>,
    pub deletes: Vec<RecordKey>,
}

impl StoreBatch {
    pub fn put(mut self, op: QueuedOperation) -> Self {
        self.puts.push(op);
        self
    }

    pub fn delete(mut self, key: RecordKey) -> Self {
        self.deletes.push(key);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.puts.is_empty() && self.deletes.is_empty()
    }
}

/// Everything found in the store on startup.
#[derive(Debug, Default)]
pub struct Recovered {
    /// Operations ordered by target, then sequence
    pub operations: Vec<QueuedOperation>,
    /// Records skipped because they failed to decode or verify
    pub corrupted: usize,
}

/// Durable backing for an [`super::OfflineQueue`].
pub trait QueueStore: Send + Sync {
    /// Apply puts and deletes atomically.
    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError>;

    /// Load every persisted operation.
    fn load(&self) -> Result<Recovered, StoreError>;
}

impl<T: QueueStore + ?Sized> QueueStore for Arc<T> {
    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError> {
        (**self).commit(batch)
    }

    fn load(&self) -> Result<Recovered, StoreError> {
        (**self).load()
    }
}

/// Persisted form of a [`QueuedOperation`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    id: Uuid,
    sequence: u64,
    target: String,
    created_at: u64,
    retry_count: u32,
    /// LZ4-compressed JSON payload
    payload: Vec<u8>,
    checksum: u32,
}

impl QueueRecord {
    fn from_operation(op: &QueuedOperation) -> Result<Self, StoreError> {
        let json =
            serde_json::to_vec(&op.payload).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let payload = lz4_flex::compress_prepend_size(&json);
        let mut record = Self {
            id: op.id,
            sequence: op.sequence,
            target: op.target.clone(),
            created_at: op.created_at,
            retry_count: op.retry_count,
            payload,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        Ok(record)
    }

    fn into_operation(self) -> Result<QueuedOperation, StoreError> {
        if self.checksum != self.compute_checksum() {
            return Err(StoreError::Checksum(self.id));
        }
        let json = lz4_flex::decompress_size_prepended(&self.payload)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let payload = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(QueuedOperation {
            id: self.id,
            target: self.target,
            sequence: self.sequence,
            payload,
            created_at: self.created_at,
            retry_count: self.retry_count,
        })
    }

    /// FNV-1a over every field except the checksum itself.
    fn compute_checksum(&self) -> u32 {
        const PRIME: u32 = 0x0100_0193;
        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |bytes: &[u8]| {
            for byte in bytes {
                hash ^= *byte as u32;
                hash = hash.wrapping_mul(PRIME);
            }
        };
        mix(self.id.as_bytes());
        mix(&self.sequence.to_le_bytes());
        mix(self.target.as_bytes());
        mix(&self.created_at.to_le_bytes());
        mix(&self.retry_count.to_le_bytes());
        mix(&self.payload);
        hash
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }
}

fn validate_target(target: &str) -> Result<(), StoreError> {
    if target.is_empty() || target.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(StoreError::InvalidTarget(target.to_string()));
    }
    Ok(())
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// fsync every commit (default: true, a queued write must survive a crash)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
    /// Write buffer size (default: 4MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("benirage_queue"),
            block_cache_size: 8 * 1024 * 1024,
            sync_writes: true,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            sync_writes: false,
            max_open_files: 16,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// RocksDB-backed queue store.
pub struct RocksQueueStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksQueueStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(2);

        let mut cf_opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(10.0, false);
        cf_opts.set_block_based_table_factory(&block_opts);
        // Payloads are already LZ4-compressed
        cf_opts.set_compression_type(DBCompressionType::None);
        cf_opts.set_write_buffer_size(config.write_buffer_size);

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            vec![ColumnFamilyDescriptor::new(CF_QUEUE, cf_opts)],
        )?;
        log::debug!("Opened offline queue store at {}", config.path.display());
        Ok(Self { db, config })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_cf(self.cf()?)?;
        Ok(())
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_QUEUE)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_QUEUE}' not found")))
    }

    #[cfg(test)]
    fn put_raw(&self, key: &RecordKey, value: &[u8]) -> Result<(), StoreError> {
        self.db.put_cf(self.cf()?, key.encode(), value)?;
        Ok(())
    }
}

impl QueueStore for RocksQueueStore {
    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let cf = self.cf()?;
        let mut write = WriteBatch::default();
        for key in &batch.deletes {
            write.delete_cf(cf, key.encode());
        }
        for op in &batch.puts {
            validate_target(&op.target)?;
            let record = QueueRecord::from_operation(op)?;
            write.put_cf(cf, RecordKey::of(op).encode(), record.encode()?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(write, &write_opts)?;
        Ok(())
    }

    fn load(&self) -> Result<Recovered, StoreError> {
        let cf = self.cf()?;
        let mut recovered = Recovered::default();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            let decoded = RecordKey::decode(&key)
                .ok_or_else(|| StoreError::Deserialization("malformed record key".to_string()))
                .and_then(|key| {
                    let op = QueueRecord::decode(&value)?.into_operation()?;
                    if RecordKey::of(&op) != key {
                        return Err(StoreError::Deserialization(format!(
                            "record {} stored under foreign key",
                            op.id
                        )));
                    }
                    Ok(op)
                });
            match decoded {
                Ok(op) => recovered.operations.push(op),
                Err(e) => {
                    log::warn!("Skipping corrupted queue record: {e}");
                    recovered.corrupted += 1;
                }
            }
        }
        Ok(recovered)
    }
}

/// In-process store for tests and sessions that need no durability.
#[derive(Default)]
pub struct MemoryQueueStore {
    records: Mutex<BTreeMap<RecordKey, QueuedOperation>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<RecordKey, QueuedOperation>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl QueueStore for MemoryQueueStore {
    fn commit(&self, batch: StoreBatch) -> Result<(), StoreError> {
        for op in &batch.puts {
            validate_target(&op.target)?;
        }
        let mut records = self.records();
        for key in &batch.deletes {
            records.remove(key);
        }
        for op in batch.puts {
            records.insert(RecordKey::of(&op), op);
        }
        Ok(())
    }

    fn load(&self) -> Result<Recovered, StoreError> {
        Ok(Recovered {
            operations: self.records().values().cloned().collect(),
            corrupted: 0,
        })
    }
}

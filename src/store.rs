//! Durable snapshot store for room documents.
//!
//! ```text
//! ┌──────────┐   debounced save    ┌──────────────┐
//! │ Room     │ ──────────────────► │ SnapshotStore│
//! │ (memory) │                     │ (RocksDB)    │
//! └────┬─────┘                     └──────┬───────┘
//!      │ on first join                    │ column families
//!      ▼                                  ▼
//! ┌──────────┐          ┌────────────────────────────────┐
//! │ CrdtDoc  │          │ CF "snapshots" — LZ4 full state │
//! │ (loaded) │          │ CF "meta"      — save metadata  │
//! └──────────┘          └────────────────────────────────┘
//! ```
//!
//! The store is the only resource shared across rooms. It is opened once
//! and handed out behind an `Arc`; rooms never see the backend directly,
//! only the [`SnapshotStore`] trait, so tests substitute [`MemoryStore`].
//!
//! Save failures are non-fatal: the in-memory document stays authoritative
//! and [`save_with_retry`] retries with capped backoff before surfacing
//! the error to the room.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

/// Column family names.
const CF_SNAPSHOTS: &str = "snapshots";
const CF_META: &str = "meta";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_META];

/// Keyed byte-blob store for serialized room documents.
///
/// Keys are the room identifiers taken verbatim from the connection path;
/// other product subsystems read documents through the same keys.
pub trait SnapshotStore: Send + Sync {
    /// Load the snapshot for a room. `Ok(None)` means no snapshot exists
    /// and the room starts from an empty document.
    fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Persist the full encoded document state for a room.
    fn save(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Remove a room's snapshot (explicit document deletion flows).
    fn delete(&self, room_id: &str) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend error (RocksDB internal)
    DatabaseError(String),
    /// Backend temporarily unreachable; retried with backoff
    Unavailable(String),
    /// Serialization failed
    SerializationError(String),
    /// Compression error
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Backoff cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Save a snapshot, retrying transient failures with capped backoff.
///
/// Exhausted retries are logged and returned to the caller; the room keeps
/// its dirty flag set so a later debounced write retries.
pub async fn save_with_retry(
    store: &dyn SnapshotStore,
    room_id: &str,
    snapshot: &[u8],
    policy: &RetryPolicy,
) -> Result<(), StoreError> {
    let mut delay = policy.base_delay;
    let mut last_err = StoreError::Unavailable("no attempts made".to_string());

    for attempt in 1..=policy.max_attempts.max(1) {
        match store.save(room_id, snapshot) {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!(
                    "snapshot save for room '{room_id}' failed (attempt {attempt}/{}): {e}",
                    policy.max_attempts.max(1)
                );
                last_err = e;
                if attempt < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(policy.max_delay);
                }
            }
        }
    }

    Err(last_err)
}

/// Store configuration for the RocksDB backend.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("coedit_data"),
            block_cache_size: 64 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Metadata written alongside each snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed size in bytes
    pub compressed_size: u64,
    /// Last save timestamp (seconds since epoch)
    pub saved_at: u64,
}

impl SnapshotMeta {
    fn now(snapshot_size: u64, compressed_size: u64) -> Self {
        let saved_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self { snapshot_size, compressed_size, saved_at }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed snapshot store.
///
/// Snapshots are LZ4 compressed; snapshot and metadata writes go through
/// one atomic batch.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4'd before they reach RocksDB
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Load save metadata for a room, if any.
    pub fn metadata(&self, room_id: &str) -> Result<Option<SnapshotMeta>, StoreError> {
        let cf = self.cf(CF_META)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => Ok(Some(SnapshotMeta::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl SnapshotStore for RocksStore {
    fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(compressed) => {
                let snapshot = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    fn save(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let compressed = lz4_flex::compress_prepend_size(snapshot);
        let meta = SnapshotMeta::now(snapshot.len() as u64, compressed.len() as u64);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, room_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn delete(&self, room_id: &str) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_META)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_snap, room_id.as_bytes());
        batch.delete_cf(&cf_meta, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }
}

/// In-memory store with call counters, for tests.
///
/// `set_save_failures(n)` makes the next `n` saves fail with
/// [`StoreError::Unavailable`], for exercising the retry path.
#[derive(Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    loads: AtomicU64,
    saves: AtomicU64,
    deletes: AtomicU64,
    save_failures: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make the next `n` save calls fail.
    pub fn set_save_failures(&self, n: u32) {
        self.save_failures.store(n, Ordering::SeqCst);
    }

    /// Peek at the stored blob without bumping the load counter.
    pub fn peek(&self, room_id: &str) -> Option<Vec<u8>> {
        self.blobs.lock().ok()?.get(room_id).cloned()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, room_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned".to_string()))?;
        Ok(blobs.get(room_id).cloned())
    }

    fn save(&self, room_id: &str, snapshot: &[u8]) -> Result<(), StoreError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self
            .save_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned".to_string()))?;
        blobs.insert(room_id.to_string(), snapshot.to_vec());
        Ok(())
    }

    fn delete(&self, room_id: &str) -> Result<(), StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Unavailable("poisoned".to_string()))?;
        blobs.remove(room_id);
        Ok(())
    }
}

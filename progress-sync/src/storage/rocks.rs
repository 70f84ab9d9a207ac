//! RocksDB-backed durable store for the coordinator.
//!
//! Column families:
//! - `progress`: Latest progress snapshot per child (LZ4-compressed JSON)
//! - `backups`: Point-in-time backups (LZ4-compressed JSON), keyed by backup id
//! - `backup_index`: Backup metadata (bincode), keyed by `<child_id>\0<backup_id>`
//! - `replay_marks`: Highest applied offline sequence per device (bincode), keyed by child id
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use chrono::{DateTime, Utc};
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::model::ProgressState;

const CF_PROGRESS: &str = "progress";
const CF_BACKUPS: &str = "backups";
const CF_BACKUP_INDEX: &str = "backup_index";
const CF_REPLAY_MARKS: &str = "replay_marks";

const COLUMN_FAMILIES: &[&str] = &[CF_PROGRESS, CF_BACKUPS, CF_BACKUP_INDEX, CF_REPLAY_MARKS];

/// Highest applied offline sequence number per device id.
pub type ReplayMarks = BTreeMap<String, u64>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("progress_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// A point-in-time copy of a child's full progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub backup_id: String,
    pub child_id: String,
    pub created_at: DateTime<Utc>,
    pub states: Vec<ProgressState>,
}

/// Backup metadata stored in the index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub child_id: String,
    pub created_at: DateTime<Utc>,
    pub activity_count: usize,
    /// Uncompressed snapshot size in bytes
    pub snapshot_size: u64,
    /// Compressed snapshot size in bytes
    pub compressed_size: u64,
}

impl BackupMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Durable progress and backup store.
pub struct ProgressStore {
    /// RocksDB instance (single-threaded mode; callers serialize through tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl ProgressStore {
    /// Open the store, creating the database and column families if missing.
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

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_PROGRESS | CF_BACKUP_INDEX | CF_REPLAY_MARKS => {
                // Small values, point lookups and short prefix scans
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BACKUPS => {
                // Values are already LZ4-compressed
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    // ─── Progress ─────────────────────────────────────────────────────

    /// Replace the stored progress for a child.
    pub fn save_progress(&self, child_id: &str, states: &[ProgressState]) -> Result<(), StoreError> {
        let cf = self.cf(CF_PROGRESS)?;
        let compressed = compress_states(states)?;
        self.db.put_cf_opt(&cf, child_id.as_bytes(), &compressed, &self.write_options())?;
        Ok(())
    }

    /// Load the stored progress for a child (empty if never saved).
    pub fn load_progress(&self, child_id: &str) -> Result<Vec<ProgressState>, StoreError> {
        let cf = self.cf(CF_PROGRESS)?;
        match self.db.get_cf(&cf, child_id.as_bytes())? {
            Some(compressed) => decompress_states(&compressed),
            None => Ok(Vec::new()),
        }
    }

    /// Child ids with stored progress.
    pub fn list_children(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_PROGRESS)?;
        let mut children = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let child = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            children.push(child);
        }
        Ok(children)
    }

    /// Replace the replay marks of a child's room.
    pub fn save_replay_marks(&self, child_id: &str, marks: &ReplayMarks) -> Result<(), StoreError> {
        let cf = self.cf(CF_REPLAY_MARKS)?;
        let encoded = bincode::serde::encode_to_vec(marks, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.db.put_cf_opt(&cf, child_id.as_bytes(), &encoded, &self.write_options())?;
        Ok(())
    }

    /// Load the replay marks of a child's room (empty if never saved).
    pub fn load_replay_marks(&self, child_id: &str) -> Result<ReplayMarks, StoreError> {
        let cf = self.cf(CF_REPLAY_MARKS)?;
        match self.db.get_cf(&cf, child_id.as_bytes())? {
            Some(bytes) => {
                let (marks, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
                Ok(marks)
            }
            None => Ok(ReplayMarks::new()),
        }
    }

    // ─── Backups ──────────────────────────────────────────────────────

    /// Persist a backup and its index entry atomically.
    pub fn save_backup(&self, backup: &BackupRecord) -> Result<BackupMetadata, StoreError> {
        let cf_backups = self.cf(CF_BACKUPS)?;
        let cf_index = self.cf(CF_BACKUP_INDEX)?;

        let json = serde_json::to_vec(backup)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let meta = BackupMetadata {
            backup_id: backup.backup_id.clone(),
            child_id: backup.child_id.clone(),
            created_at: backup.created_at,
            activity_count: backup.states.len(),
            snapshot_size: json.len() as u64,
            compressed_size: compressed.len() as u64,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_backups, backup.backup_id.as_bytes(), &compressed);
        batch.put_cf(
            &cf_index,
            Self::index_key(&backup.child_id, &backup.backup_id),
            meta.encode()?,
        );
        self.db.write_opt(batch, &self.write_options())?;

        Ok(meta)
    }

    /// Load a backup by id.
    pub fn load_backup(&self, backup_id: &str) -> Result<BackupRecord, StoreError> {
        let cf = self.cf(CF_BACKUPS)?;
        match self.db.get_cf(&cf, backup_id.as_bytes())? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::CompressionError(e.to_string()))?;
                serde_json::from_slice(&json)
                    .map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
            None => Err(StoreError::NotFound(backup_id.to_string())),
        }
    }

    /// Backups for a child, oldest first.
    pub fn list_backups(&self, child_id: &str) -> Result<Vec<BackupMetadata>, StoreError> {
        let cf = self.cf(CF_BACKUP_INDEX)?;
        let prefix = Self::index_prefix(child_id);

        let mut backups = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&prefix, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            backups.push(BackupMetadata::decode(&value)?);
        }
        backups.sort_by_key(|m| m.created_at);
        Ok(backups)
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn index_prefix(child_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(child_id.len() + 1);
        prefix.extend_from_slice(child_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn index_key(child_id: &str, backup_id: &str) -> Vec<u8> {
        let mut key = Self::index_prefix(child_id);
        key.extend_from_slice(backup_id.as_bytes());
        key
    }
}

/// JSON-encode and LZ4-compress a progress snapshot.
pub fn compress_states(states: &[ProgressState]) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(states).map_err(|e| StoreError::SerializationError(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

/// Inverse of [`compress_states`].
pub fn decompress_states(compressed: &[u8]) -> Result<Vec<ProgressState>, StoreError> {
    let json = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::CompressionError(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

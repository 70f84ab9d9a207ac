//! Persistence for both ends of the sync engine.
//!
//! ```text
//! ┌──────────────┐   device id, offline queue   ┌──────────────┐
//! │ Client       │ ───────────────────────────► │ LocalStorage │
//! │ (per device) │                              │ (mem / file) │
//! └──────────────┘                              └──────────────┘
//!
//! ┌──────────────┐   progress, backups          ┌──────────────┐
//! │ Coordinator  │ ───────────────────────────► │ ProgressStore│
//! │ (central)    │                              │ (RocksDB)    │
//! └──────────────┘                              └──────────────┘
//! ```

pub mod local;
pub mod rocks;

pub use local::{
    FileStorage, LocalStorage, MemoryStorage, StorageError, DEVICE_ID_KEY, OFFLINE_QUEUE_KEY,
    OFFLINE_SEQ_KEY,
};
pub use rocks::{
    BackupMetadata, BackupRecord, ProgressStore, ReplayMarks, StoreConfig, StoreError,
};

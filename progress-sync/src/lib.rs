//! # progress-sync: multi-device learning progress synchronization
//!
//! Keeps a child's per-activity progress consistent across the devices they
//! use, tolerates intermittent connectivity, and supports point-in-time
//! backup and restore of the full progress state.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────┐    WebSocket     ┌─────────────────┐
//! │ ProgressSyncClient │ ◄──────────────► │ Coordinator     │
//! │ (per device)       │   Binary Proto   │ (central)       │
//! └─────────┬──────────┘                  └────────┬────────┘
//!           │                                      │
//!     ┌─────┴──────┐                       ┌───────┴────────┐
//!     ▼            ▼                       ▼                ▼
//! ┌────────┐ ┌────────────┐         ┌────────────┐  ┌──────────────┐
//! │ State  │ │ Offline    │         │ ChildRoom  │  │ ProgressStore│
//! │ store  │ │ queue      │         │ + resolver │  │ (RocksDB)    │
//! └────────┘ └────────────┘         └────────────┘  └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Progress updates, states and reply bodies
//! - [`protocol`]: Binary wire envelope (bincode) with JSON bodies
//! - [`identity`]: Persistent device id, per-process session id
//! - [`storage`]: Local key/value persistence and the coordinator store
//! - [`queue`]: Durable offline queue with confirmed replay
//! - [`state`]: Per-activity progress view of the active child
//! - [`events`]: Typed listener registry
//! - [`transport`]: Connection abstraction (WebSocket, in-memory)
//! - [`client`]: Room lifecycle, progress updates, backup/restore
//! - [`broadcast`]: Room fan-out on the coordinator
//! - [`server`]: Reference coordinator

pub mod broadcast;
pub mod client;
pub mod events;
pub mod identity;
pub mod model;
pub mod protocol;
pub mod queue;
pub mod server;
pub mod state;
pub mod storage;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, DeviceInfo, RoomFrame};
pub use client::{ClientConfig, ConnectionState, ProgressSyncClient, SyncError};
pub use events::{EventBus, EventKind, ListenerId, SyncEvent};
pub use identity::DeviceSession;
pub use model::{
    ActivityInfo, JoinAck, OfflineProgressUpdate, OfflineSyncSummary, ProgressState,
    ProgressUpdate, SessionData,
};
pub use protocol::{MessageType, Origin, ProtocolError, SyncMessage};
pub use queue::OfflineQueue;
pub use server::{
    ConflictResolver, Coordinator, CoordinatorConfig, CoordinatorStats, HighestProgressResolver,
    LatestTimestampResolver,
};
pub use state::ProgressStateStore;
pub use storage::{
    BackupMetadata, BackupRecord, FileStorage, LocalStorage, MemoryStorage, ProgressStore,
    ReplayMarks, StorageError, StoreConfig, StoreError,
};
pub use transport::{
    ChannelConnector, ChannelPeer, Connection, Connector, TransportError, TransportEvent,
    WebSocketConnector,
};

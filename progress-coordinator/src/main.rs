//! Progress sync coordinator.
//!
//! Hosts one room per child; devices join over WebSocket and exchange
//! progress updates, offline batches and backup requests.
//!
//! ```bash
//! # In-memory coordinator on the default port
//! progress-coordinator
//!
//! # Persistent coordinator favouring the furthest progress
//! progress-coordinator --storage ./progress-db --resolver highest-progress
//! ```
//!
//! Log level is controlled with `RUST_LOG` (e.g. `RUST_LOG=info`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use log::info;
use progress_sync::{
    ConflictResolver, Coordinator, CoordinatorConfig, HighestProgressResolver,
    LatestTimestampResolver,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ResolverKind {
    /// Newest write wins
    LatestTimestamp,
    /// Furthest progress wins
    HighestProgress,
}

impl ResolverKind {
    fn build(self) -> Arc<dyn ConflictResolver> {
        match self {
            Self::LatestTimestamp => Arc::new(LatestTimestampResolver),
            Self::HighestProgress => Arc::new(HighestProgressResolver),
        }
    }
}

/// Multi-device learning progress coordinator
#[derive(Debug, Parser)]
#[command(name = "progress-coordinator", version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "PROGRESS_BIND_ADDR", default_value = "127.0.0.1:9090")]
    bind: String,

    /// RocksDB directory; omit to keep everything in memory
    #[arg(long, env = "PROGRESS_STORAGE_PATH")]
    storage: Option<PathBuf>,

    /// Buffered frames per room before slow devices lose the oldest
    #[arg(long, env = "PROGRESS_BROADCAST_CAPACITY", default_value_t = 256)]
    broadcast_capacity: usize,

    /// Device sessions allowed in one child's room
    #[arg(long, env = "PROGRESS_MAX_DEVICES", default_value_t = 32)]
    max_devices: usize,

    /// Conflict resolution policy for concurrent updates
    #[arg(long, env = "PROGRESS_RESOLVER", value_enum, default_value_t = ResolverKind::LatestTimestamp)]
    resolver: ResolverKind,
}

impl Args {
    fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            bind_addr: self.bind.clone(),
            max_devices_per_room: self.max_devices,
            broadcast_capacity: self.broadcast_capacity,
            storage_path: self.storage.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting progress coordinator on {}", args.bind);
    if let Some(path) = &args.storage {
        info!("Persisting rooms and backups to {}", path.display());
    }

    let coordinator = Coordinator::new(args.config())?.with_resolver(args.resolver.build());
    coordinator.run().await
}

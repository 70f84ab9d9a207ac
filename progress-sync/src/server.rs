//! Reference coordinator: WebSocket server with one room per child.
//!
//! Architecture:
//! ```text
//! Tablet ──┐
//!          ├── ChildRoom (child_id) ── progress map ── BroadcastGroup
//! Phone  ──┘          │                     │
//!                     │                     └── ConflictResolver
//!                     ├── ProgressStore (RocksDB, optional)
//!                     │       ├── progress
//!                     │       └── backups (LZ4)
//!                     │
//!           ┌─────────┼──────────┐
//!           ▼         ▼          ▼
//!        Tablet     Phone      Laptop
//! ```
//!
//! The coordinator is the only place where concurrent updates are
//! adjudicated. Accepted updates are fanned out as `progress-updated` to every
//! device in the room, the origin included; rejected ones are answered with
//! `progress-resolved` carrying the surviving value.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, DeviceInfo, RoomFrame};
use crate::identity::generate_id;
use crate::model::{
    JoinAck, OfflineProgressUpdate, OfflineSyncSummary, ProgressState, ProgressUpdate,
    RestoreRequest,
};
use crate::protocol::{MessageType, Origin, ProtocolError, SyncMessage};
use crate::storage::{BackupRecord, ProgressStore, ReplayMarks, StoreConfig, StoreError};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum device sessions per child room
    pub max_devices_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_devices_per_room: 32,
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_devices_per_room: 8,
            broadcast_capacity: 64,
            storage_path: None,
        }
    }
}

/// Coordinator statistics.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub accepted_updates: u64,
    pub resolved_conflicts: u64,
    pub backups_created: u64,
    pub backups_restored: u64,
}

// ─── Conflict resolution ──────────────────────────────────────────────

/// Decides whether an incoming update replaces the current state.
pub trait ConflictResolver: Send + Sync {
    fn accept(&self, current: &ProgressState, incoming: &ProgressUpdate) -> bool;

    fn name(&self) -> &'static str;
}

/// Newer timestamp wins; on equal timestamps the higher progress wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestTimestampResolver;

impl ConflictResolver for LatestTimestampResolver {
    fn accept(&self, current: &ProgressState, incoming: &ProgressUpdate) -> bool {
        match incoming.timestamp.cmp(&current.last_accessed) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Equal => incoming.progress > current.progress,
            std::cmp::Ordering::Less => false,
        }
    }

    fn name(&self) -> &'static str {
        "latest-timestamp"
    }
}

/// Progress never goes backwards; equal progress falls back to recency.
#[derive(Debug, Clone, Copy, Default)]
pub struct HighestProgressResolver;

impl ConflictResolver for HighestProgressResolver {
    fn accept(&self, current: &ProgressState, incoming: &ProgressUpdate) -> bool {
        if incoming.progress == current.progress {
            return incoming.timestamp > current.last_accessed;
        }
        incoming.progress > current.progress
    }

    fn name(&self) -> &'static str {
        "highest-progress"
    }
}

/// Outcome of offering an update to a room.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The update is now the current state
    Accepted(ProgressState),
    /// The update lost; carries the surviving value as an update
    Rejected(ProgressUpdate),
}

// ─── Rooms ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct RoomEntry {
    state: ProgressState,
    device_id: String,
    session_id: String,
}

/// Authoritative progress for one child plus its broadcast group.
struct ChildRoom {
    child_id: String,
    progress: BTreeMap<String, RoomEntry>,
    broadcast: Arc<BroadcastGroup>,
    /// Highest offline sequence applied per device. One entry per device,
    /// persisted with the progress so a replay stays idempotent across
    /// room eviction and restarts.
    replay_marks: ReplayMarks,
}

impl ChildRoom {
    fn new(child_id: &str, broadcast_capacity: usize, persisted: PersistedRoom) -> Self {
        let mut room = Self {
            child_id: child_id.to_string(),
            progress: BTreeMap::new(),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            replay_marks: persisted.replay_marks,
        };
        room.replace_states(persisted.states);
        room
    }

    /// Whether an offline entry at or below the device's mark was applied before.
    fn already_replayed(&self, entry: &OfflineProgressUpdate) -> bool {
        entry.seq > 0
            && self
                .replay_marks
                .get(&entry.update.device_id)
                .is_some_and(|&mark| entry.seq <= mark)
    }

    fn mark_replayed(&mut self, entry: &OfflineProgressUpdate) {
        if entry.seq == 0 {
            return;
        }
        let mark = self
            .replay_marks
            .entry(entry.update.device_id.clone())
            .or_insert(0);
        *mark = (*mark).max(entry.seq);
    }

    fn states(&self) -> Vec<ProgressState> {
        self.progress.values().map(|e| e.state.clone()).collect()
    }

    fn replace_states(&mut self, states: Vec<ProgressState>) {
        self.progress = states
            .into_iter()
            .map(|state| {
                (
                    state.activity_id.clone(),
                    RoomEntry {
                        state,
                        device_id: String::new(),
                        session_id: String::new(),
                    },
                )
            })
            .collect();
    }

    fn resolve(&mut self, update: &ProgressUpdate, resolver: &dyn ConflictResolver) -> Resolution {
        match self.progress.get_mut(&update.activity_id) {
            Some(entry) if !resolver.accept(&entry.state, update) => {
                Resolution::Rejected(ProgressUpdate {
                    child_id: self.child_id.clone(),
                    activity_id: update.activity_id.clone(),
                    progress: entry.state.progress,
                    timestamp: entry.state.last_accessed,
                    device_id: entry.device_id.clone(),
                    session_id: entry.session_id.clone(),
                    metadata: None,
                })
            }
            Some(entry) => {
                entry.state.apply_update(update);
                entry.device_id = update.device_id.clone();
                entry.session_id = update.session_id.clone();
                Resolution::Accepted(entry.state.clone())
            }
            None => {
                let state = ProgressState::from_update(update);
                self.progress.insert(
                    update.activity_id.clone(),
                    RoomEntry {
                        state: state.clone(),
                        device_id: update.device_id.clone(),
                        session_id: update.session_id.clone(),
                    },
                );
                Resolution::Accepted(state)
            }
        }
    }
}

/// Durable part of a room.
#[derive(Debug, Default)]
struct PersistedRoom {
    states: Vec<ProgressState>,
    replay_marks: ReplayMarks,
}

/// Room membership of one connection.
#[derive(Debug, Clone)]
struct Member {
    child_id: String,
    device_id: String,
    session_id: String,
}

/// Per-connection state.
#[derive(Default)]
pub struct ConnectionContext {
    member: Option<Member>,
    room_rx: Option<broadcast::Receiver<RoomFrame>>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Child whose room this connection joined.
    pub fn child_id(&self) -> Option<&str> {
        self.member.as_ref().map(|m| m.child_id.as_str())
    }

    /// Broadcast receiver of the joined room.
    pub fn room_receiver(&mut self) -> Option<&mut broadcast::Receiver<RoomFrame>> {
        self.room_rx.as_mut()
    }

    fn session_id(&self) -> Option<&str> {
        self.member.as_ref().map(|m| m.session_id.as_str())
    }
}

/// Shared coordinator state; every connection task holds an `Arc` to it.
pub struct CoordinatorState {
    config: CoordinatorConfig,
    rooms: RwLock<HashMap<String, ChildRoom>>,
    backups: RwLock<HashMap<String, BackupRecord>>,
    stats: RwLock<CoordinatorStats>,
    store: Option<Arc<ProgressStore>>,
    resolver: Arc<dyn ConflictResolver>,
}

/// The coordinator server.
pub struct Coordinator {
    state: Arc<CoordinatorState>,
}

impl Coordinator {
    /// Create a coordinator, opening the durable store if configured.
    pub fn new(config: CoordinatorConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Some(Arc::new(ProgressStore::open(store_config)?))
            }
            None => None,
        };

        Ok(Self {
            state: Arc::new(CoordinatorState {
                config,
                rooms: RwLock::new(HashMap::new()),
                backups: RwLock::new(HashMap::new()),
                stats: RwLock::new(CoordinatorStats::default()),
                store,
                resolver: Arc::new(LatestTimestampResolver),
            }),
        })
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Result<Self, StoreError> {
        Self::new(CoordinatorConfig::default())
    }

    /// Swap the conflict resolution policy. Must be called before serving.
    pub fn with_resolver(self, resolver: Arc<dyn ConflictResolver>) -> Self {
        let state = match Arc::try_unwrap(self.state) {
            Ok(mut state) => {
                state.resolver = resolver;
                state
            }
            Err(shared) => {
                log::warn!("Coordinator already serving; resolver unchanged");
                return Self { state: shared };
            }
        };
        Self {
            state: Arc::new(state),
        }
    }

    /// Load every persisted child room into memory.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let Some(store) = &self.state.store else {
            return Ok(0);
        };

        let children = store.list_children()?;
        let mut rooms = self.state.rooms.write().await;
        for child_id in &children {
            let persisted = PersistedRoom {
                states: store.load_progress(child_id)?,
                replay_marks: store.load_replay_marks(child_id)?,
            };
            log::info!(
                "Recovered {} activities for child {child_id}",
                persisted.states.len()
            );
            rooms.insert(
                child_id.clone(),
                ChildRoom::new(child_id, self.state.config.broadcast_capacity, persisted),
            );
        }
        let recovered = rooms.len();
        drop(rooms);

        self.state.stats.write().await.active_rooms = recovered;
        log::info!("Recovery complete: {} child rooms restored", children.len());
        Ok(children.len())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} child rooms from persistent storage");
        }
        log::info!(
            "Coordinator listening on {} (resolver: {})",
            listener.local_addr()?,
            self.state.resolver.name()
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, state).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> CoordinatorStats {
        self.state.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.state.config.bind_addr
    }

    pub fn store(&self) -> Option<&Arc<ProgressStore>> {
        self.state.store.as_ref()
    }

    /// Shared state, for driving the message handler without a socket.
    pub fn state(&self) -> &Arc<CoordinatorState> {
        &self.state
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: Arc<CoordinatorState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = state.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut ctx = ConnectionContext::new();
    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = state.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            for reply in state.handle_frame(&mut ctx, &data).await {
                                ws_sender.send(Message::Binary(reply.into())).await?;
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        Some(Ok(_)) => {}
                    }
                }

                frame = async {
                    match ctx.room_receiver() {
                        Some(rx) => rx.recv().await,
                        // Not in a room yet
                        None => std::future::pending().await,
                    }
                } => {
                    match frame {
                        Ok(frame) => {
                            if ctx.session_id().is_some_and(|s| frame.is_for(s)) {
                                ws_sender.send(Message::Binary(frame.bytes.to_vec().into())).await?;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Device at {addr} lagged by {n} messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
        Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
    }
    .await;

    state.leave(&mut ctx).await;
    state.stats.write().await.active_connections -= 1;
    result
}

impl CoordinatorState {
    /// Decode a frame, handle it, and return the encoded replies for the
    /// sending connection. Undecodable frames are answered with `error`.
    pub async fn handle_frame(&self, ctx: &mut ConnectionContext, frame: &[u8]) -> Vec<Vec<u8>> {
        let origin = Origin::coordinator(ctx.child_id().unwrap_or_default());
        let replies = match SyncMessage::decode(frame) {
            Ok(msg) => {
                let request_id = msg.request_id;
                let msg_type = msg.msg_type;
                match self.handle_message(ctx, msg).await {
                    Ok(replies) => replies,
                    Err(e) => {
                        log::warn!("Failed to handle {msg_type:?}: {e}");
                        error_reply(MessageType::Error, origin, request_id, e.to_string())
                    }
                }
            }
            Err(e) => {
                log::warn!("Failed to decode frame: {e}");
                error_reply(MessageType::Error, origin, None, e.to_string())
            }
        };

        replies
            .into_iter()
            .filter_map(|reply| match reply.encode() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::error!("Failed to encode {:?}: {e}", reply.msg_type);
                    None
                }
            })
            .collect()
    }

    /// Handle one decoded message; returns replies for the sender.
    pub async fn handle_message(
        &self,
        ctx: &mut ConnectionContext,
        msg: SyncMessage,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        if msg.msg_type == MessageType::JoinRoom {
            return self.join(ctx, &msg.origin).await;
        }

        let Some(member) = ctx.member.clone() else {
            return Ok(error_reply(
                MessageType::Error,
                Origin::coordinator(&msg.origin.child_id),
                msg.request_id,
                "join a room first",
            ));
        };
        let origin = Origin::coordinator(&member.child_id);

        match msg.msg_type {
            MessageType::ProgressUpdate => {
                let update: ProgressUpdate = msg.body()?;
                if let Some(problem) = validate(&update, &member) {
                    return Ok(error_reply(
                        MessageType::ProgressError,
                        origin,
                        msg.request_id,
                        problem,
                    ));
                }
                self.apply_update(&member, &update).await
            }

            MessageType::OfflineSync => {
                let entries: Vec<OfflineProgressUpdate> = msg.body()?;
                self.apply_offline(&member, entries).await
            }

            MessageType::RequestSync => {
                let states = self.room_states(&member.child_id).await;
                Ok(vec![SyncMessage::progress_state(origin, &states)?])
            }

            MessageType::CreateBackup => self.create_backup(&member, msg.request_id).await,

            MessageType::RestoreBackup => {
                let request: RestoreRequest = msg.body()?;
                self.restore_backup(&member, msg.request_id, &request.backup_id)
                    .await
            }

            other => Ok(error_reply(
                MessageType::Error,
                origin,
                msg.request_id,
                format!("unsupported message type {other:?}"),
            )),
        }
    }

    async fn join(
        &self,
        ctx: &mut ConnectionContext,
        origin: &Origin,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        if origin.child_id.is_empty() || origin.session_id.is_empty() {
            return Ok(error_reply(
                MessageType::Error,
                Origin::coordinator(&origin.child_id),
                None,
                "join requires child and session ids",
            ));
        }
        // Switching rooms on the same connection
        self.leave(ctx).await;

        let (rx, connected_devices, states) = {
            let mut rooms = self.rooms.write().await;
            if !rooms.contains_key(&origin.child_id) {
                let persisted = self.load_persisted(&origin.child_id);
                rooms.insert(
                    origin.child_id.clone(),
                    ChildRoom::new(&origin.child_id, self.config.broadcast_capacity, persisted),
                );
            }
            let room_count = rooms.len();
            let Some(room) = rooms.get(&origin.child_id) else {
                return Ok(Vec::new());
            };

            let present = room.broadcast.device_count().await;
            let rejoining = room.broadcast.has_device(&origin.session_id).await;
            if present >= self.config.max_devices_per_room && !rejoining {
                log::warn!("Room for child {} is full", origin.child_id);
                return Ok(error_reply(
                    MessageType::Error,
                    Origin::coordinator(&origin.child_id),
                    None,
                    "room is full",
                ));
            }

            let rx = room
                .broadcast
                .add_device(DeviceInfo::new(&origin.device_id, &origin.session_id))
                .await;
            let connected = room.broadcast.device_count().await;
            self.stats.write().await.active_rooms = room_count;
            (rx, connected, room.states())
        };

        ctx.member = Some(Member {
            child_id: origin.child_id.clone(),
            device_id: origin.device_id.clone(),
            session_id: origin.session_id.clone(),
        });
        ctx.room_rx = Some(rx);

        log::info!(
            "Device {} joined room for child {} ({connected_devices} connected)",
            origin.device_id,
            origin.child_id
        );

        let ack = JoinAck {
            child_id: origin.child_id.clone(),
            device_id: origin.device_id.clone(),
            session_id: origin.session_id.clone(),
            connected_devices,
        };
        Ok(vec![
            SyncMessage::joined(&ack)?,
            SyncMessage::progress_state(Origin::coordinator(&origin.child_id), &states)?,
        ])
    }

    /// Remove the connection from its room. Empty rooms are dropped only
    /// when their state is durable.
    pub async fn leave(&self, ctx: &mut ConnectionContext) {
        ctx.room_rx = None;
        let Some(member) = ctx.member.take() else {
            return;
        };

        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&member.child_id) else {
            return;
        };
        room.broadcast.remove_device(&member.session_id).await;
        log::info!(
            "Device {} left room for child {}",
            member.device_id,
            member.child_id
        );

        if room.broadcast.device_count().await == 0 {
            if let Some(store) = &self.store {
                match save_room(store, room) {
                    Ok(()) => {
                        rooms.remove(&member.child_id);
                        log::info!("Room for child {} closed (empty)", member.child_id);
                    }
                    Err(e) => log::error!(
                        "Failed to persist progress for child {}: {e}",
                        member.child_id
                    ),
                }
            }
        }
        let room_count = rooms.len();
        drop(rooms);
        self.stats.write().await.active_rooms = room_count;
    }

    async fn apply_update(
        &self,
        member: &Member,
        update: &ProgressUpdate,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(&member.child_id) else {
            return Ok(Vec::new());
        };

        match room.resolve(update, self.resolver.as_ref()) {
            Resolution::Accepted(_) => {
                // The origin gets the echo too; it confirms the optimistic write
                room.broadcast
                    .broadcast(&SyncMessage::progress_updated(update)?, None)?;
                self.persist(room);
                drop(rooms);
                self.stats.write().await.accepted_updates += 1;
                Ok(Vec::new())
            }
            Resolution::Rejected(surviving) => {
                log::debug!(
                    "Rejected update for {} from {} ({} kept)",
                    update.activity_id,
                    update.device_id,
                    surviving.progress
                );
                drop(rooms);
                self.stats.write().await.resolved_conflicts += 1;
                Ok(vec![SyncMessage::progress_resolved(&surviving)?])
            }
        }
    }

    async fn apply_offline(
        &self,
        member: &Member,
        entries: Vec<OfflineProgressUpdate>,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        let origin = Origin::coordinator(&member.child_id);
        let mut summary = OfflineSyncSummary::default();
        let mut rejected = Vec::new();

        let states = {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(&member.child_id) else {
                return Ok(Vec::new());
            };

            let replayed = !entries.is_empty();
            for entry in entries {
                if room.already_replayed(&entry) {
                    log::debug!("Offline entry {} already applied", entry.id);
                    summary.synced_ids.push(entry.id);
                    continue;
                }
                if let Some(problem) = validate(&entry.update, member) {
                    log::warn!("Dropping offline entry {}: {problem}", entry.id);
                    room.mark_replayed(&entry);
                    summary.synced_ids.push(entry.id);
                    continue;
                }

                match room.resolve(&entry.update, self.resolver.as_ref()) {
                    Resolution::Accepted(_) => {
                        summary.applied += 1;
                        room.broadcast
                            .broadcast(&SyncMessage::progress_updated(&entry.update)?, None)?;
                    }
                    Resolution::Rejected(surviving) => {
                        summary.conflicts += 1;
                        rejected.push(surviving);
                    }
                }
                room.mark_replayed(&entry);
                summary.synced_ids.push(entry.id);
            }

            if replayed {
                self.persist(room);
            }
            room.states()
        };

        {
            let mut s = self.stats.write().await;
            s.accepted_updates += summary.applied as u64;
            s.resolved_conflicts += summary.conflicts as u64;
        }
        log::info!(
            "Offline sync for child {}: {} applied, {} conflicts",
            member.child_id,
            summary.applied,
            summary.conflicts
        );
        if !rejected.is_empty() {
            log::debug!("{} offline updates lost to newer values", rejected.len());
        }

        Ok(vec![
            SyncMessage::offline_sync_complete(origin.clone(), &summary)?,
            SyncMessage::progress_state(origin, &states)?,
        ])
    }

    async fn create_backup(
        &self,
        member: &Member,
        request_id: Option<Uuid>,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        let origin = Origin::coordinator(&member.child_id);
        let record = BackupRecord {
            backup_id: generate_id("backup"),
            child_id: member.child_id.clone(),
            created_at: Utc::now(),
            states: self.room_states(&member.child_id).await,
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.save_backup(&record) {
                log::error!("Failed to persist backup for child {}: {e}", member.child_id);
                return Ok(error_reply(
                    MessageType::BackupError,
                    origin,
                    request_id,
                    format!("backup failed: {e}"),
                ));
            }
        }

        log::info!(
            "Created backup {} for child {} ({} activities)",
            record.backup_id,
            member.child_id,
            record.states.len()
        );
        let reply = SyncMessage::backup_created(origin, request_id, &record.backup_id)?;
        // With a store the record is read back from RocksDB on restore
        if self.store.is_none() {
            self.backups
                .write()
                .await
                .insert(record.backup_id.clone(), record);
        }
        self.stats.write().await.backups_created += 1;
        Ok(vec![reply])
    }

    async fn restore_backup(
        &self,
        member: &Member,
        request_id: Option<Uuid>,
        backup_id: &str,
    ) -> Result<Vec<SyncMessage>, ProtocolError> {
        let origin = Origin::coordinator(&member.child_id);

        let record = match self.find_backup(backup_id).await {
            Some(record) if record.child_id == member.child_id => record,
            Some(_) => {
                log::warn!(
                    "Backup {backup_id} does not belong to child {}",
                    member.child_id
                );
                return Ok(vec![SyncMessage::backup_restored(
                    origin, request_id, backup_id, false,
                )?]);
            }
            None => {
                log::warn!("Backup {backup_id} not found");
                return Ok(vec![SyncMessage::backup_restored(
                    origin, request_id, backup_id, false,
                )?]);
            }
        };

        {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get_mut(&member.child_id) else {
                return Ok(vec![SyncMessage::backup_restored(
                    origin, request_id, backup_id, false,
                )?]);
            };
            room.replace_states(record.states.clone());
            self.persist(room);
            room.broadcast.broadcast(
                &SyncMessage::progress_state(origin.clone(), &record.states)?,
                Some(&member.session_id),
            )?;
        }

        log::info!("Restored backup {backup_id} for child {}", member.child_id);
        self.stats.write().await.backups_restored += 1;
        Ok(vec![SyncMessage::backup_restored(
            origin, request_id, backup_id, true,
        )?])
    }

    async fn find_backup(&self, backup_id: &str) -> Option<BackupRecord> {
        if let Some(record) = self.backups.read().await.get(backup_id) {
            return Some(record.clone());
        }
        let store = self.store.as_ref()?;
        match store.load_backup(backup_id) {
            Ok(record) => Some(record),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => {
                log::error!("Failed to load backup {backup_id}: {e}");
                None
            }
        }
    }

    async fn room_states(&self, child_id: &str) -> Vec<ProgressState> {
        self.rooms
            .read()
            .await
            .get(child_id)
            .map(ChildRoom::states)
            .unwrap_or_default()
    }

    fn load_persisted(&self, child_id: &str) -> PersistedRoom {
        let Some(store) = &self.store else {
            return PersistedRoom::default();
        };
        let states = match store.load_progress(child_id) {
            Ok(states) => {
                if !states.is_empty() {
                    log::info!("Loaded persisted progress for child {child_id}");
                }
                states
            }
            Err(e) => {
                log::error!("Failed to load progress for child {child_id}: {e}");
                Vec::new()
            }
        };
        let replay_marks = store.load_replay_marks(child_id).unwrap_or_else(|e| {
            log::error!("Failed to load replay marks for child {child_id}: {e}");
            ReplayMarks::new()
        });
        PersistedRoom {
            states,
            replay_marks,
        }
    }

    fn persist(&self, room: &ChildRoom) {
        if let Some(store) = &self.store {
            if let Err(e) = save_room(store, room) {
                log::error!("Failed to persist progress for child {}: {e}", room.child_id);
            }
        }
    }

    pub fn resolver_name(&self) -> &'static str {
        self.resolver.name()
    }
}

fn save_room(store: &ProgressStore, room: &ChildRoom) -> Result<(), StoreError> {
    store.save_progress(&room.child_id, &room.states())?;
    store.save_replay_marks(&room.child_id, &room.replay_marks)
}

fn validate(update: &ProgressUpdate, member: &Member) -> Option<String> {
    if update.child_id != member.child_id {
        return Some(format!(
            "update for child {} sent to room {}",
            update.child_id, member.child_id
        ));
    }
    if !update.progress.is_finite() {
        return Some("progress must be a finite number".to_string());
    }
    if update.activity_id.is_empty() {
        return Some("activity id is required".to_string());
    }
    None
}

fn error_reply(
    msg_type: MessageType,
    origin: Origin,
    request_id: Option<Uuid>,
    message: impl Into<String>,
) -> Vec<SyncMessage> {
    match SyncMessage::error(msg_type, origin, request_id, message) {
        Ok(msg) => vec![msg],
        Err(e) => {
            log::error!("Failed to build error reply: {e}");
            Vec::new()
        }
    }
}

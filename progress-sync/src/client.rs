//! Progress sync client: one per device, one child room at a time.
//!
//! Provides:
//! - Room lifecycle (connect, disconnect, reconnect on connectivity changes)
//! - Optimistic local progress updates, sent immediately when connected
//! - Offline queue for updates issued while disconnected, replayed on reconnect
//! - Backup/restore requests with correlated replies and bounded waits
//!
//! ```text
//! update_progress ──► ProgressStateStore (optimistic)
//!        │
//!        ├── connected ──► Connection.outgoing ──► coordinator
//!        │                                            │
//!        └── offline ───► OfflineQueue                │ progress-updated / resolved /
//!                             │                       │ state / offline-sync-complete
//!                             └── replay on join ◄────┘
//!                                                     ▼
//!                                  reader task ──► store + EventBus
//! ```
//!
//! Reference: Kleppmann, Chapter 5 (Replication)

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use uuid::Uuid;

use crate::events::{EventBus, EventKind, ListenerId, SyncEvent};
use crate::identity::DeviceSession;
use crate::model::{
    BackupCreated, BackupRestored, ErrorPayload, JoinAck, OfflineProgressUpdate,
    OfflineSyncSummary, ProgressState, ProgressUpdate,
};
use crate::protocol::{MessageType, Origin, ProtocolError, SyncMessage};
use crate::queue::OfflineQueue;
use crate::state::ProgressStateStore;
use crate::storage::LocalStorage;
use crate::transport::{Connection, Connector, TransportEvent, WebSocketConnector};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Coordinator URL used by [`ProgressSyncClient::websocket`]
    pub server_url: String,
    /// Bound on opening the transport plus the room acknowledgement
    pub connect_timeout: Duration,
    /// Bound on waiting for `backup-created`
    pub backup_timeout: Duration,
    /// Bound on waiting for `backup-restored`
    pub restore_timeout: Duration,
    /// Frames buffered per direction by the WebSocket transport
    pub outgoing_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            connect_timeout: Duration::from_secs(10),
            backup_timeout: Duration::from_secs(10),
            // Restoring is heavier than snapshotting
            restore_timeout: Duration::from_secs(15),
            outgoing_capacity: 256,
        }
    }
}

impl ClientConfig {
    /// Short waits for tests.
    pub fn for_testing() -> Self {
        Self {
            server_url: "ws://127.0.0.1:0".to_string(),
            connect_timeout: Duration::from_millis(500),
            backup_timeout: Duration::from_millis(300),
            restore_timeout: Duration::from_millis(400),
            outgoing_capacity: 16,
        }
    }
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("No active child session")]
    NotConnected,
    #[error("Timed out waiting for room membership")]
    ConnectionTimeout,
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("Timed out waiting for backup")]
    BackupTimeout,
    #[error("Timed out waiting for restore")]
    RestoreTimeout,
    #[error("Backup failed: {0}")]
    Backup(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Live transport for the current generation.
struct Link {
    outgoing: mpsc::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct Session {
    child_id: Option<String>,
    state: ConnectionState,
    /// Bumped on every connect/teardown; readers of older generations are stale
    generation: u64,
    link: Option<Link>,
    join_waiter: Option<oneshot::Sender<Result<JoinAck, SyncError>>>,
}

impl Session {
    fn take_link(&mut self) -> Option<Link> {
        self.link.take()
    }
}

/// Reply to a backup or restore request.
#[derive(Debug)]
enum BackupReply {
    Created(String),
    Restored(bool),
    Failed(String),
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    identity: DeviceSession,
    events: EventBus,
    session: Mutex<Session>,
    store: RwLock<ProgressStateStore>,
    queue: Mutex<OfflineQueue>,
    pending: Mutex<HashMap<Uuid, oneshot::Sender<BackupReply>>>,
    /// Earlier sessions of this device whose queued updates were replayed;
    /// their echoes are confirmations, not remote changes
    adopted_sessions: Mutex<HashSet<String>>,
}

/// The progress sync client.
///
/// Cheap to clone; clones share the same connection, state and queue.
#[derive(Clone)]
pub struct ProgressSyncClient {
    shared: Arc<Shared>,
}

impl ProgressSyncClient {
    /// Create a client over an arbitrary transport and local storage.
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        storage: Arc<dyn LocalStorage>,
    ) -> Self {
        let queue = OfflineQueue::load(storage.clone());
        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                identity: DeviceSession::new(storage),
                events: EventBus::new(),
                session: Mutex::new(Session {
                    child_id: None,
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    link: None,
                    join_waiter: None,
                }),
                store: RwLock::new(ProgressStateStore::new()),
                queue: Mutex::new(queue),
                pending: Mutex::new(HashMap::new()),
                adopted_sessions: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Create a client talking WebSocket to `config.server_url`.
    pub fn websocket(config: ClientConfig, storage: Arc<dyn LocalStorage>) -> Self {
        let connector = Arc::new(
            WebSocketConnector::new(config.server_url.clone())
                .with_capacity(config.outgoing_capacity),
        );
        Self::new(config, connector, storage)
    }

    // ─── Room lifecycle ───────────────────────────────────────────────

    /// Join the room for `child_id`, leaving any current room first.
    ///
    /// Resolves once the coordinator acknowledged membership. Queued offline
    /// updates for this child are replayed right after.
    pub async fn connect(&self, child_id: impl Into<String>) -> Result<(), SyncError> {
        let child_id = child_id.into();
        let shared = &self.shared;

        let (generation, switching_child) = {
            let mut session = shared.session.lock().await;
            if let Some(link) = session.take_link() {
                link.reader.abort();
            }
            let switching_child = session
                .child_id
                .as_deref()
                .is_some_and(|current| current != child_id);
            session.generation += 1;
            session.child_id = Some(child_id.clone());
            session.state = ConnectionState::Connecting;
            session.join_waiter = None;
            (session.generation, switching_child)
        };
        shared.fail_pending_requests().await;
        if switching_child {
            shared.store.write().await.clear();
        }
        log::info!("Connecting to room for child {child_id}");

        let origin = shared.origin(&child_id);
        let join_frame = match SyncMessage::join_room(origin.clone()).encode() {
            Ok(frame) => frame,
            Err(e) => return Err(shared.abort_connect(generation, e.into()).await),
        };

        let deadline = Instant::now() + shared.config.connect_timeout;
        let Connection { outgoing, incoming } =
            match timeout_at(deadline, shared.connector.open()).await {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    return Err(shared
                        .abort_connect(generation, SyncError::ConnectionError(e.to_string()))
                        .await)
                }
                Err(_) => {
                    return Err(shared
                        .abort_connect(generation, SyncError::ConnectionTimeout)
                        .await)
                }
            };

        let (join_tx, join_rx) = oneshot::channel();
        {
            let mut session = shared.session.lock().await;
            if session.generation != generation {
                return Err(SyncError::ConnectionError(
                    "superseded by a newer connection attempt".into(),
                ));
            }
            session.join_waiter = Some(join_tx);
            let reader_shared = shared.clone();
            let reader = tokio::spawn(async move {
                reader_shared.read_loop(generation, incoming).await;
            });
            session.link = Some(Link {
                outgoing: outgoing.clone(),
                reader,
            });
        }

        if outgoing.send(join_frame).await.is_err() {
            return Err(shared
                .abort_connect(
                    generation,
                    SyncError::ConnectionError("connection closed before join".into()),
                )
                .await);
        }

        let ack = match timeout_at(deadline, join_rx).await {
            Ok(Ok(Ok(ack))) => ack,
            Ok(Ok(Err(e))) => return Err(shared.abort_connect(generation, e).await),
            Ok(Err(_)) => {
                return Err(shared
                    .abort_connect(
                        generation,
                        SyncError::ConnectionError("connection closed before join".into()),
                    )
                    .await)
            }
            Err(_) => {
                return Err(shared
                    .abort_connect(generation, SyncError::ConnectionTimeout)
                    .await)
            }
        };

        {
            let mut session = shared.session.lock().await;
            if session.generation != generation || session.link.is_none() {
                return Err(SyncError::ConnectionError(
                    "connection lost during join".into(),
                ));
            }
            session.state = ConnectionState::Connected;
        }

        log::info!(
            "Joined room for child {child_id} ({} device(s) connected)",
            ack.connected_devices
        );
        shared.events.emit(&SyncEvent::Connected(ack));
        shared.replay_offline_queue(origin, &outgoing).await;
        Ok(())
    }

    /// Leave the room, clear local state and drop every listener. Idempotent.
    ///
    /// The offline queue is kept; it is device state, not session state.
    pub async fn disconnect(&self) {
        let shared = &self.shared;
        let link = {
            let mut session = shared.session.lock().await;
            session.generation += 1;
            session.child_id = None;
            session.state = ConnectionState::Disconnected;
            session.join_waiter = None;
            session.take_link()
        };
        if let Some(link) = link {
            link.reader.abort();
            log::info!("Disconnected from coordinator");
        }
        shared.fail_pending_requests().await;
        shared.adopted_sessions.lock().await.clear();
        shared.store.write().await.clear();
        shared.events.clear();
    }

    /// Consume a connectivity signal.
    ///
    /// Going offline marks the client disconnected immediately but keeps the
    /// child id and the queue. Coming back online reconnects to the last child.
    pub async fn set_online(&self, online: bool) -> Result<(), SyncError> {
        let shared = &self.shared;
        if online {
            let child_id = {
                let session = shared.session.lock().await;
                match session.state {
                    ConnectionState::Disconnected => session.child_id.clone(),
                    _ => None,
                }
            };
            if let Some(child_id) = child_id {
                log::info!("Connectivity restored, rejoining child {child_id}");
                self.connect(child_id).await?;
            }
            return Ok(());
        }

        let (link, was_connected) = {
            let mut session = shared.session.lock().await;
            let was_connected = session.state == ConnectionState::Connected;
            session.generation += 1;
            session.state = ConnectionState::Disconnected;
            if let Some(waiter) = session.join_waiter.take() {
                let _ = waiter.send(Err(SyncError::ConnectionError("went offline".into())));
            }
            (session.take_link(), was_connected)
        };
        if let Some(link) = link {
            link.reader.abort();
        }
        shared.fail_pending_requests().await;
        if was_connected {
            log::info!("Connectivity lost, updates will be queued");
            shared.events.emit(&SyncEvent::Disconnected);
        }
        Ok(())
    }

    /// Drive [`set_online`](Self::set_online) from a connectivity watch channel.
    pub fn watch_connectivity(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if let Err(e) = client.set_online(is_online).await {
                    log::warn!("Reconnect after connectivity change failed: {e}");
                }
            }
        })
    }

    // ─── Progress ─────────────────────────────────────────────────────

    /// Record progress on an activity for the active child.
    ///
    /// The local store is updated before anything is sent. When connected with
    /// nothing queued for the child, the update is handed to the transport
    /// without waiting for a reply. Otherwise it goes to the offline queue,
    /// and when connected the queue is flushed so the update stays behind
    /// the ones queued before it.
    pub async fn update_progress(
        &self,
        activity_id: impl Into<String>,
        progress: f64,
        metadata: Option<Value>,
    ) -> Result<(), SyncError> {
        let shared = &self.shared;
        let session = shared.session.lock().await;
        let child_id = session.child_id.clone().ok_or(SyncError::NotConnected)?;

        let update = ProgressUpdate {
            child_id,
            activity_id: activity_id.into(),
            progress,
            timestamp: Utc::now(),
            device_id: shared.identity.device_id().to_string(),
            session_id: shared.identity.session_id().to_string(),
            metadata,
        };
        shared.store.write().await.apply_local(&update);

        // Sending under the session lock keeps per-device send order
        let flush_to = match (&session.state, &session.child_id, &session.link) {
            (ConnectionState::Connected, Some(child_id), Some(link)) => {
                if shared.queue.lock().await.has_pending_for(child_id) {
                    Some((child_id.clone(), link.outgoing.clone()))
                } else {
                    match SyncMessage::progress_update(&update).and_then(|m| m.encode()) {
                        Ok(frame) => match link.outgoing.try_send(frame) {
                            Ok(()) => return Ok(()),
                            Err(e) => {
                                log::warn!("Failed to send progress update, queueing it: {e}");
                                Some((child_id.clone(), link.outgoing.clone()))
                            }
                        },
                        Err(e) => {
                            log::warn!("Failed to encode progress update, queueing it: {e}");
                            None
                        }
                    }
                }
            }
            _ => None,
        };
        // Queued before the lock is released so later updates see the backlog
        shared.enqueue_offline(update).await;
        drop(session);

        if let Some((child_id, outgoing)) = flush_to {
            shared
                .replay_offline_queue(shared.origin(&child_id), &outgoing)
                .await;
        }
        Ok(())
    }

    /// Ask the coordinator to re-deliver the full state. No-op when offline.
    pub async fn request_sync(&self) -> Result<(), SyncError> {
        let Some((child_id, outgoing)) = self.shared.active_link().await else {
            log::debug!("Skipping sync request while disconnected");
            return Ok(());
        };
        let frame = SyncMessage::request_sync(self.shared.origin(&child_id)).encode()?;
        if outgoing.send(frame).await.is_err() {
            log::debug!("Connection closed before sync request was sent");
        }
        Ok(())
    }

    // ─── Backups ──────────────────────────────────────────────────────

    /// Snapshot the child's progress on the coordinator.
    ///
    /// Returns `Ok(None)` when not connected (or the connection goes away
    /// while waiting).
    pub async fn create_backup(&self) -> Result<Option<String>, SyncError> {
        let Some((child_id, outgoing)) = self.shared.active_link().await else {
            return Ok(None);
        };
        let request_id = Uuid::new_v4();
        let frame = SyncMessage::create_backup(self.shared.origin(&child_id), request_id).encode()?;

        let reply = self
            .shared
            .request(request_id, frame, &outgoing, self.shared.config.backup_timeout)
            .await;
        match reply {
            RequestOutcome::Reply(BackupReply::Created(backup_id)) => {
                log::info!("Created backup {backup_id} for child {child_id}");
                Ok(Some(backup_id))
            }
            RequestOutcome::Reply(BackupReply::Failed(message)) => Err(SyncError::Backup(message)),
            RequestOutcome::Reply(BackupReply::Restored(_)) => {
                Err(SyncError::Backup("unexpected restore reply".into()))
            }
            RequestOutcome::Unavailable => Ok(None),
            RequestOutcome::TimedOut => Err(SyncError::BackupTimeout),
        }
    }

    /// Restore a backup on the coordinator and refresh local state from it.
    ///
    /// Returns `Ok(false)` when not connected or when the coordinator reports
    /// that restoration failed.
    pub async fn restore_backup(&self, backup_id: &str) -> Result<bool, SyncError> {
        let Some((child_id, outgoing)) = self.shared.active_link().await else {
            return Ok(false);
        };
        let request_id = Uuid::new_v4();
        let frame =
            SyncMessage::restore_backup(self.shared.origin(&child_id), request_id, backup_id)?
                .encode()?;

        let reply = self
            .shared
            .request(request_id, frame, &outgoing, self.shared.config.restore_timeout)
            .await;
        match reply {
            RequestOutcome::Reply(BackupReply::Restored(true)) => {
                log::info!("Restored backup {backup_id} for child {child_id}");
                self.request_sync().await?;
                Ok(true)
            }
            RequestOutcome::Reply(BackupReply::Restored(false)) => {
                log::warn!("Coordinator could not restore backup {backup_id}");
                Ok(false)
            }
            RequestOutcome::Reply(BackupReply::Failed(message)) => {
                log::warn!("Restore of backup {backup_id} failed: {message}");
                Ok(false)
            }
            RequestOutcome::Reply(BackupReply::Created(_)) | RequestOutcome::Unavailable => {
                Ok(false)
            }
            RequestOutcome::TimedOut => Err(SyncError::RestoreTimeout),
        }
    }

    // ─── Events ───────────────────────────────────────────────────────

    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        self.shared.events.off(kind, id)
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Current progress for an activity (a snapshot copy).
    pub async fn progress_state(&self, activity_id: &str) -> Option<ProgressState> {
        self.shared.store.read().await.get(activity_id)
    }

    /// Current progress for every tracked activity (snapshot copies).
    pub async fn all_progress_state(&self) -> Vec<ProgressState> {
        self.shared.store.read().await.get_all()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.shared.session.lock().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.connection_state().await == ConnectionState::Connected
    }

    /// Child whose room this client is in (or will rejoin).
    pub async fn child_id(&self) -> Option<String> {
        self.shared.session.lock().await.child_id.clone()
    }

    /// Number of queued updates not yet acknowledged by the coordinator.
    pub async fn offline_queue_len(&self) -> usize {
        self.shared.queue.lock().await.size_unsynced()
    }

    /// Unsynced queued updates in enqueue order.
    pub async fn queued_updates(&self) -> Vec<OfflineProgressUpdate> {
        self.shared.queue.lock().await.pending()
    }

    pub fn device_id(&self) -> &str {
        self.shared.identity.device_id()
    }

    pub fn session_id(&self) -> &str {
        self.shared.identity.session_id()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }
}

enum RequestOutcome {
    Reply(BackupReply),
    Unavailable,
    TimedOut,
}

impl Shared {
    fn origin(&self, child_id: &str) -> Origin {
        Origin::new(
            child_id,
            self.identity.device_id(),
            self.identity.session_id(),
        )
    }

    /// Child id and sender of the current connection, if connected.
    async fn active_link(&self) -> Option<(String, mpsc::Sender<Vec<u8>>)> {
        let session = self.session.lock().await;
        match (&session.state, &session.child_id, &session.link) {
            (ConnectionState::Connected, Some(child_id), Some(link)) => {
                Some((child_id.clone(), link.outgoing.clone()))
            }
            _ => None,
        }
    }

    /// Tear down a failed connection attempt and hand back its error.
    async fn abort_connect(&self, generation: u64, error: SyncError) -> SyncError {
        let mut session = self.session.lock().await;
        if session.generation == generation {
            if let Some(link) = session.take_link() {
                link.reader.abort();
            }
            session.state = ConnectionState::Disconnected;
            session.join_waiter = None;
        }
        log::warn!("Connection attempt failed: {error}");
        error
    }

    /// Send a correlated request and wait for its reply.
    async fn request(
        &self,
        request_id: Uuid,
        frame: Vec<u8>,
        outgoing: &mpsc::Sender<Vec<u8>>,
        wait: Duration,
    ) -> RequestOutcome {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, reply_tx);

        if outgoing.send(frame).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return RequestOutcome::Unavailable;
        }

        match timeout(wait, reply_rx).await {
            Ok(Ok(reply)) => RequestOutcome::Reply(reply),
            // Waiter dropped: the connection went away
            Ok(Err(_)) => RequestOutcome::Unavailable,
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                RequestOutcome::TimedOut
            }
        }
    }

    async fn fail_pending_requests(&self) {
        self.pending.lock().await.clear();
    }

    async fn enqueue_offline(&self, update: ProgressUpdate) {
        let result = self.queue.lock().await.enqueue(update);
        match result {
            Ok(entry) => {
                log::debug!(
                    "Queued progress for {} ({}) while offline",
                    entry.update.activity_id,
                    entry.id
                );
                self.events.emit(&SyncEvent::ProgressQueued(entry));
            }
            Err(e) => log::error!("Queued update could not be persisted: {e}"),
        }
    }

    /// Send every unsynced entry for the origin's child as one batch.
    async fn replay_offline_queue(&self, origin: Origin, outgoing: &mpsc::Sender<Vec<u8>>) {
        let pending = self.queue.lock().await.pending_for(&origin.child_id);
        if pending.is_empty() {
            return;
        }

        {
            let mut adopted = self.adopted_sessions.lock().await;
            for entry in &pending {
                if entry.update.device_id == origin.device_id
                    && entry.update.session_id != origin.session_id
                {
                    adopted.insert(entry.update.session_id.clone());
                }
            }
        }

        log::info!("Replaying {} queued progress updates", pending.len());
        match SyncMessage::offline_sync(origin, &pending).and_then(|m| m.encode()) {
            Ok(frame) => {
                if outgoing.send(frame).await.is_err() {
                    log::warn!("Connection closed during replay; updates stay queued");
                }
            }
            Err(e) => log::error!("Failed to encode offline replay: {e}"),
        }
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    async fn read_loop(&self, generation: u64, mut incoming: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = incoming.recv().await {
            match event {
                TransportEvent::Message(frame) => match SyncMessage::decode(&frame) {
                    Ok(msg) => {
                        let msg_type = msg.msg_type;
                        if let Err(e) = self.handle_message(msg).await {
                            log::warn!("Failed to handle {msg_type:?}: {e}");
                        }
                    }
                    Err(e) => log::warn!("Dropping undecodable frame: {e}"),
                },
                TransportEvent::Closed { unsent } => {
                    self.connection_lost(generation, unsent, None).await;
                    return;
                }
                // Keep reading: the transport still hands back unsent frames
                TransportEvent::Error(reason) => {
                    self.connection_lost(generation, Vec::new(), Some(reason)).await;
                }
            }
        }
        self.connection_lost(generation, Vec::new(), None).await;
    }

    async fn handle_message(&self, msg: SyncMessage) -> Result<(), ProtocolError> {
        {
            let session = self.session.lock().await;
            if session.child_id.as_deref() != Some(msg.origin.child_id.as_str()) {
                log::debug!("Ignoring {:?} for child {}", msg.msg_type, msg.origin.child_id);
                return Ok(());
            }
        }

        match msg.msg_type {
            MessageType::Joined => {
                let ack: JoinAck = msg.body()?;
                if let Some(waiter) = self.session.lock().await.join_waiter.take() {
                    let _ = waiter.send(Ok(ack));
                }
            }

            MessageType::ProgressUpdated | MessageType::ProgressBroadcast => {
                let update: ProgressUpdate = msg.body()?;
                if self.is_own_echo(&update).await {
                    log::trace!("Echo of own update for {} confirmed", update.activity_id);
                    self.store.write().await.confirm_local(&update);
                    return Ok(());
                }
                self.store.write().await.apply_remote(&update);
                self.events.emit(&SyncEvent::ProgressUpdated(update));
            }

            MessageType::ProgressResolved => {
                let update: ProgressUpdate = msg.body()?;
                log::debug!(
                    "Conflict on {} resolved to {} (from {})",
                    update.activity_id,
                    update.progress,
                    update.device_id
                );
                self.store.write().await.apply_remote(&update);
                self.events.emit(&SyncEvent::ProgressResolved(update));
            }

            MessageType::ProgressState => {
                let states: Vec<ProgressState> = msg.body()?;
                let merged = {
                    let mut store = self.store.write().await;
                    store.replace_all(states);
                    store.get_all()
                };
                log::debug!("Progress snapshot applied ({} activities)", merged.len());
                self.events.emit(&SyncEvent::ProgressStateUpdated(merged));
            }

            MessageType::OfflineSyncComplete => {
                let summary: OfflineSyncSummary = msg.body()?;
                {
                    let mut queue = self.queue.lock().await;
                    if let Err(e) = queue.mark_synced(&summary.synced_ids) {
                        log::error!("Failed to persist synced flags: {e}");
                    }
                    if let Err(e) = queue.clear_synced() {
                        log::error!("Failed to persist cleared queue: {e}");
                    }
                }
                log::info!(
                    "Offline sync complete: {} synced, {} applied, {} conflicts",
                    summary.synced_ids.len(),
                    summary.applied,
                    summary.conflicts
                );
                self.events.emit(&SyncEvent::OfflineSyncComplete(summary));
            }

            MessageType::BackupCreated => {
                let body: BackupCreated = msg.body()?;
                self.resolve_request(msg.request_id, BackupReply::Created(body.backup_id))
                    .await;
            }

            MessageType::BackupRestored => {
                let body: BackupRestored = msg.body()?;
                self.resolve_request(msg.request_id, BackupReply::Restored(body.success))
                    .await;
            }

            MessageType::BackupError => {
                let body: ErrorPayload = msg.body()?;
                log::warn!("Backup error from coordinator: {}", body.message);
                self.resolve_request(msg.request_id, BackupReply::Failed(body.message.clone()))
                    .await;
                self.events.emit(&SyncEvent::Error(body.message));
            }

            t if t.is_error() => {
                let body: ErrorPayload = msg.body()?;
                log::warn!("Coordinator reported {t:?}: {}", body.message);
                // While joining, an error is the coordinator refusing the join
                if let Some(waiter) = self.session.lock().await.join_waiter.take() {
                    let _ = waiter.send(Err(SyncError::ConnectionError(body.message.clone())));
                }
                self.events.emit(&SyncEvent::Error(body.message));
            }

            other => log::debug!("Unexpected message type from coordinator: {other:?}"),
        }
        Ok(())
    }

    async fn is_own_echo(&self, update: &ProgressUpdate) -> bool {
        if update.is_from(self.identity.device_id(), self.identity.session_id()) {
            return true;
        }
        update.device_id == self.identity.device_id()
            && self
                .adopted_sessions
                .lock()
                .await
                .contains(&update.session_id)
    }

    async fn resolve_request(&self, request_id: Option<Uuid>, reply: BackupReply) {
        let waiter = match request_id {
            Some(id) => self.pending.lock().await.remove(&id),
            None => None,
        };
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply);
            }
            None => log::debug!("Dropping uncorrelated backup reply: {reply:?}"),
        }
    }

    /// Handle the end of a connection of the given generation.
    ///
    /// May run twice for one connection (`Error`, then `Closed`). Unsent
    /// frames are requeued even when a newer connection took over.
    async fn connection_lost(&self, generation: u64, unsent: Vec<Vec<u8>>, reason: Option<String>) {
        let was_connected = {
            let mut session = self.session.lock().await;
            if session.generation == generation {
                if let Some(waiter) = session.join_waiter.take() {
                    let message = reason.clone().unwrap_or_else(|| "connection closed".into());
                    let _ = waiter.send(Err(SyncError::ConnectionError(message)));
                }
                // Detach rather than abort: this runs on the reader task itself
                drop(session.take_link());
                let was_connected = session.state == ConnectionState::Connected;
                session.state = ConnectionState::Disconnected;
                Some(was_connected)
            } else {
                None
            }
        };

        if self.requeue_unsent(unsent).await > 0 {
            if let Some((child_id, outgoing)) = self.active_link().await {
                self.replay_offline_queue(self.origin(&child_id), &outgoing)
                    .await;
            }
        }

        let Some(was_connected) = was_connected else {
            return;
        };
        self.fail_pending_requests().await;
        if let Some(reason) = &reason {
            log::warn!("Connection lost: {reason}");
        }
        if was_connected {
            self.events.emit(&SyncEvent::Disconnected);
        }
    }

    /// Move progress updates the transport never sent into the offline queue.
    async fn requeue_unsent(&self, unsent: Vec<Vec<u8>>) -> usize {
        let mut requeued = 0;
        for frame in unsent {
            let update = SyncMessage::decode(&frame)
                .and_then(|msg| msg.body_of::<ProgressUpdate>(MessageType::ProgressUpdate));
            if let Ok(update) = update {
                self.enqueue_offline(update).await;
                requeued += 1;
            }
        }
        if requeued > 0 {
            log::info!("Requeued {requeued} unsent progress updates");
        }
        requeued
    }
}

//! Typed publish/subscribe surface of a sync client.
//!
//! Listeners register per [`EventKind`] and receive the matching
//! [`SyncEvent`]. A listener that panics is logged and skipped; delivery to
//! the remaining listeners continues.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::model::{JoinAck, OfflineProgressUpdate, OfflineSyncSummary, ProgressState, ProgressUpdate};

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Room membership acknowledged by the coordinator
    Connected(JoinAck),
    /// Connection lost or closed
    Disconnected,
    /// Update from another device
    ProgressUpdated(ProgressUpdate),
    /// Conflict outcome decided by the coordinator
    ProgressResolved(ProgressUpdate),
    /// Full snapshot replaced the local state
    ProgressStateUpdated(Vec<ProgressState>),
    /// Update stored in the offline queue instead of being sent
    ProgressQueued(OfflineProgressUpdate),
    /// Coordinator finished draining a reconnect's queued updates
    OfflineSyncComplete(OfflineSyncSummary),
    /// Error signal from the coordinator or the transport
    Error(String),
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connected(_) => EventKind::Connected,
            Self::Disconnected => EventKind::Disconnected,
            Self::ProgressUpdated(_) => EventKind::ProgressUpdated,
            Self::ProgressResolved(_) => EventKind::ProgressResolved,
            Self::ProgressStateUpdated(_) => EventKind::ProgressStateUpdated,
            Self::ProgressQueued(_) => EventKind::ProgressQueued,
            Self::OfflineSyncComplete(_) => EventKind::OfflineSyncComplete,
            Self::Error(_) => EventKind::Error,
        }
    }
}

/// Subscription key for [`SyncEvent`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Disconnected,
    ProgressUpdated,
    ProgressResolved,
    ProgressStateUpdated,
    ProgressQueued,
    OfflineSyncComplete,
    Error,
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Listener registry local to one client instance.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one kind of event.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.entry(kind).or_default().push((id, Arc::new(handler)));
        }
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let Ok(mut listeners) = self.listeners.write() else {
            return false;
        };
        match listeners.get_mut(&kind) {
            Some(handlers) => {
                let before = handlers.len();
                handlers.retain(|(existing, _)| *existing != id);
                handlers.len() != before
            }
            None => false,
        }
    }

    /// Deliver an event to every listener of its kind.
    ///
    /// Handlers run outside the registry lock, so a handler may register or
    /// remove listeners.
    pub fn emit(&self, event: &SyncEvent) {
        let handlers: Vec<Handler> = match self.listeners.read() {
            Ok(listeners) => listeners
                .get(&event.kind())
                .map(|hs| hs.iter().map(|(_, h)| h.clone()).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                log::error!("Listener for {:?} panicked; continuing delivery", event.kind());
            }
        }
    }

    /// Drop every listener.
    pub fn clear(&self) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.clear();
        }
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .map(|l| l.get(&kind).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    fn sample_update() -> ProgressUpdate {
        ProgressUpdate {
            child_id: "c1".into(),
            activity_id: "act-1".into(),
            progress: 30.0,
            timestamp: Utc::now(),
            device_id: "d".into(),
            session_id: "s".into(),
            metadata: None,
        }
    }

    #[test]
    fn test_emit_reaches_matching_listeners_only() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = seen.clone();
        bus.on(EventKind::Disconnected, move |e| s.lock().unwrap().push(e.kind()));
        let s = seen.clone();
        bus.on(EventKind::Error, move |e| s.lock().unwrap().push(e.kind()));

        bus.emit(&SyncEvent::Disconnected);
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::Disconnected]);
    }

    #[test]
    fn test_panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let received = Arc::new(Mutex::new(None));

        bus.on(EventKind::ProgressUpdated, |_| panic!("listener failure"));
        let r = received.clone();
        bus.on(EventKind::ProgressUpdated, move |e| {
            *r.lock().unwrap() = Some(e.clone());
        });

        let update = sample_update();
        bus.emit(&SyncEvent::ProgressUpdated(update.clone()));

        assert_eq!(
            *received.lock().unwrap(),
            Some(SyncEvent::ProgressUpdated(update))
        );
    }

    #[test]
    fn test_release_profile_unwinds_listener_panics() {
        // Listener isolation relies on catch_unwind, which abort-on-panic disables
        let manifest = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/../Cargo.toml"));
        let panic_settings: Vec<&str> = manifest
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("panic"))
            .collect();
        assert!(
            panic_settings.iter().all(|line| !line.contains("abort")),
            "workspace profile sets {panic_settings:?}"
        );
    }

    #[test]
    fn test_off_removes_listener() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let id = bus.on(EventKind::Disconnected, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&SyncEvent::Disconnected);
        assert!(bus.off(EventKind::Disconnected, id));
        assert!(!bus.off(EventKind::Disconnected, id));
        bus.emit(&SyncEvent::Disconnected);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.listener_count(EventKind::Disconnected), 0);
    }

    #[test]
    fn test_clear() {
        let bus = EventBus::new();
        bus.on(EventKind::Error, |_| {});
        bus.on(EventKind::Connected, |_| {});
        bus.clear();
        assert_eq!(bus.listener_count(EventKind::Error), 0);
        assert_eq!(bus.listener_count(EventKind::Connected), 0);
    }

    #[test]
    fn test_event_kinds() {
        assert_eq!(SyncEvent::Error("x".into()).kind(), EventKind::Error);
        assert_eq!(
            SyncEvent::ProgressStateUpdated(Vec::new()).kind(),
            EventKind::ProgressStateUpdated
        );
        assert_eq!(
            SyncEvent::OfflineSyncComplete(OfflineSyncSummary::default()).kind(),
            EventKind::OfflineSyncComplete
        );
    }
}

//! Fan-out of coordinator frames to the devices in a child's room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers.
//! Each device gets an independent receiver that buffers up to `capacity`
//! frames; a device that falls further behind loses the oldest ones.
//!
//! Frames can exclude one session so an update is not echoed to the device
//! that issued it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{ProtocolError, SyncMessage};

/// A device session present in a room.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub session_id: String,
    pub joined_at: DateTime<Utc>,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            session_id: session_id.into(),
            joined_at: Utc::now(),
        }
    }
}

/// An encoded frame plus the session it must not be delivered to.
#[derive(Debug, Clone)]
pub struct RoomFrame {
    pub exclude_session: Option<String>,
    pub bytes: Arc<Vec<u8>>,
}

impl RoomFrame {
    /// Whether a device session should receive this frame.
    pub fn is_for(&self, session_id: &str) -> bool {
        self.exclude_session.as_deref() != Some(session_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub active_devices: usize,
}

/// Broadcast group for a single child room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomFrame>,
    /// Devices in the room, keyed by session id
    devices: RwLock<HashMap<String, DeviceInfo>>,
    capacity: usize,
    messages_sent: AtomicU64,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            devices: RwLock::new(HashMap::new()),
            capacity,
            messages_sent: AtomicU64::new(0),
        }
    }

    /// Add a device session and return its receiver.
    ///
    /// Re-adding a session replaces its entry.
    pub async fn add_device(&self, info: DeviceInfo) -> broadcast::Receiver<RoomFrame> {
        self.devices
            .write()
            .await
            .insert(info.session_id.clone(), info);
        self.sender.subscribe()
    }

    pub async fn remove_device(&self, session_id: &str) -> Option<DeviceInfo> {
        self.devices.write().await.remove(session_id)
    }

    /// Encode and send a message to every device except `exclude_session`.
    ///
    /// Returns the number of receivers the frame was handed to (the excluded
    /// one included; filtering happens on the receiving side).
    pub fn broadcast(
        &self,
        msg: &SyncMessage,
        exclude_session: Option<&str>,
    ) -> Result<usize, ProtocolError> {
        let frame = RoomFrame {
            exclude_session: exclude_session.map(str::to_string),
            bytes: Arc::new(msg.encode()?),
        };
        Ok(self.broadcast_frame(frame))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_frame(&self, frame: RoomFrame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.read().await.values().cloned().collect()
    }

    pub async fn has_device(&self, session_id: &str) -> bool {
        self.devices.read().await.contains_key(session_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            active_devices: self.devices.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

//! Progress records exchanged between devices and the coordinator.
//!
//! A `ProgressUpdate` is one causal event ("child X reached 60% on activity Y
//! at time T from device D"). A `ProgressState` is the folded result of those
//! events for one (child, activity) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form session data attached to progress (interaction counters etc.).
pub type SessionData = Map<String, Value>;

/// One progress change for a (child, activity) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub child_id: String,
    pub activity_id: String,
    /// Completion value, nominally 0-100.
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ProgressUpdate {
    /// Whether this update originated from the given device session.
    pub fn is_from(&self, device_id: &str, session_id: &str) -> bool {
        self.device_id == device_id && self.session_id == session_id
    }
}

/// A progress update that could not be delivered and waits in the offline queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineProgressUpdate {
    pub id: String,
    /// Per-device enqueue sequence, strictly increasing across restarts.
    /// Zero marks an entry written before sequencing existed.
    #[serde(default)]
    pub seq: u64,
    #[serde(flatten)]
    pub update: ProgressUpdate,
    pub synced: bool,
}

/// Denormalized display fields of an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityInfo {
    pub id: String,
    pub title: String,
    pub plan_id: Option<String>,
}

/// Latest accepted progress for one activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressState {
    pub activity_id: String,
    pub progress: f64,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub session_data: SessionData,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<ActivityInfo>,
}

impl ProgressState {
    /// Build the first state for an activity from an update.
    pub fn from_update(update: &ProgressUpdate) -> Self {
        let mut state = Self {
            activity_id: update.activity_id.clone(),
            progress: update.progress,
            last_accessed: update.timestamp,
            session_data: SessionData::new(),
            activity: None,
        };
        merge_session_data(&mut state.session_data, update.metadata.as_ref());
        state
    }

    /// Overwrite progress and access time, merging metadata into session data.
    pub fn apply_update(&mut self, update: &ProgressUpdate) {
        self.progress = update.progress;
        self.last_accessed = update.timestamp;
        merge_session_data(&mut self.session_data, update.metadata.as_ref());
    }
}

/// Merge metadata into existing session data key by key.
///
/// Object metadata overwrites matching keys and keeps the rest. Any other
/// JSON value is stored under `"value"`.
pub fn merge_session_data(target: &mut SessionData, metadata: Option<&Value>) {
    match metadata {
        Some(Value::Object(fields)) => {
            for (key, value) in fields {
                target.insert(key.clone(), value.clone());
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            target.insert("value".to_string(), other.clone());
        }
    }
}

/// Acknowledgement of room membership sent by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub child_id: String,
    pub device_id: String,
    pub session_id: String,
    /// Devices currently in the room, including the joining one.
    pub connected_devices: usize,
}

/// Summary sent once the coordinator drained a reconnect's queued updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSyncSummary {
    pub synced_ids: Vec<String>,
    /// Updates accepted by the resolver.
    pub applied: usize,
    /// Updates that lost to a newer value.
    pub conflicts: usize,
}

/// Body of a `backup-created` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupCreated {
    pub backup_id: String,
}

/// Body of a `backup-restored` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRestored {
    pub backup_id: String,
    pub success: bool,
}

/// Body of a `restore-backup` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreRequest {
    pub backup_id: String,
}

/// Body of any coordinator error signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

//! Wire protocol between devices and the coordinator.
//!
//! Envelope (bincode-encoded):
//! ```text
//! ┌──────────┬──────────┬───────────┬────────────┬────────────┬──────────┐
//! │ msg_type │ child_id │ device_id │ session_id │ request_id │ payload  │
//! │ 1 byte   │ string   │ string    │ string     │ opt 16 B   │ JSON     │
//! └──────────┴──────────┴───────────┴────────────┴────────────┴──────────┘
//! ```
//!
//! The envelope identifies the room (`child_id`) and the origin device of the
//! message, which is what the coordinator uses to avoid echoing a device's own
//! updates back to it. The payload is the JSON body for the message type;
//! progress metadata is free-form JSON so the body stays self-describing.
//! `request_id` correlates backup/restore requests with their replies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    BackupCreated, BackupRestored, ErrorPayload, JoinAck, OfflineProgressUpdate,
    OfflineSyncSummary, ProgressState, ProgressUpdate, RestoreRequest,
};

/// Message types for the progress sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    // device -> coordinator
    JoinRoom = 1,
    ProgressUpdate = 2,
    RequestSync = 3,
    CreateBackup = 4,
    RestoreBackup = 5,
    /// Batch replay of the offline queue after reconnecting
    OfflineSync = 6,

    // coordinator -> device
    Joined = 10,
    /// Update from a peer device
    ProgressUpdated = 11,
    /// Conflict outcome
    ProgressResolved = 12,
    /// General fan-out
    ProgressBroadcast = 13,
    /// Full snapshot of a child's progress
    ProgressState = 14,
    OfflineSyncComplete = 15,
    BackupCreated = 16,
    BackupRestored = 17,
    BackupError = 18,
    Error = 19,
    ProgressError = 20,
    SyncError = 21,
}

impl MessageType {
    /// Whether this message type is one of the coordinator's error signals.
    pub fn is_error(self) -> bool {
        matches!(self, Self::Error | Self::ProgressError | Self::SyncError)
    }
}

/// Room and device a message belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub child_id: String,
    pub device_id: String,
    pub session_id: String,
}

impl Origin {
    pub fn new(
        child_id: impl Into<String>,
        device_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            child_id: child_id.into(),
            device_id: device_id.into(),
            session_id: session_id.into(),
        }
    }

    /// Origin for messages produced by the coordinator itself.
    pub fn coordinator(child_id: impl Into<String>) -> Self {
        Self::new(child_id, "", "")
    }

    /// Origin of the device that issued an update.
    pub fn of_update(update: &ProgressUpdate) -> Self {
        Self::new(&update.child_id, &update.device_id, &update.session_id)
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub origin: Origin,
    pub request_id: Option<Uuid>,
    /// JSON body (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    /// Build a message with a JSON body.
    pub fn new<T: Serialize + ?Sized>(
        msg_type: MessageType,
        origin: Origin,
        body: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(body)
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            origin,
            request_id: None,
            payload,
        })
    }

    /// Build a message without a body.
    pub fn empty(msg_type: MessageType, origin: Origin) -> Self {
        Self {
            msg_type,
            origin,
            request_id: None,
            payload: Vec::new(),
        }
    }

    /// Attach a correlation id.
    pub fn with_request_id(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    // ─── device -> coordinator ────────────────────────────────────────

    pub fn join_room(origin: Origin) -> Self {
        Self::empty(MessageType::JoinRoom, origin)
    }

    pub fn progress_update(update: &ProgressUpdate) -> Result<Self, ProtocolError> {
        Self::new(MessageType::ProgressUpdate, Origin::of_update(update), update)
    }

    pub fn request_sync(origin: Origin) -> Self {
        Self::empty(MessageType::RequestSync, origin)
    }

    pub fn create_backup(origin: Origin, request_id: Uuid) -> Self {
        Self::empty(MessageType::CreateBackup, origin).with_request_id(request_id)
    }

    pub fn restore_backup(
        origin: Origin,
        request_id: Uuid,
        backup_id: &str,
    ) -> Result<Self, ProtocolError> {
        let body = RestoreRequest {
            backup_id: backup_id.to_string(),
        };
        Ok(Self::new(MessageType::RestoreBackup, origin, &body)?.with_request_id(request_id))
    }

    pub fn offline_sync(
        origin: Origin,
        updates: &[OfflineProgressUpdate],
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::OfflineSync, origin, updates)
    }

    // ─── coordinator -> device ────────────────────────────────────────

    pub fn joined(ack: &JoinAck) -> Result<Self, ProtocolError> {
        let origin = Origin::new(&ack.child_id, &ack.device_id, &ack.session_id);
        Self::new(MessageType::Joined, origin, ack)
    }

    /// Forward an accepted update; the origin stays the issuing device.
    pub fn progress_updated(update: &ProgressUpdate) -> Result<Self, ProtocolError> {
        Self::new(MessageType::ProgressUpdated, Origin::of_update(update), update)
    }

    pub fn progress_resolved(update: &ProgressUpdate) -> Result<Self, ProtocolError> {
        Self::new(MessageType::ProgressResolved, Origin::of_update(update), update)
    }

    pub fn progress_broadcast(update: &ProgressUpdate) -> Result<Self, ProtocolError> {
        Self::new(MessageType::ProgressBroadcast, Origin::of_update(update), update)
    }

    pub fn progress_state(
        origin: Origin,
        states: &[ProgressState],
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::ProgressState, origin, states)
    }

    pub fn offline_sync_complete(
        origin: Origin,
        summary: &OfflineSyncSummary,
    ) -> Result<Self, ProtocolError> {
        Self::new(MessageType::OfflineSyncComplete, origin, summary)
    }

    pub fn backup_created(
        origin: Origin,
        request_id: Option<Uuid>,
        backup_id: &str,
    ) -> Result<Self, ProtocolError> {
        let body = BackupCreated {
            backup_id: backup_id.to_string(),
        };
        let mut msg = Self::new(MessageType::BackupCreated, origin, &body)?;
        msg.request_id = request_id;
        Ok(msg)
    }

    pub fn backup_restored(
        origin: Origin,
        request_id: Option<Uuid>,
        backup_id: &str,
        success: bool,
    ) -> Result<Self, ProtocolError> {
        let body = BackupRestored {
            backup_id: backup_id.to_string(),
            success,
        };
        let mut msg = Self::new(MessageType::BackupRestored, origin, &body)?;
        msg.request_id = request_id;
        Ok(msg)
    }

    /// Error signal (`Error`, `ProgressError`, `SyncError` or `BackupError`).
    pub fn error(
        msg_type: MessageType,
        origin: Origin,
        request_id: Option<Uuid>,
        message: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        let body = ErrorPayload {
            message: message.into(),
        };
        let mut msg = Self::new(msg_type, origin, &body)?;
        msg.request_id = request_id;
        Ok(msg)
    }

    // ─── codec ────────────────────────────────────────────────────────

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the JSON body.
    pub fn body<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }

    /// Parse the body of a message that must be of `expected` type.
    pub fn body_of<T: DeserializeOwned>(&self, expected: MessageType) -> Result<T, ProtocolError> {
        if self.msg_type != expected {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        self.body()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Connection closed")]
    ConnectionClosed,
}

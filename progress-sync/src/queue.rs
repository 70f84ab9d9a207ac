//! Durable offline queue for progress updates that could not be delivered.
//!
//! Every update issued while disconnected becomes one entry. Entries are
//! never coalesced: two updates to the same activity are two causal events
//! and both must reach the coordinator's resolver. Replay happens in enqueue
//! order; entries are only dropped after the coordinator has confirmed them
//! (`mark_synced` followed by `clear_synced`).
//!
//! The whole queue is rewritten to local storage after every mutation.
//!
//! Each entry carries a per-device sequence number. The counter is stored
//! separately from the entries, so it keeps increasing after the queue has
//! been drained and the process restarted; the coordinator relies on that to
//! drop replays it has already applied.

use std::sync::Arc;

use crate::identity::generate_id;
use crate::model::{OfflineProgressUpdate, ProgressUpdate};
use crate::storage::{LocalStorage, StorageError, OFFLINE_QUEUE_KEY, OFFLINE_SEQ_KEY};

/// Ordered, persisted buffer of undelivered updates for one device.
pub struct OfflineQueue {
    entries: Vec<OfflineProgressUpdate>,
    /// Last sequence number handed out
    last_seq: u64,
    storage: Arc<dyn LocalStorage>,
}

impl OfflineQueue {
    /// Load the persisted queue.
    ///
    /// Missing, unreadable or corrupted data yields an empty queue.
    pub fn load(storage: Arc<dyn LocalStorage>) -> Self {
        let entries = match storage.get_item(OFFLINE_QUEUE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<OfflineProgressUpdate>>(&raw) {
                Ok(entries) => {
                    if !entries.is_empty() {
                        log::info!("Loaded {} queued progress updates", entries.len());
                    }
                    entries
                }
                Err(e) => {
                    log::warn!("Discarding corrupted offline queue: {e}");
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("Failed to read offline queue, starting empty: {e}");
                Vec::new()
            }
        };

        let stored_seq = match storage.get_item(OFFLINE_SEQ_KEY) {
            Ok(Some(raw)) => raw.trim().parse::<u64>().unwrap_or_else(|e| {
                log::warn!("Ignoring unreadable offline sequence {raw:?}: {e}");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                log::warn!("Failed to read offline sequence: {e}");
                0
            }
        };
        let last_seq = entries.iter().map(|e| e.seq).fold(stored_seq, u64::max);

        Self {
            entries,
            last_seq,
            storage,
        }
    }

    /// Append an update and persist the queue.
    ///
    /// The entry is kept in memory even if persisting fails; the error is
    /// returned so the caller can surface it.
    pub fn enqueue(&mut self, update: ProgressUpdate) -> Result<OfflineProgressUpdate, StorageError> {
        self.last_seq += 1;
        let entry = OfflineProgressUpdate {
            id: generate_id("offline"),
            seq: self.last_seq,
            update,
            synced: false,
        };
        self.entries.push(entry.clone());
        // Counter first: a crash in between must not hand out a sequence twice
        self.storage
            .set_item(OFFLINE_SEQ_KEY, &self.last_seq.to_string())?;
        self.persist()?;
        Ok(entry)
    }

    /// Unsynced entries in enqueue order.
    pub fn pending(&self) -> Vec<OfflineProgressUpdate> {
        self.entries.iter().filter(|e| !e.synced).cloned().collect()
    }

    /// Unsynced entries for one child in enqueue order.
    pub fn pending_for(&self, child_id: &str) -> Vec<OfflineProgressUpdate> {
        self.entries
            .iter()
            .filter(|e| !e.synced && e.update.child_id == child_id)
            .cloned()
            .collect()
    }

    /// Whether any unsynced entry belongs to this child.
    pub fn has_pending_for(&self, child_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| !e.synced && e.update.child_id == child_id)
    }

    /// Last sequence number handed out.
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    /// Number of entries not yet acknowledged by the coordinator.
    pub fn size_unsynced(&self) -> usize {
        self.entries.iter().filter(|e| !e.synced).count()
    }

    /// Flag the given entries as acknowledged. Returns how many changed.
    pub fn mark_synced<S: AsRef<str>>(&mut self, ids: &[S]) -> Result<usize, StorageError> {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|e| !e.synced) {
            if ids.iter().any(|id| id.as_ref() == entry.id) {
                entry.synced = true;
                changed += 1;
            }
        }
        if changed > 0 {
            self.persist()?;
        }
        Ok(changed)
    }

    /// Drop every acknowledged entry. Returns how many were removed.
    pub fn clear_synced(&mut self) -> Result<usize, StorageError> {
        let before = self.entries.len();
        self.entries.retain(|e| !e.synced);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    /// All entries, synced or not, in enqueue order.
    pub fn entries(&self) -> &[OfflineProgressUpdate] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn persist(&self) -> Result<(), StorageError> {
        let raw = serde_json::to_string(&self.entries)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.storage.set_item(OFFLINE_QUEUE_KEY, &raw)
    }
}

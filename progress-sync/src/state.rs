//! In-memory view of a child's progress, one entry per activity.
//!
//! The store renders whatever the coordinator says is current: every inbound
//! event overwrites progress and access time and merges session data. It does
//! not adjudicate conflicts between devices; the coordinator does that and
//! sends the outcome back as a `progress-resolved` event, applied like any
//! other update.
//!
//! The one exception is a full snapshot arriving after a local optimistic
//! write the coordinator has not echoed yet. If that write is newer than the
//! snapshot's entry for the activity, the snapshot must not roll it back.
//! The coordinator's echo of the write (see [`ProgressStateStore::confirm_local`])
//! ends that protection.

use std::collections::BTreeMap;

use crate::model::{ProgressState, ProgressUpdate};

#[derive(Debug, Clone)]
struct TrackedProgress {
    state: ProgressState,
    /// Set by an optimistic local write, cleared by any inbound event.
    pending_local: bool,
}

/// Latest known progress per activity for the active child.
#[derive(Debug, Default)]
pub struct ProgressStateStore {
    entries: BTreeMap<String, TrackedProgress>,
}

impl ProgressStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of an activity (a copy, not a live handle).
    pub fn get(&self, activity_id: &str) -> Option<ProgressState> {
        self.entries.get(activity_id).map(|t| t.state.clone())
    }

    /// Every tracked activity, ordered by activity id.
    pub fn get_all(&self) -> Vec<ProgressState> {
        self.entries.values().map(|t| t.state.clone()).collect()
    }

    /// Apply an update issued on this device before the coordinator saw it.
    pub fn apply_local(&mut self, update: &ProgressUpdate) -> ProgressState {
        self.apply(update, true)
    }

    /// Apply an update delivered by the coordinator.
    pub fn apply_remote(&mut self, update: &ProgressUpdate) -> ProgressState {
        self.apply(update, false)
    }

    fn apply(&mut self, update: &ProgressUpdate, pending_local: bool) -> ProgressState {
        let tracked = self
            .entries
            .entry(update.activity_id.clone())
            .and_modify(|t| t.state.apply_update(update))
            .or_insert_with(|| TrackedProgress {
                state: ProgressState::from_update(update),
                pending_local,
            });
        tracked.pending_local = pending_local;
        tracked.state.clone()
    }

    /// Mark a local write as seen by the coordinator once its echo arrives.
    ///
    /// A newer local write to the same activity stays pending.
    pub fn confirm_local(&mut self, update: &ProgressUpdate) -> bool {
        match self.entries.get_mut(&update.activity_id) {
            Some(tracked)
                if tracked.pending_local && tracked.state.last_accessed <= update.timestamp =>
            {
                tracked.pending_local = false;
                true
            }
            _ => false,
        }
    }

    /// Replace the whole store with a snapshot.
    ///
    /// The resulting key set is the snapshot's, plus activities whose only
    /// entry is an unconfirmed local write. For an activity with an
    /// unconfirmed local write newer than the snapshot entry, the local
    /// progress and access time win; session data from both is merged.
    pub fn replace_all(&mut self, snapshot: Vec<ProgressState>) {
        let mut previous = std::mem::take(&mut self.entries);

        for mut incoming in snapshot {
            let mut pending_local = false;
            if let Some(local) = previous.remove(&incoming.activity_id) {
                if local.pending_local && local.state.last_accessed > incoming.last_accessed {
                    log::debug!(
                        "Keeping fresher local progress for {} over snapshot",
                        incoming.activity_id
                    );
                    incoming.progress = local.state.progress;
                    incoming.last_accessed = local.state.last_accessed;
                    for (key, value) in local.state.session_data {
                        incoming.session_data.insert(key, value);
                    }
                    pending_local = true;
                }
            }
            self.entries.insert(
                incoming.activity_id.clone(),
                TrackedProgress {
                    state: incoming,
                    pending_local,
                },
            );
        }

        // The coordinator has not seen these yet
        for (activity_id, tracked) in previous {
            if tracked.pending_local {
                self.entries.insert(activity_id, tracked);
            }
        }
    }

    /// Whether an activity has a local write the coordinator has not echoed.
    pub fn is_pending_local(&self, activity_id: &str) -> bool {
        self.entries
            .get(activity_id)
            .map(|t| t.pending_local)
            .unwrap_or(false)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

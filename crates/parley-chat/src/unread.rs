//! Unread counting over delivered snapshots.
//!
//! The read marker is local to the observer and never persisted, so counts
//! reset on restart and are not shared between a user's devices.

use std::sync::Arc;

use uuid::Uuid;

use parley_types::models::Message;

use crate::sync::MessageSnapshot;

/// Messages by someone other than `self_id` strictly after `last_read_id`.
///
/// If the marker is unset or no longer in the snapshot (it fell out of the
/// live window), every message not authored by `self_id` counts.
pub fn compute(messages: &[Message], last_read_id: Option<Uuid>, self_id: Uuid) -> usize {
    let start = last_read_id
        .and_then(|marker| messages.iter().position(|m| m.id == marker))
        .map_or(0, |idx| idx + 1);

    messages[start..]
        .iter()
        .filter(|m| m.author_id != self_id)
        .count()
}

/// Marker for "everything currently shown has been read".
pub fn mark_read(messages: &[Message]) -> Option<Uuid> {
    messages.last().map(|m| m.id)
}

/// Per-observer local state: last delivered snapshot, read marker and the
/// unread count derived from both.
#[derive(Debug, Clone)]
pub struct ChatSubscriptionState {
    self_id: Uuid,
    snapshot: Option<Arc<MessageSnapshot>>,
    last_read_id: Option<Uuid>,
    unread: usize,
}

impl ChatSubscriptionState {
    pub fn new(self_id: Uuid) -> Self {
        Self {
            self_id,
            snapshot: None,
            last_read_id: None,
            unread: 0,
        }
    }

    /// Replace the snapshot and recompute the unread count from scratch.
    pub fn apply(&mut self, snapshot: Arc<MessageSnapshot>) -> usize {
        self.unread = compute(&snapshot.messages, self.last_read_id, self.self_id);
        self.snapshot = Some(snapshot);
        self.unread
    }

    /// Move the marker to the newest message of the current snapshot.
    /// Keeps the previous marker when nothing has been delivered yet.
    pub fn mark_read(&mut self) -> Option<Uuid> {
        if let Some(snapshot) = &self.snapshot {
            if let Some(marker) = mark_read(&snapshot.messages) {
                self.last_read_id = Some(marker);
            }
            self.unread = compute(&snapshot.messages, self.last_read_id, self.self_id);
        }
        self.last_read_id
    }

    pub fn snapshot(&self) -> Option<&Arc<MessageSnapshot>> {
        self.snapshot.as_ref()
    }

    pub fn last_read_id(&self) -> Option<Uuid> {
        self.last_read_id
    }

    pub fn unread(&self) -> usize {
        self.unread
    }
}

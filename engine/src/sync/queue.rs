//! Bounded queue of mutations waiting to reach the server.

use crate::storage::KeyValueBackend;
use crate::{Clock, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

/// Kind of mutation a sync item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

/// One pending mutation. This is also the POST body sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncItem {
    /// Entity type, e.g. `"trace"`
    #[serde(rename = "type")]
    pub kind: String,
    pub action: SyncAction,
    pub id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Enqueue stamp; unique within a queue and used as the item's identity
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl SyncItem {
    /// A create mutation. The timestamp is assigned on enqueue.
    pub fn create(kind: impl Into<String>, id: impl Into<RecordId>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            action: SyncAction::Create,
            id: id.into(),
            data: Some(data),
            timestamp: 0,
        }
    }

    /// A delete mutation. The timestamp is assigned on enqueue.
    pub fn delete(kind: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            kind: kind.into(),
            action: SyncAction::Delete,
            id: id.into(),
            data: None,
            timestamp: 0,
        }
    }

    /// Whether acknowledging this item should flag a trace record as synced.
    pub fn is_trace_create(&self) -> bool {
        self.kind == "trace" && self.action == SyncAction::Create
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<SyncItem>,
    last_stamp: Timestamp,
}

/// FIFO of [`SyncItem`]s capped at `max_size`.
///
/// When full, the oldest item is dropped to make room. Every mutation is
/// written to all mirrors before the call returns.
pub struct SyncQueue {
    state: Mutex<QueueState>,
    max_size: usize,
    storage_key: String,
    mirrors: Vec<Arc<dyn KeyValueBackend>>,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    /// Restore the queue from the first mirror holding a readable copy.
    pub fn load(
        max_size: usize,
        storage_key: impl Into<String>,
        mirrors: Vec<Arc<dyn KeyValueBackend>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage_key = storage_key.into();
        let max_size = max_size.max(1);

        let mut items = VecDeque::new();
        for (index, mirror) in mirrors.iter().enumerate() {
            match mirror.get_item(&storage_key) {
                Ok(Some(raw)) => match serde_json::from_str::<Vec<SyncItem>>(&raw) {
                    Ok(stored) => {
                        items = stored.into();
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(mirror = index, error = %e, "discarding unreadable sync queue copy");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(mirror = index, error = %e, "failed to read sync queue mirror");
                }
            }
        }

        while items.len() > max_size {
            items.pop_front();
        }
        let last_stamp = items.iter().map(|i| i.timestamp).max().unwrap_or(0);

        if !items.is_empty() {
            tracing::info!(pending = items.len(), "restored sync queue");
        }

        Self {
            state: Mutex::new(QueueState { items, last_stamp }),
            max_size,
            storage_key,
            mirrors,
            clock,
        }
    }

    /// Append an item, evicting the oldest if the queue is full.
    ///
    /// Returns the item as stored, with its timestamp assigned.
    pub fn enqueue(&self, mut item: SyncItem) -> SyncItem {
        let mut state = self.lock();

        if state.items.len() >= self.max_size {
            if let Some(dropped) = state.items.pop_front() {
                tracing::warn!(
                    id = %dropped.id,
                    action = ?dropped.action,
                    "sync queue full, dropping oldest item"
                );
            }
        }

        // Stamps must stay unique even when two items land in the same millisecond.
        let stamp = self.clock.now_millis().max(state.last_stamp + 1);
        state.last_stamp = stamp;
        item.timestamp = stamp;

        state.items.push_back(item.clone());
        self.persist(&state.items);

        tracing::debug!(id = %item.id, action = ?item.action, pending = state.items.len(), "enqueued sync item");
        item
    }

    /// Remove the item with exactly this timestamp.
    pub fn remove(&self, timestamp: Timestamp) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.items.iter().position(|i| i.timestamp == timestamp) else {
            return false;
        };
        state.items.remove(pos);
        self.persist(&state.items);
        true
    }

    /// Copy of the pending items, oldest first.
    pub fn snapshot(&self) -> Vec<SyncItem> {
        self.lock().items.iter().cloned().collect()
    }

    /// Whether a create for this record is still waiting to be delivered.
    pub fn has_pending_create(&self, kind: &str, id: &str) -> bool {
        self.lock()
            .items
            .iter()
            .any(|i| i.action == SyncAction::Create && i.kind == kind && i.id == id)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Drop every pending item.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.items.clear();
        self.persist(&state.items);
    }

    fn persist(&self, items: &VecDeque<SyncItem>) {
        let raw = match serde_json::to_string(items) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize sync queue");
                return;
            }
        };

        let mut written = 0;
        for (index, mirror) in self.mirrors.iter().enumerate() {
            match mirror.set_item(&self.storage_key, &raw) {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!(mirror = index, error = %e, "failed to mirror sync queue"),
            }
        }
        if written == 0 && !self.mirrors.is_empty() {
            tracing::error!(pending = items.len(), "sync queue could not be persisted to any mirror");
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("pending", &self.len())
            .field("max_size", &self.max_size)
            .field("storage_key", &self.storage_key)
            .field("mirrors", &self.mirrors.len())
            .finish()
    }
}

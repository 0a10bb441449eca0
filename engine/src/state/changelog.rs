//! Bounded log of state mutations.

use crate::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

/// What kind of mutation an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeKind {
    Set,
    Remove,
    Clear,
    Restore { merge: bool },
}

/// One recorded mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Key as given by the caller; empty for whole-tree mutations
    pub key: String,
    pub path: Vec<String>,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: ChangeKind,
    /// Value before the mutation (`null` when absent)
    pub previous: Value,
    /// Value after the mutation (`null` when removed)
    pub current: Value,
}

/// Ring buffer keeping the newest `capacity` entries.
#[derive(Debug, Clone)]
pub struct ChangeLog {
    entries: VecDeque<ChangeEntry>,
    capacity: usize,
}

impl ChangeLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Append an entry, dropping the oldest when full. A zero capacity
    /// keeps nothing.
    pub fn push(&mut self, entry: ChangeEntry) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.entries.len() > capacity {
            self.entries.pop_front();
        }
    }

    pub fn entries(&self) -> Vec<ChangeEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

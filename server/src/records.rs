//! In-memory record store for received sync items.
//!
//! Keyed by `(type, id)`. Deletes leave a tombstone so a delayed create that
//! is older than the delete cannot bring the record back.

use dashmap::DashMap;
use serde::Serialize;
use trace_offline::{SyncAction, Timestamp};

/// A record as last written by a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub data: serde_json::Value,
    /// Client-side queue timestamp of the item that wrote this state
    pub timestamp: Timestamp,
    #[serde(skip)]
    pub deleted: bool,
}

/// What happened to an incoming item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// An item with a newer timestamp already reached this record
    Stale,
}

#[derive(Debug, Default)]
pub struct RecordStore {
    records: DashMap<(String, String), StoredRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one sync item. Create and update upsert; delete tombstones.
    pub fn apply(
        &self,
        kind: &str,
        id: &str,
        action: SyncAction,
        data: Option<serde_json::Value>,
        timestamp: Timestamp,
    ) -> ApplyOutcome {
        let key = (kind.to_string(), id.to_string());
        let mut entry = self.records.entry(key).or_insert_with(|| StoredRecord {
            kind: kind.to_string(),
            id: id.to_string(),
            data: serde_json::Value::Null,
            timestamp: 0,
            deleted: true,
        });

        if entry.timestamp > timestamp {
            return ApplyOutcome::Stale;
        }

        entry.timestamp = timestamp;
        match action {
            SyncAction::Create | SyncAction::Update => {
                entry.data = data.unwrap_or(serde_json::Value::Null);
                entry.deleted = false;
            }
            SyncAction::Delete => {
                entry.data = serde_json::Value::Null;
                entry.deleted = true;
            }
        }
        ApplyOutcome::Applied
    }

    pub fn get(&self, kind: &str, id: &str) -> Option<StoredRecord> {
        self.records
            .get(&(kind.to_string(), id.to_string()))
            .filter(|r| !r.deleted)
            .map(|r| r.clone())
    }

    /// Live records, optionally of one type, ordered by type then id.
    pub fn list(&self, kind: Option<&str>) -> Vec<StoredRecord> {
        let mut records: Vec<StoredRecord> = self
            .records
            .iter()
            .filter(|r| !r.deleted && kind.is_none_or(|k| r.kind == k))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| (&a.kind, &a.id).cmp(&(&b.kind, &b.id)));
        records
    }

    pub fn len(&self) -> usize {
        self.records.iter().filter(|r| !r.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

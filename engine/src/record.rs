//! Record types for trace data, drafts and the collections that hold them.

use crate::{error::Result, Error, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named collection of records.
///
/// Each collection maps to one table in the structured store and one blob in
/// the key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Traces,
    Drafts,
    Templates,
    Products,
}

impl Collection {
    /// Every collection, in table-creation order.
    pub const ALL: [Collection; 4] = [
        Collection::Traces,
        Collection::Drafts,
        Collection::Templates,
        Collection::Products,
    ];

    /// Name used for tables and storage keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Traces => "traces",
            Collection::Drafts => "drafts",
            Collection::Templates => "templates",
            Collection::Products => "products",
        }
    }

    /// Prefix for generated ids (`trace_<millis>`, `draft_<millis>`, ...).
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Collection::Traces => "trace",
            Collection::Drafts => "draft",
            Collection::Templates => "template",
            Collection::Products => "product",
        }
    }

    /// Whether writes to this collection are queued for the server.
    pub fn is_synced(&self) -> bool {
        matches!(self, Collection::Traces)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Collection::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::UnknownCollection(s.to_string()))
    }
}

/// A trace record captured by the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// Unique identifier, fixed at creation
    pub id: RecordId,
    /// Domain payload
    pub data: serde_json::Value,
    /// When the record was saved (milliseconds since epoch)
    pub created_at: Timestamp,
    /// Whether the server has acknowledged this record
    pub synced: bool,
    /// When the server acknowledged it
    pub synced_at: Option<Timestamp>,
}

impl TraceRecord {
    /// Create a new, not yet synced record.
    pub fn new(id: impl Into<RecordId>, data: serde_json::Value, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            data,
            created_at: timestamp,
            synced: false,
            synced_at: None,
        }
    }

    /// Record a confirmed server acknowledgement.
    pub fn mark_synced(&mut self, timestamp: Timestamp) {
        self.synced = true;
        self.synced_at = Some(timestamp);
    }
}

/// A locally kept work-in-progress form. Drafts never leave the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Draft {
    pub id: RecordId,
    pub data: serde_json::Value,
    pub updated_at: Timestamp,
}

impl Draft {
    pub fn new(id: impl Into<RecordId>, data: serde_json::Value, timestamp: Timestamp) -> Self {
        Self {
            id: id.into(),
            data,
            updated_at: timestamp,
        }
    }
}

/// Generate an id of the form `<prefix>_<millis>`.
pub fn generate_id(prefix: &str, timestamp: Timestamp) -> RecordId {
    format!("{}_{}", prefix, timestamp)
}

/// Extract the `id` field every stored record carries.
pub fn record_id(record: &serde_json::Value) -> Result<&str> {
    record
        .get("id")
        .and_then(|id| id.as_str())
        .filter(|id| !id.is_empty())
        .ok_or(Error::MissingId)
}

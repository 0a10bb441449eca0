//! Storage backends for records.
//!
//! [`StorageAdapter`] is the port the persistence layer talks to. Two
//! adapters implement it:
//!
//! - [`SqliteAdapter`]: a versioned SQLite database, one table per
//!   collection.
//! - [`KeyValueAdapter`]: one JSON blob per collection on top of any
//!   [`KeyValueBackend`] (in-memory or file backed).

mod kv;
mod sqlite;

pub use kv::{FileKv, KeyValueAdapter, KeyValueBackend, MemoryKv};
pub(crate) use kv::json_type;
pub use sqlite::{SqliteAdapter, SCHEMA_VERSION};

use crate::{error::Result, Collection};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which kind of adapter is serving a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BackendKind {
    Structured,
    KeyValue,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Structured => f.write_str("structured"),
            BackendKind::KeyValue => f.write_str("key-value"),
        }
    }
}

/// Uniform record storage keyed by the record's `id` field.
///
/// Records are JSON objects; every record must carry a non-empty string
/// `id`. Errors are returned to the caller, never swallowed here.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Which implementation this is.
    fn kind(&self) -> BackendKind;

    /// Insert or replace a record, returning what was stored.
    async fn save(&self, collection: Collection, record: serde_json::Value)
        -> Result<serde_json::Value>;

    /// Fetch a record by id.
    async fn get(&self, collection: Collection, id: &str) -> Result<Option<serde_json::Value>>;

    /// Fetch every record in a collection, ordered by id.
    async fn get_all(&self, collection: Collection) -> Result<Vec<serde_json::Value>>;

    /// Delete a record. Returns whether anything was removed.
    async fn delete(&self, collection: Collection, id: &str) -> Result<bool>;
}

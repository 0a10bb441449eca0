//! Key/value storage: the backends and the record adapter built on them.

use super::{BackendKind, StorageAdapter};
use crate::{error::Result, record::record_id, Collection, Error};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A synchronous string key/value store.
///
/// This is the durable scratch space the queue mirror and the state store
/// write to, and the fallback record store.
pub trait KeyValueBackend: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
}

/// In-process key/value store. Contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryKv {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory store wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        // A panicking writer cannot leave a half-written String behind.
        self.items.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueBackend for MemoryKv {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }
}

/// File-backed key/value store: one file per key inside a directory.
///
/// Writes go to a temporary file that is renamed into place, so a reader
/// never observes a partially written value.
#[derive(Debug, Clone)]
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    /// Open (and create if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", encode_key(key)))
    }
}

impl KeyValueBackend for FileKv {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Map a key onto a portable file name.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'_' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Record adapter storing each collection as one JSON object under
/// `<namespace>.<collection>`, keyed by record id.
pub struct KeyValueAdapter {
    backend: Arc<dyn KeyValueBackend>,
    namespace: String,
    // Serializes read-modify-write cycles on the blobs.
    write_lock: Mutex<()>,
}

impl KeyValueAdapter {
    pub fn new(backend: Arc<dyn KeyValueBackend>, namespace: impl Into<String>) -> Self {
        Self {
            backend,
            namespace: namespace.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn key(&self, collection: Collection) -> String {
        format!("{}.{}", self.namespace, collection)
    }

    fn load(&self, collection: Collection) -> Result<Map<String, Value>> {
        let Some(raw) = self.backend.get_item(&self.key(collection))? else {
            return Ok(Map::new());
        };
        match serde_json::from_str(&raw)? {
            Value::Object(map) => Ok(map),
            other => Err(Error::Storage(format!(
                "collection blob {} is not an object (found {})",
                self.key(collection),
                json_type(&other)
            ))),
        }
    }

    fn store(&self, collection: Collection, map: &Map<String, Value>) -> Result<()> {
        let raw = serde_json::to_string(map)?;
        self.backend.set_item(&self.key(collection), &raw)
    }
}

#[async_trait]
impl StorageAdapter for KeyValueAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::KeyValue
    }

    async fn save(&self, collection: Collection, record: Value) -> Result<Value> {
        let id = record_id(&record)?.to_string();
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.load(collection)?;
        map.insert(id, record.clone());
        self.store(collection, &map)?;
        Ok(record)
    }

    async fn get(&self, collection: Collection, id: &str) -> Result<Option<Value>> {
        Ok(self.load(collection)?.remove(id))
    }

    async fn get_all(&self, collection: Collection) -> Result<Vec<Value>> {
        let mut entries: Vec<(String, Value)> = self.load(collection)?.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, v)| v).collect())
    }

    async fn delete(&self, collection: Collection, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = self.load(collection)?;
        if map.remove(id).is_none() {
            return Ok(false);
        }
        self.store(collection, &map)?;
        Ok(true)
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

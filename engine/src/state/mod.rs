//! Observable key/value state.
//!
//! A single JSON object tree addressed by dotted paths. Every mutation is
//! logged (when enabled) and announced to listeners registered on the exact
//! key and on the `*` wildcard. Listeners run synchronously, after the
//! mutation and before the mutating call returns.
//!
//! ```rust
//! use trace_offline::{MemoryKv, StateStore, SystemClock};
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! let store = StateStore::new(MemoryKv::new_shared(), Arc::new(SystemClock));
//! store.set("a.b.c", json!(5));
//!
//! assert_eq!(store.get("a.b", Value::Null), json!({"c": 5}));
//! assert_eq!(store.get("a.x", json!("dflt")), json!("dflt"));
//! ```

mod changelog;
pub mod path;

pub use changelog::{ChangeEntry, ChangeKind, ChangeLog};

use crate::events::{invoke_guarded, ListenerTable};
use crate::storage::KeyValueBackend;
use crate::{error::Result, Clock, Error, ListenerId, StoreConfig, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Listener key that receives every mutation.
pub const WILDCARD: &str = "*";

/// Context passed to store listeners alongside the new and old values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMeta {
    /// Key as given to the mutating call; empty for whole-tree mutations
    pub key: String,
    pub path: Vec<String>,
    pub timestamp: Timestamp,
}

/// Callback type for store listeners: `(new, old, meta)`.
pub type StoreListener = dyn Fn(&Value, &Value, &ChangeMeta) + Send + Sync;

struct Inner {
    state: Value,
    log: ChangeLog,
    config: StoreConfig,
    initialized: bool,
}

struct AutoSave {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// A pending notification, delivered once the state lock is released.
struct Notice {
    key: String,
    new: Value,
    old: Value,
    meta: ChangeMeta,
}

/// The observable state store.
pub struct StateStore {
    inner: Mutex<Inner>,
    listeners: ListenerTable<String, StoreListener>,
    backend: Arc<dyn KeyValueBackend>,
    clock: Arc<dyn Clock>,
    auto_save: Mutex<Option<AutoSave>>,
}

impl StateStore {
    /// Create an empty store with default configuration. Call
    /// [`StateStore::init`] to hydrate it and start auto-save.
    pub fn new(backend: Arc<dyn KeyValueBackend>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let config = StoreConfig::default();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                state: Value::Object(Map::new()),
                log: ChangeLog::new(config.max_log_length),
                config,
                initialized: false,
            }),
            listeners: ListenerTable::new(),
            backend,
            clock,
            auto_save: Mutex::new(None),
        })
    }

    /// Apply `config` (or the defaults), load any persisted state and start
    /// the auto-save timer.
    ///
    /// Only the first call has an effect; returns whether this call did the
    /// initialization. Auto-save needs a tokio runtime and is skipped with a
    /// warning outside one.
    pub fn init(self: &Arc<Self>, config: Option<StoreConfig>) -> bool {
        let config = {
            let mut inner = self.lock();
            if inner.initialized {
                return false;
            }
            inner.initialized = true;
            let config = config.unwrap_or_default();
            inner.log.set_capacity(config.max_log_length);
            inner.config = config.clone();

            if let Some(stored) = self.load_from_storage(&config.storage_key) {
                inner.state = stored;
            }
            config
        };

        if config.auto_save_enabled {
            self.start_auto_save(&config);
        }
        tracing::debug!(storage_key = %config.storage_key, auto_save = config.auto_save_enabled, "state store initialized");
        true
    }

    pub fn is_initialized(&self) -> bool {
        self.lock().initialized
    }

    pub fn config(&self) -> StoreConfig {
        self.lock().config.clone()
    }

    /// Write `value` at the dotted path `key`. Returns `false` for an
    /// invalid key or an array segment that is neither an index nor an
    /// append; the state is untouched in that case.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let segments = match path::parse(key) {
            Ok(segments) => segments,
            Err(e) => {
                tracing::warn!(error = %e, "rejected state write");
                return false;
            }
        };

        let notice = {
            let mut inner = self.lock();
            let old = match path::set(&mut inner.state, &segments, value.clone()) {
                Ok(old) => old.unwrap_or(Value::Null),
                Err(e) => {
                    tracing::warn!(error = %e, "rejected state write");
                    return false;
                }
            };
            let meta = self.meta(key, &segments);
            inner.record(&meta, ChangeKind::Set, &old, &value);
            Notice {
                key: key.to_string(),
                new: value,
                old,
                meta,
            }
        };

        self.announce(notice);
        true
    }

    /// Write several keys. Each key is logged and announced as its own
    /// mutation; returns how many were applied.
    pub fn set_many(&self, values: Map<String, Value>) -> usize {
        values
            .into_iter()
            .filter(|(key, value)| self.set(key, value.clone()))
            .count()
    }

    /// Read the value at `key`, or `default` when any segment is missing or
    /// the key is invalid.
    pub fn get(&self, key: &str, default: Value) -> Value {
        let Ok(segments) = path::parse(key) else {
            return default;
        };
        path::get(&self.lock().state, &segments)
            .cloned()
            .unwrap_or(default)
    }

    /// The whole state tree.
    pub fn get_all(&self) -> Value {
        self.lock().state.clone()
    }

    /// Delete the value at `key`. Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        let Ok(segments) = path::parse(key) else {
            tracing::warn!(key, "rejected state removal of invalid key");
            return false;
        };

        let notice = {
            let mut inner = self.lock();
            let Some(old) = path::remove(&mut inner.state, &segments) else {
                return false;
            };
            let meta = self.meta(key, &segments);
            inner.record(&meta, ChangeKind::Remove, &old, &Value::Null);
            Notice {
                key: key.to_string(),
                new: Value::Null,
                old,
                meta,
            }
        };

        self.announce(notice);
        true
    }

    /// Drop every top-level key except those in `exclude`.
    ///
    /// Logged as one `clear` entry; listeners of each dropped key (and the
    /// wildcard) are told the key went to `null`.
    pub fn clear(&self, exclude: &[&str]) {
        let notices = {
            let mut inner = self.lock();
            let previous = std::mem::replace(&mut inner.state, Value::Object(Map::new()));
            let Value::Object(entries) = previous.clone() else {
                return;
            };

            let mut kept = Map::new();
            let mut notices = Vec::new();
            let timestamp = self.clock.now_millis();
            for (key, old) in entries {
                if exclude.contains(&key.as_str()) {
                    kept.insert(key, old);
                    continue;
                }
                notices.push(Notice {
                    meta: ChangeMeta {
                        key: key.clone(),
                        path: vec![key.clone()],
                        timestamp,
                    },
                    key,
                    new: Value::Null,
                    old,
                });
            }
            inner.state = Value::Object(kept);

            let meta = ChangeMeta {
                key: String::new(),
                path: Vec::new(),
                timestamp,
            };
            let current = inner.state.clone();
            inner.record(&meta, ChangeKind::Clear, &previous, &current);
            notices
        };

        for notice in notices {
            self.announce(notice);
        }
    }

    /// Register `callback` for mutations of `key` (or every mutation, for
    /// `"*"`).
    pub fn subscribe<F>(&self, key: &str, callback: F) -> ListenerId
    where
        F: Fn(&Value, &Value, &ChangeMeta) + Send + Sync + 'static,
    {
        self.listeners.add(key.to_string(), Arc::new(callback))
    }

    pub fn unsubscribe(&self, key: &str, id: ListenerId) -> bool {
        self.listeners.remove(key, id)
    }

    /// Deep copy of the state tree.
    pub fn get_snapshot(&self) -> Value {
        self.get_all()
    }

    /// Replace the state with `snapshot`, or deep-merge it over the current
    /// state when `merge` is set.
    ///
    /// Anything but a JSON object is rejected without touching the state.
    pub fn restore_snapshot(&self, snapshot: &Value, merge: bool) -> bool {
        if let Err(e) = check_snapshot(snapshot) {
            tracing::error!(error = %e, "refusing to restore snapshot");
            return false;
        }

        let notice = {
            let mut inner = self.lock();
            let previous = inner.state.clone();
            if merge {
                path::deep_merge(&mut inner.state, snapshot);
            } else {
                inner.state = snapshot.clone();
            }
            let meta = ChangeMeta {
                key: String::new(),
                path: Vec::new(),
                timestamp: self.clock.now_millis(),
            };
            let current = inner.state.clone();
            inner.record(&meta, ChangeKind::Restore { merge }, &previous, &current);
            Notice {
                key: WILDCARD.to_string(),
                new: current,
                old: previous,
                meta,
            }
        };

        self.announce(notice);
        true
    }

    pub fn get_change_log(&self) -> Vec<ChangeEntry> {
        self.lock().log.entries()
    }

    pub fn clear_change_log(&self) {
        self.lock().log.clear();
    }

    /// Persist the state (or only the configured persistent keys) to the
    /// key/value backend. Returns whether the write succeeded.
    pub fn save_to_storage(&self) -> bool {
        let (storage_key, payload) = {
            let inner = self.lock();
            (inner.config.storage_key.clone(), inner.persisted_view())
        };

        let result = serde_json::to_string(&payload)
            .map_err(Error::from)
            .and_then(|raw| self.backend.set_item(&storage_key, &raw));
        match result {
            Ok(()) => {
                tracing::trace!(storage_key = %storage_key, "state saved");
                true
            }
            Err(e) => {
                tracing::error!(storage_key = %storage_key, error = %e, "failed to save state");
                false
            }
        }
    }

    /// Stop the auto-save timer and write the state one last time.
    pub fn stop_auto_save(&self) -> bool {
        let running = self
            .auto_save
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(auto_save) = running {
            let _ = auto_save.stop_tx.send(());
            drop(auto_save.handle);
            tracing::debug!("state auto-save stopped");
        }
        self.save_to_storage()
    }

    pub fn is_auto_saving(&self) -> bool {
        self.auto_save
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }

    fn load_from_storage(&self, storage_key: &str) -> Option<Value> {
        let raw = match self.backend.get_item(storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(storage_key, error = %e, "failed to read persisted state");
                return None;
            }
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) if value.is_object() => Some(value),
            Ok(value) => {
                tracing::warn!(storage_key, found = crate::storage::json_type(&value), "ignoring persisted state that is not an object");
                None
            }
            Err(e) => {
                tracing::warn!(storage_key, error = %e, "ignoring unreadable persisted state");
                None
            }
        }
    }

    fn start_auto_save(self: &Arc<Self>, config: &StoreConfig) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no tokio runtime; state auto-save disabled");
            return;
        };

        let period = config.auto_save_interval();
        let store: Weak<Self> = Arc::downgrade(self);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.save_to_storage();
            }
        });

        *self.auto_save.lock().unwrap_or_else(|e| e.into_inner()) =
            Some(AutoSave { stop_tx, handle });
    }

    fn meta(&self, key: &str, segments: &[&str]) -> ChangeMeta {
        ChangeMeta {
            key: key.to_string(),
            path: segments.iter().map(|s| s.to_string()).collect(),
            timestamp: self.clock.now_millis(),
        }
    }

    fn announce(&self, notice: Notice) {
        let mut callbacks = if notice.key == WILDCARD {
            Vec::new()
        } else {
            self.listeners.snapshot(notice.key.as_str())
        };
        callbacks.extend(self.listeners.snapshot(WILDCARD));

        for callback in callbacks {
            invoke_guarded(&notice.key, || {
                callback(&notice.new, &notice.old, &notice.meta)
            });
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn record(&mut self, meta: &ChangeMeta, kind: ChangeKind, previous: &Value, current: &Value) {
        if !self.config.log_changes {
            return;
        }
        self.log.push(ChangeEntry {
            key: meta.key.clone(),
            path: meta.path.clone(),
            timestamp: meta.timestamp,
            kind,
            previous: previous.clone(),
            current: current.clone(),
        });
    }

    fn persisted_view(&self) -> Value {
        if self.config.persistent_keys.is_empty() {
            return self.state.clone();
        }
        let picked: Map<String, Value> = self
            .config
            .persistent_keys
            .iter()
            .filter_map(|key| Some((key.clone(), self.state.get(key)?.clone())))
            .collect();
        Value::Object(picked)
    }
}

fn check_snapshot(snapshot: &Value) -> Result<()> {
    if snapshot.is_object() {
        Ok(())
    } else {
        Err(Error::InvalidSnapshot(format!(
            "expected an object, found {}",
            crate::storage::json_type(snapshot)
        )))
    }
}

impl Drop for StateStore {
    fn drop(&mut self) {
        let running = self
            .auto_save
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(auto_save) = running {
            let _ = auto_save.stop_tx.send(());
        }
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("StateStore")
            .field("initialized", &inner.initialized)
            .field("keys", &inner.state.as_object().map_or(0, |m| m.len()))
            .field("log_len", &inner.log.len())
            .finish()
    }
}

//! In-process event bus.
//!
//! The synchronizer, the connectivity watcher and the persistence layer
//! publish here; UI collaborators subscribe to render offline banners, sync
//! toasts and refreshed lists.

use crate::{Collection, ListenerId, RecordId};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Names listeners register under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventName {
    Connectivity,
    SyncStatus,
    DataUpdated,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Connectivity => "connectivity",
            EventName::SyncStatus => "syncstatus",
            EventName::DataUpdated => "dataupdated",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of one sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SyncStatus {
    /// A run started with `count` items in its snapshot
    Syncing { count: usize },
    /// One more item was attempted
    Progress { processed: usize, total: usize },
    /// The run finished, possibly early
    Completed {
        total: usize,
        success: usize,
        failed: usize,
    },
}

/// What happened to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataAction {
    Saved,
    Deleted,
    Synced,
}

/// An event published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail", rename_all = "lowercase")]
pub enum Event {
    Connectivity { online: bool },
    SyncStatus(SyncStatus),
    DataUpdated {
        collection: Collection,
        id: RecordId,
        action: DataAction,
    },
}

impl Event {
    pub fn name(&self) -> EventName {
        match self {
            Event::Connectivity { .. } => EventName::Connectivity,
            Event::SyncStatus(_) => EventName::SyncStatus,
            Event::DataUpdated { .. } => EventName::DataUpdated,
        }
    }
}

/// Callback type for bus listeners.
pub type EventCallback = dyn Fn(&Event) + Send + Sync;

/// Registry of callbacks grouped by key, shared by the bus and the state
/// store.
pub(crate) struct ListenerTable<K, C: ?Sized> {
    entries: Mutex<HashMap<K, Vec<(ListenerId, Arc<C>)>>>,
    next_id: AtomicU64,
}

impl<K: Eq + Hash, C: ?Sized> ListenerTable<K, C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(&self, key: K, callback: Arc<C>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().entry(key).or_default().push((id, callback));
        id
    }

    pub(crate) fn remove<Q>(&self, key: &Q, id: ListenerId) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let mut entries = self.lock();
        let Some(list) = entries.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(existing, _)| *existing != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.remove(key);
        }
        removed
    }

    /// Clone the callbacks for `key` so they can run without the lock held.
    pub(crate) fn snapshot<Q>(&self, key: &Q) -> Vec<Arc<C>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock()
            .get(key)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default()
    }

    pub(crate) fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.lock().get(key).map_or(0, |list| list.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Vec<(ListenerId, Arc<C>)>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Run a listener, containing any panic it raises.
///
/// Returns `false` when the listener panicked.
pub(crate) fn invoke_guarded(label: &str, f: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(listener = %label, panic = %message, "listener panicked");
            false
        }
    }
}

/// Publish/subscribe hub for offline-layer events.
pub struct EventBus {
    listeners: ListenerTable<EventName, EventCallback>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            listeners: ListenerTable::new(),
        }
    }

    /// Create a bus wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a callback for `name`.
    pub fn add_event_listener<F>(&self, name: EventName, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.listeners.add(name, Arc::new(callback));
        tracing::trace!(event = %name, listener = id, "listener registered");
        id
    }

    /// Unregister a callback. Returns whether it was registered.
    pub fn remove_event_listener(&self, name: EventName, id: ListenerId) -> bool {
        self.listeners.remove(&name, id)
    }

    /// Deliver an event to every listener registered for its name.
    ///
    /// Listeners run synchronously in registration order. A panicking
    /// listener is logged and skipped. Returns how many listeners completed.
    pub fn dispatch(&self, event: &Event) -> usize {
        let name = event.name();
        let callbacks = self.listeners.snapshot(&name);

        callbacks
            .iter()
            .filter(|cb| invoke_guarded(name.as_str(), || cb(event)))
            .count()
    }

    pub fn listener_count(&self, name: EventName) -> usize {
        self.listeners.count(&name)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("connectivity", &self.listener_count(EventName::Connectivity))
            .field("syncstatus", &self.listener_count(EventName::SyncStatus))
            .field("dataupdated", &self.listener_count(EventName::DataUpdated))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatch_reaches_matching_listeners_only() {
        let bus = EventBus::new();
        let status_hits = Arc::new(AtomicUsize::new(0));
        let online_hits = Arc::new(AtomicUsize::new(0));

        let hits = status_hits.clone();
        bus.add_event_listener(EventName::SyncStatus, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let hits = online_hits.clone();
        bus.add_event_listener(EventName::Connectivity, move |_| {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.dispatch(&Event::SyncStatus(SyncStatus::Syncing { count: 2 }));
        assert_eq!(delivered, 1);
        assert_eq!(status_hits.load(Ordering::SeqCst), 1);
        assert_eq!(online_hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_listener() {
        let bus = EventBus::new();
        let id = bus.add_event_listener(EventName::Connectivity, |_| {});
        assert_eq!(bus.listener_count(EventName::Connectivity), 1);

        assert!(bus.remove_event_listener(EventName::Connectivity, id));
        assert!(!bus.remove_event_listener(EventName::Connectivity, id));
        assert!(!bus.remove_event_listener(EventName::SyncStatus, id));
        assert_eq!(bus.dispatch(&Event::Connectivity { online: true }), 0);
    }

    #[test]
    fn panicking_listener_does_not_stop_dispatch() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.add_event_listener(EventName::Connectivity, |_| panic!("broken listener"));
        let counter = hits.clone();
        bus.add_event_listener(EventName::Connectivity, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let delivered = bus.dispatch(&Event::Connectivity { online: false });
        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn listener_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new());
        let slot = Arc::new(AtomicU64::new(0));

        let weak = Arc::downgrade(&bus);
        let own_id = slot.clone();
        let id = bus.add_event_listener(EventName::DataUpdated, move |_| {
            if let Some(bus) = weak.upgrade() {
                bus.remove_event_listener(EventName::DataUpdated, own_id.load(Ordering::SeqCst));
            }
        });
        slot.store(id, Ordering::SeqCst);

        let event = Event::DataUpdated {
            collection: Collection::Traces,
            id: "trace_1".into(),
            action: DataAction::Saved,
        };
        assert_eq!(bus.dispatch(&event), 1);
        assert_eq!(bus.listener_count(EventName::DataUpdated), 0);
    }

    #[test]
    fn event_json_shape() {
        let event = Event::SyncStatus(SyncStatus::Completed {
            total: 3,
            success: 2,
            failed: 1,
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "syncstatus",
                "detail": {"status": "completed", "total": 3, "success": 2, "failed": 1}
            })
        );
        assert_eq!(EventName::SyncStatus.to_string(), "syncstatus");
    }
}

//! Record lifecycle on top of a [`StorageAdapter`].
//!
//! Every operation here is infallible from the caller's point of view:
//! storage failures are logged and surface as `SaveResult { success: false }`,
//! `None`, an empty list or `false`.

use crate::events::{DataAction, Event, EventBus};
use crate::notify::{Notifier, NotifyLevel};
use crate::record::generate_id;
use crate::storage::{KeyValueAdapter, KeyValueBackend, SqliteAdapter, StorageAdapter};
use crate::sync::{SyncItem, SyncQueue, SyncScheduler};
use crate::{Clock, Collection, Draft, Error, OfflineConfig, RecordId, TraceRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Sync item type used for trace records.
pub const TRACE_ITEM_TYPE: &str = "trace";

/// Outcome of a save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RecordId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SaveResult {
    pub fn ok(id: impl Into<RecordId>) -> Self {
        Self {
            success: true,
            id: Some(id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            id: None,
            error: Some(error.to_string()),
        }
    }
}

/// Pick the storage adapter for this session.
///
/// When the structured store is requested but cannot be opened, the key/value
/// adapter is used for the rest of the session.
pub async fn select_adapter(
    config: &OfflineConfig,
    kv: Arc<dyn KeyValueBackend>,
    notifier: &dyn Notifier,
) -> Arc<dyn StorageAdapter> {
    if config.use_structured_store {
        match SqliteAdapter::open(&config.database_url).await {
            Ok(adapter) => return Arc::new(adapter),
            Err(e) => {
                tracing::warn!(
                    url = %config.database_url,
                    error = %e,
                    "structured store unavailable, falling back to key/value storage"
                );
                notifier.notify(
                    "Local database unavailable; using basic storage for this session",
                    NotifyLevel::Warning,
                );
            }
        }
    }
    Arc::new(KeyValueAdapter::new(kv, config.namespace.clone()))
}

/// Saves, loads and deletes records, and queues trace mutations for sync.
pub struct Persistence {
    adapter: Arc<dyn StorageAdapter>,
    queue: Arc<SyncQueue>,
    scheduler: Arc<SyncScheduler>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl Persistence {
    pub fn new(
        adapter: Arc<dyn StorageAdapter>,
        queue: Arc<SyncQueue>,
        scheduler: Arc<SyncScheduler>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            adapter,
            queue,
            scheduler,
            events,
            clock,
        }
    }

    /// The adapter serving this session.
    pub fn adapter(&self) -> &Arc<dyn StorageAdapter> {
        &self.adapter
    }

    // ------------------------------------------------------------------
    // Trace records
    // ------------------------------------------------------------------

    /// Save a trace record and queue it for the server.
    ///
    /// The record is queued even while offline. Without an `id`, one of the
    /// form `trace_<millis>` is generated.
    pub async fn save_trace_record(&self, id: Option<&str>, data: serde_json::Value) -> SaveResult {
        let now = self.clock.now_millis();
        let id = resolve_id(id, Collection::Traces, now);
        let record = TraceRecord::new(id.clone(), data.clone(), now);

        if let Err(e) = self.store(Collection::Traces, &record).await {
            tracing::error!(id = %id, error = %e, "failed to save trace record");
            return SaveResult::failed(e);
        }

        self.queue.enqueue(SyncItem::create(TRACE_ITEM_TYPE, id.clone(), data));
        self.scheduler.schedule_sync();
        self.announce(Collection::Traces, &id, DataAction::Saved);

        SaveResult::ok(id)
    }

    pub async fn get_trace_record(&self, id: &str) -> Option<TraceRecord> {
        self.load(Collection::Traces, id).await
    }

    pub async fn list_trace_records(&self) -> Vec<TraceRecord> {
        self.load_all(Collection::Traces).await
    }

    /// Delete a trace record and queue the deletion for the server.
    pub async fn delete_trace_record(&self, id: &str) -> bool {
        match self.adapter.delete(Collection::Traces, id).await {
            Ok(true) => {
                self.queue.enqueue(SyncItem::delete(TRACE_ITEM_TYPE, id));
                self.scheduler.schedule_sync();
                self.announce(Collection::Traces, id, DataAction::Deleted);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(id = %id, error = %e, "failed to delete trace record");
                false
            }
        }
    }

    /// Flag a trace record as acknowledged by the server. Never queues.
    pub async fn mark_trace_synced(&self, id: &str) -> bool {
        let Some(mut record) = self.get_trace_record(id).await else {
            tracing::debug!(id = %id, "acknowledged trace record no longer stored");
            return false;
        };

        record.mark_synced(self.clock.now_millis());
        match self.store(Collection::Traces, &record).await {
            Ok(()) => {
                self.announce(Collection::Traces, id, DataAction::Synced);
                true
            }
            Err(e) => {
                tracing::error!(id = %id, error = %e, "failed to mark trace record synced");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Drafts (local only)
    // ------------------------------------------------------------------

    pub async fn save_draft(&self, id: Option<&str>, data: serde_json::Value) -> SaveResult {
        self.save_local(Collection::Drafts, id, data).await
    }

    pub async fn get_draft(&self, id: &str) -> Option<Draft> {
        self.load(Collection::Drafts, id).await
    }

    pub async fn list_drafts(&self) -> Vec<Draft> {
        self.load_all(Collection::Drafts).await
    }

    pub async fn delete_draft(&self, id: &str) -> bool {
        self.delete_local(Collection::Drafts, id).await
    }

    // ------------------------------------------------------------------
    // Templates and products (local only)
    // ------------------------------------------------------------------

    /// Save a local-only document. Trace records must go through
    /// [`Persistence::save_trace_record`].
    pub async fn save_document(
        &self,
        collection: Collection,
        id: Option<&str>,
        data: serde_json::Value,
    ) -> SaveResult {
        if collection.is_synced() {
            return SaveResult::failed(format!(
                "{} are synced; use save_trace_record",
                collection
            ));
        }
        self.save_local(collection, id, data).await
    }

    pub async fn get_document(&self, collection: Collection, id: &str) -> Option<Draft> {
        self.load(collection, id).await
    }

    pub async fn list_documents(&self, collection: Collection) -> Vec<Draft> {
        self.load_all(collection).await
    }

    pub async fn delete_document(&self, collection: Collection, id: &str) -> bool {
        if collection.is_synced() {
            tracing::warn!(%collection, id = %id, "refusing local-only delete of synced record");
            return false;
        }
        self.delete_local(collection, id).await
    }

    // ------------------------------------------------------------------

    async fn save_local(
        &self,
        collection: Collection,
        id: Option<&str>,
        data: serde_json::Value,
    ) -> SaveResult {
        let now = self.clock.now_millis();
        let id = resolve_id(id, collection, now);
        let document = Draft::new(id.clone(), data, now);

        match self.store(collection, &document).await {
            Ok(()) => {
                self.announce(collection, &id, DataAction::Saved);
                SaveResult::ok(id)
            }
            Err(e) => {
                tracing::error!(%collection, id = %id, error = %e, "failed to save record");
                SaveResult::failed(e)
            }
        }
    }

    async fn delete_local(&self, collection: Collection, id: &str) -> bool {
        match self.adapter.delete(collection, id).await {
            Ok(removed) => {
                if removed {
                    self.announce(collection, id, DataAction::Deleted);
                }
                removed
            }
            Err(e) => {
                tracing::error!(%collection, id = %id, error = %e, "failed to delete record");
                false
            }
        }
    }

    async fn store<T: Serialize>(&self, collection: Collection, record: &T) -> crate::Result<()> {
        let value = serde_json::to_value(record)?;
        self.adapter.save(collection, value).await?;
        Ok(())
    }

    async fn load<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Option<T> {
        match self.adapter.get(collection, id).await {
            Ok(Some(value)) => decode(collection, id, value),
            Ok(None) => None,
            Err(e) => {
                tracing::error!(%collection, id = %id, error = %e, "failed to read record");
                None
            }
        }
    }

    async fn load_all<T: DeserializeOwned>(&self, collection: Collection) -> Vec<T> {
        match self.adapter.get_all(collection).await {
            Ok(values) => values
                .into_iter()
                .filter_map(|value| {
                    let id = value
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<unknown>")
                        .to_string();
                    decode(collection, &id, value)
                })
                .collect(),
            Err(e) => {
                tracing::error!(%collection, error = %e, "failed to list records");
                Vec::new()
            }
        }
    }

    fn announce(&self, collection: Collection, id: &str, action: DataAction) {
        self.events.dispatch(&Event::DataUpdated {
            collection,
            id: id.to_string(),
            action,
        });
    }
}

fn resolve_id(id: Option<&str>, collection: Collection, now: crate::Timestamp) -> RecordId {
    match id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => generate_id(collection.id_prefix(), now),
    }
}

fn decode<T: DeserializeOwned>(collection: Collection, id: &str, value: serde_json::Value) -> Option<T> {
    match serde_json::from_value(value) {
        Ok(record) => Some(record),
        Err(e) => {
            let err = Error::CorruptRecord {
                collection: collection.to_string(),
                id: id.to_string(),
                reason: e.to_string(),
            };
            tracing::warn!(error = %err, "skipping unreadable record");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventName;
    use crate::storage::MemoryKv;
    use crate::sync::Connectivity;
    use crate::ManualClock;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        persistence: Persistence,
        queue: Arc<SyncQueue>,
        events: Arc<EventBus>,
        clock: Arc<ManualClock>,
    }

    fn fixture_with(adapter: Arc<dyn StorageAdapter>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_706_745_600_000));
        let kv = MemoryKv::new_shared();
        let queue = Arc::new(SyncQueue::load(100, "test.sync_queue", vec![kv], clock.clone()));
        let scheduler = Arc::new(SyncScheduler::new(Connectivity::new(false)));
        let events = EventBus::new_shared();
        let persistence = Persistence::new(
            adapter,
            queue.clone(),
            scheduler,
            events.clone(),
            clock.clone(),
        );
        Fixture {
            persistence,
            queue,
            events,
            clock,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(KeyValueAdapter::new(MemoryKv::new_shared(), "test")))
    }

    /// Adapter whose every call fails.
    struct BrokenAdapter;

    #[async_trait]
    impl StorageAdapter for BrokenAdapter {
        fn kind(&self) -> crate::storage::BackendKind {
            crate::storage::BackendKind::KeyValue
        }
        async fn save(&self, _: Collection, _: serde_json::Value) -> crate::Result<serde_json::Value> {
            Err(Error::Storage("disk full".into()))
        }
        async fn get(&self, _: Collection, _: &str) -> crate::Result<Option<serde_json::Value>> {
            Err(Error::Storage("disk full".into()))
        }
        async fn get_all(&self, _: Collection) -> crate::Result<Vec<serde_json::Value>> {
            Err(Error::Storage("disk full".into()))
        }
        async fn delete(&self, _: Collection, _: &str) -> crate::Result<bool> {
            Err(Error::Storage("disk full".into()))
        }
    }

    #[tokio::test]
    async fn save_trace_generates_id_and_enqueues() {
        let f = fixture();

        let result = f
            .persistence
            .save_trace_record(None, json!({"crop": "corn"}))
            .await;
        assert_eq!(result, SaveResult::ok("trace_1706745600000"));

        let record = f
            .persistence
            .get_trace_record("trace_1706745600000")
            .await
            .unwrap();
        assert_eq!(record.data, json!({"crop": "corn"}));
        assert!(!record.synced);

        let pending = f.queue.snapshot();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].is_trace_create());
        assert_eq!(pending[0].id, "trace_1706745600000");
        assert_eq!(pending[0].data, Some(json!({"crop": "corn"})));
    }

    #[tokio::test]
    async fn drafts_are_never_queued() {
        let f = fixture();

        let result = f.persistence.save_draft(Some("draft_a"), json!({"step": 1})).await;
        assert!(result.success);
        assert!(f.queue.is_empty());

        let draft = f.persistence.get_draft("draft_a").await.unwrap();
        assert_eq!(draft.updated_at, f.clock.now_millis());

        assert!(f.persistence.delete_draft("draft_a").await);
        assert!(f.queue.is_empty());
        assert!(f.persistence.get_draft("draft_a").await.is_none());
    }

    #[tokio::test]
    async fn delete_trace_enqueues_delete() {
        let f = fixture();
        f.persistence.save_trace_record(Some("t1"), json!({})).await;

        assert!(f.persistence.delete_trace_record("t1").await);
        let actions: Vec<_> = f.queue.snapshot().into_iter().map(|i| i.action).collect();
        assert_eq!(
            actions,
            vec![crate::sync::SyncAction::Create, crate::sync::SyncAction::Delete]
        );

        // Nothing left to delete, nothing more queued
        assert!(!f.persistence.delete_trace_record("t1").await);
        assert_eq!(f.queue.len(), 2);
    }

    #[tokio::test]
    async fn mark_synced_does_not_enqueue() {
        let f = fixture();
        f.persistence.save_trace_record(Some("t1"), json!({"lot": 7})).await;
        f.clock.advance(500);

        assert!(f.persistence.mark_trace_synced("t1").await);
        let record = f.persistence.get_trace_record("t1").await.unwrap();
        assert!(record.synced);
        assert_eq!(record.synced_at, Some(1_706_745_600_500));
        assert_eq!(record.data, json!({"lot": 7}));
        assert_eq!(f.queue.len(), 1);

        assert!(!f.persistence.mark_trace_synced("missing").await);
    }

    #[tokio::test]
    async fn list_records() {
        let f = fixture();
        f.persistence.save_trace_record(Some("trace_1"), json!(1)).await;
        f.persistence.save_trace_record(Some("trace_2"), json!(2)).await;
        f.persistence.save_draft(Some("draft_1"), json!(3)).await;

        let traces = f.persistence.list_trace_records().await;
        assert_eq!(traces.len(), 2);
        assert_eq!(traces[1].data, json!(2));
        assert_eq!(f.persistence.list_drafts().await.len(), 1);
    }

    #[tokio::test]
    async fn storage_failures_become_results() {
        let f = fixture_with(Arc::new(BrokenAdapter));

        let result = f.persistence.save_trace_record(None, json!({})).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("storage error: disk full"));
        assert!(f.queue.is_empty(), "failed saves must not be queued");

        assert!(f.persistence.get_trace_record("x").await.is_none());
        assert!(f.persistence.list_trace_records().await.is_empty());
        assert!(!f.persistence.delete_trace_record("x").await);
        assert!(f.queue.is_empty());
        assert!(!f.persistence.save_draft(None, json!({})).await.success);
    }

    #[tokio::test]
    async fn documents_are_local_only() {
        let f = fixture();

        let saved = f
            .persistence
            .save_document(Collection::Templates, None, json!({"name": "harvest"}))
            .await;
        assert_eq!(saved.id.as_deref(), Some("template_1706745600000"));
        assert!(f.queue.is_empty());

        let listed = f.persistence.list_documents(Collection::Templates).await;
        assert_eq!(listed.len(), 1);
        assert!(f.persistence.list_documents(Collection::Products).await.is_empty());

        let refused = f
            .persistence
            .save_document(Collection::Traces, None, json!({}))
            .await;
        assert!(!refused.success);
        assert!(!f.persistence.delete_document(Collection::Traces, "x").await);
    }

    #[tokio::test]
    async fn data_updated_events() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.events.add_event_listener(EventName::DataUpdated, move |event| {
            if let Event::DataUpdated { id, action, .. } = event {
                sink.lock().unwrap().push((id.clone(), *action));
            }
        });

        f.persistence.save_trace_record(Some("t1"), json!({})).await;
        f.persistence.mark_trace_synced("t1").await;
        f.persistence.delete_trace_record("t1").await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("t1".to_string(), DataAction::Saved),
                ("t1".to_string(), DataAction::Synced),
                ("t1".to_string(), DataAction::Deleted),
            ]
        );
    }

    #[tokio::test]
    async fn unreadable_records_are_skipped() {
        let adapter = Arc::new(KeyValueAdapter::new(MemoryKv::new_shared(), "test"));
        adapter
            .save(Collection::Traces, json!({"id": "bad", "data": 1}))
            .await
            .unwrap();
        let f = fixture_with(adapter);
        f.persistence.save_trace_record(Some("good"), json!({})).await;

        assert!(f.persistence.get_trace_record("bad").await.is_none());
        let ids: Vec<_> = f
            .persistence
            .list_trace_records()
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["good"]);
    }

    #[tokio::test]
    async fn fallback_when_structured_store_fails() {
        let config = OfflineConfig {
            database_url: "sqlite:/nonexistent-dir/trace.db".into(),
            ..OfflineConfig::default()
        };
        let adapter = select_adapter(&config, MemoryKv::new_shared(), &crate::TracingNotifier).await;
        assert_eq!(adapter.kind(), crate::storage::BackendKind::KeyValue);

        let config = OfflineConfig {
            database_url: "sqlite::memory:".into(),
            ..OfflineConfig::default()
        };
        let adapter = select_adapter(&config, MemoryKv::new_shared(), &crate::TracingNotifier).await;
        assert_eq!(adapter.kind(), crate::storage::BackendKind::Structured);
    }
}

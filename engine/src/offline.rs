//! The offline context: one value owning storage, queue, sync and events.

use crate::events::{EventBus, EventName};
use crate::notify::{Notifier, TracingNotifier};
use crate::persistence::{select_adapter, Persistence, SaveResult};
use crate::storage::{BackendKind, KeyValueBackend, MemoryKv, StorageAdapter};
use crate::sync::{
    BackgroundSync, Connectivity, HttpTransport, SyncItem, SyncQueue, SyncRun, SyncScheduler,
    Synchronizer, Transport,
};
use crate::{
    Clock, Collection, ConfigError, Draft, Event, ListenerId, OfflineConfig, SystemClock,
    TraceRecord,
};
use std::sync::Arc;

/// Builder for [`TraceOffline`]. Every capability has a default: an
/// in-memory key/value backend, HTTP transport, the system clock, a
/// tracing notifier and an online connectivity flag.
pub struct TraceOfflineBuilder {
    config: OfflineConfig,
    key_value: Option<Arc<dyn KeyValueBackend>>,
    queue_mirrors: Vec<Arc<dyn KeyValueBackend>>,
    adapter: Option<Arc<dyn StorageAdapter>>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Arc<dyn Clock>>,
    notifier: Option<Arc<dyn Notifier>>,
    connectivity: Option<Connectivity>,
}

impl TraceOfflineBuilder {
    /// Key/value backend for the queue mirror and the fallback record store.
    pub fn key_value(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.key_value = Some(backend);
        self
    }

    /// An additional backend the queue is mirrored to.
    pub fn queue_mirror(mut self, backend: Arc<dyn KeyValueBackend>) -> Self {
        self.queue_mirrors.push(backend);
        self
    }

    /// Use this adapter instead of choosing one from the configuration.
    pub fn adapter(mut self, adapter: Arc<dyn StorageAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = Some(connectivity);
        self
    }

    /// Open storage, restore the queue and wire everything together.
    pub async fn build(self) -> Result<TraceOffline, ConfigError> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(TracingNotifier));
        let connectivity = self.connectivity.unwrap_or_default();
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new()));
        let key_value = self
            .key_value
            .unwrap_or_else(|| MemoryKv::new_shared() as Arc<dyn KeyValueBackend>);

        let adapter = match self.adapter {
            Some(adapter) => adapter,
            None => select_adapter(&self.config, key_value.clone(), notifier.as_ref()).await,
        };

        let mut mirrors = vec![key_value.clone()];
        mirrors.extend(self.queue_mirrors);
        let queue = Arc::new(SyncQueue::load(
            self.config.max_queue_size,
            format!("{}.sync_queue", self.config.namespace),
            mirrors,
            clock.clone(),
        ));

        let events = EventBus::new_shared();
        let scheduler = Arc::new(SyncScheduler::new(connectivity.clone()));
        let persistence = Arc::new(Persistence::new(
            adapter,
            queue.clone(),
            scheduler.clone(),
            events.clone(),
            clock,
        ));
        let synchronizer = Arc::new(Synchronizer::new(
            queue.clone(),
            persistence.clone(),
            transport,
            connectivity.clone(),
            events.clone(),
            notifier,
            self.config.sync_endpoint.clone(),
        ));

        tracing::info!(
            backend = %persistence.adapter().kind(),
            pending = queue.len(),
            endpoint = %self.config.sync_endpoint,
            "offline layer ready"
        );

        Ok(TraceOffline {
            config: self.config,
            persistence,
            queue,
            scheduler,
            synchronizer,
            events,
            connectivity,
            key_value,
        })
    }
}

/// Offline persistence and sync for one application instance.
///
/// Instances share nothing; tests can run several side by side.
pub struct TraceOffline {
    config: OfflineConfig,
    persistence: Arc<Persistence>,
    queue: Arc<SyncQueue>,
    scheduler: Arc<SyncScheduler>,
    synchronizer: Arc<Synchronizer>,
    events: Arc<EventBus>,
    connectivity: Connectivity,
    key_value: Arc<dyn KeyValueBackend>,
}

impl TraceOffline {
    pub fn builder(config: OfflineConfig) -> TraceOfflineBuilder {
        TraceOfflineBuilder {
            config,
            key_value: None,
            queue_mirrors: Vec::new(),
            adapter: None,
            transport: None,
            clock: None,
            notifier: None,
            connectivity: None,
        }
    }

    /// Build with every capability defaulted.
    pub async fn new(config: OfflineConfig) -> Result<Self, ConfigError> {
        Self::builder(config).build().await
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.persistence.adapter().kind()
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    /// The key/value backend, for sharing with a [`crate::StateStore`].
    pub fn key_value(&self) -> &Arc<dyn KeyValueBackend> {
        &self.key_value
    }

    pub async fn save_trace_record(&self, id: Option<&str>, data: serde_json::Value) -> SaveResult {
        self.persistence.save_trace_record(id, data).await
    }

    pub async fn get_trace_record(&self, id: &str) -> Option<TraceRecord> {
        self.persistence.get_trace_record(id).await
    }

    pub async fn list_trace_records(&self) -> Vec<TraceRecord> {
        self.persistence.list_trace_records().await
    }

    pub async fn delete_trace_record(&self, id: &str) -> bool {
        self.persistence.delete_trace_record(id).await
    }

    pub async fn save_draft(&self, id: Option<&str>, data: serde_json::Value) -> SaveResult {
        self.persistence.save_draft(id, data).await
    }

    pub async fn get_draft(&self, id: &str) -> Option<Draft> {
        self.persistence.get_draft(id).await
    }

    pub async fn list_drafts(&self) -> Vec<Draft> {
        self.persistence.list_drafts().await
    }

    pub async fn delete_draft(&self, id: &str) -> bool {
        self.persistence.delete_draft(id).await
    }

    pub async fn save_document(
        &self,
        collection: Collection,
        id: Option<&str>,
        data: serde_json::Value,
    ) -> SaveResult {
        self.persistence.save_document(collection, id, data).await
    }

    pub async fn get_document(&self, collection: Collection, id: &str) -> Option<Draft> {
        self.persistence.get_document(collection, id).await
    }

    pub async fn list_documents(&self, collection: Collection) -> Vec<Draft> {
        self.persistence.list_documents(collection).await
    }

    pub async fn delete_document(&self, collection: Collection, id: &str) -> bool {
        self.persistence.delete_document(collection, id).await
    }

    /// Push pending items to the server now.
    pub async fn sync_data(&self) -> SyncRun {
        self.synchronizer.sync_data().await
    }

    /// Start the background sync loop on the current tokio runtime.
    pub fn start(&self) -> BackgroundSync {
        BackgroundSync::spawn(
            self.synchronizer.clone(),
            self.scheduler.clone(),
            self.connectivity.clone(),
            self.events.clone(),
            self.config.sync_interval(),
        )
    }

    /// Report a connectivity transition from the host.
    pub fn set_online(&self, online: bool) -> bool {
        self.connectivity.set_online(online)
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn add_event_listener<F>(&self, name: EventName, callback: F) -> ListenerId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.events.add_event_listener(name, callback)
    }

    pub fn remove_event_listener(&self, name: EventName, id: ListenerId) -> bool {
        self.events.remove_event_listener(name, id)
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn pending_items(&self) -> Vec<SyncItem> {
        self.queue.snapshot()
    }

    /// Drop every pending item without sending it.
    pub fn clear_queue(&self) {
        self.queue.clear();
    }
}

impl std::fmt::Debug for TraceOffline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceOffline")
            .field("backend", &self.backend_kind())
            .field("endpoint", &self.config.sync_endpoint)
            .field("pending", &self.queue.len())
            .field("online", &self.is_online())
            .finish()
    }
}

//! End-to-end tests for the offline layer
//!
//! These tests wire a full `TraceOffline` against in-memory SQLite or the
//! key/value fallback and a scripted transport.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use trace_offline::{
    BackendKind, Clock, Collection, Connectivity, DataAction, Event, EventName, FileKv, ManualClock,
    MemoryKv, OfflineConfig, SkipReason, SqliteAdapter, SyncAction, SyncRun, SyncStatus,
    TraceOffline, Transport, TransportError,
};

/// Transport that fails the ids it is told to and records everything sent.
#[derive(Default)]
struct MockTransport {
    fail: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    sent: Mutex<Vec<Value>>,
}

impl MockTransport {
    fn reject(&self, id: &str) {
        self.fail.lock().unwrap().insert(id.to_string());
    }

    fn drop_connection_on(&self, id: &str) {
        self.unreachable.lock().unwrap().insert(id.to_string());
    }

    fn heal(&self) {
        self.fail.lock().unwrap().clear();
        self.unreachable.lock().unwrap().clear();
    }

    fn sent_ids(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap().to_string())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post_json(&self, _endpoint: &str, body: &Value) -> Result<Value, TransportError> {
        self.sent.lock().unwrap().push(body.clone());
        let id = body["id"].as_str().unwrap_or_default();
        if self.unreachable.lock().unwrap().contains(id) {
            return Err(TransportError::Connect("connection reset".into()));
        }
        if self.fail.lock().unwrap().contains(id) {
            return Err(TransportError::Status(422));
        }
        Ok(json!({"success": true}))
    }
}

struct Setup {
    offline: TraceOffline,
    transport: Arc<MockTransport>,
    clock: Arc<ManualClock>,
}

async fn sqlite_setup(online: bool) -> Setup {
    let transport = Arc::new(MockTransport::default());
    let clock = Arc::new(ManualClock::new(1_706_745_600_000));
    let offline = TraceOffline::builder(OfflineConfig::default())
        .adapter(Arc::new(SqliteAdapter::in_memory().await.unwrap()))
        .transport(transport.clone())
        .clock(clock.clone())
        .connectivity(Connectivity::new(online))
        .build()
        .await
        .unwrap();
    Setup {
        offline,
        transport,
        clock,
    }
}

fn kv_config() -> OfflineConfig {
    OfflineConfig {
        use_structured_store: false,
        ..OfflineConfig::default()
    }
}

// ============================================================================
// Persistence
// ============================================================================

#[tokio::test]
async fn trace_round_trip_on_sqlite() {
    let Setup { offline, clock, .. } = sqlite_setup(false).await;
    assert_eq!(offline.backend_kind(), BackendKind::Structured);

    let result = offline
        .save_trace_record(None, json!({"lot": "A-17", "weightKg": 12.5}))
        .await;
    assert!(result.success);
    let id = result.id.unwrap();
    assert_eq!(id, format!("trace_{}", clock.now_millis()));

    let record = offline.get_trace_record(&id).await.unwrap();
    assert_eq!(record.data, json!({"lot": "A-17", "weightKg": 12.5}));
    assert!(!record.synced);
    assert_eq!(record.synced_at, None);
}

#[tokio::test]
async fn drafts_never_enqueue() {
    let Setup { offline, .. } = sqlite_setup(false).await;

    let saved = offline.save_draft(Some("form-1"), json!({"step": 2})).await;
    assert!(saved.success);
    assert_eq!(offline.get_draft("form-1").await.unwrap().data, json!({"step": 2}));
    assert_eq!(offline.list_drafts().await.len(), 1);
    assert!(offline.delete_draft("form-1").await);
    assert!(offline.get_draft("form-1").await.is_none());

    assert_eq!(offline.pending_count(), 0);
}

#[tokio::test]
async fn documents_are_local_only() {
    let Setup { offline, .. } = sqlite_setup(false).await;

    assert!(offline
        .save_document(Collection::Templates, Some("tpl"), json!({"fields": ["lot"]}))
        .await
        .success);
    assert!(offline
        .save_document(Collection::Products, None, json!({"sku": "X1"}))
        .await
        .success);
    assert!(!offline
        .save_document(Collection::Traces, Some("t"), json!({}))
        .await
        .success);

    assert_eq!(offline.list_documents(Collection::Products).await.len(), 1);
    assert!(offline.delete_document(Collection::Templates, "tpl").await);
    assert_eq!(offline.pending_count(), 0);
}

#[tokio::test]
async fn delete_queues_a_delete_item() {
    let Setup { offline, .. } = sqlite_setup(false).await;
    offline.save_trace_record(Some("t1"), json!({})).await;

    assert!(offline.delete_trace_record("t1").await);
    assert!(!offline.delete_trace_record("t1").await);

    let actions: Vec<_> = offline.pending_items().iter().map(|i| i.action).collect();
    assert_eq!(actions, vec![SyncAction::Create, SyncAction::Delete]);
}

#[tokio::test]
async fn data_updated_events() {
    let Setup { offline, .. } = sqlite_setup(false).await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    offline.add_event_listener(EventName::DataUpdated, move |event| {
        if let Event::DataUpdated { collection, id, action } = event {
            sink.lock().unwrap().push((*collection, id.clone(), *action));
        }
    });

    offline.save_trace_record(Some("t1"), json!({})).await;
    offline.save_draft(Some("d1"), json!({})).await;
    offline.delete_trace_record("t1").await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (Collection::Traces, "t1".to_string(), DataAction::Saved),
            (Collection::Drafts, "d1".to_string(), DataAction::Saved),
            (Collection::Traces, "t1".to_string(), DataAction::Deleted),
        ]
    );
}

// ============================================================================
// Offline save, later sync
// ============================================================================

#[tokio::test]
async fn offline_save_enqueues_without_network() {
    let Setup {
        offline, transport, ..
    } = sqlite_setup(false).await;

    let result = offline.save_trace_record(Some("t1"), json!({"lot": 1})).await;
    assert!(result.success);
    assert_eq!(offline.pending_count(), 1);

    let items = offline.pending_items();
    let item = &items[0];
    assert_eq!(item.kind, "trace");
    assert_eq!(item.action, SyncAction::Create);
    assert_eq!(item.id, "t1");

    assert_eq!(
        offline.sync_data().await,
        SyncRun::Skipped {
            reason: SkipReason::Offline
        }
    );
    assert!(transport.sent_ids().is_empty());
}

#[tokio::test]
async fn reconnect_then_sync_marks_records() {
    let Setup {
        offline,
        transport,
        clock,
    } = sqlite_setup(false).await;
    offline.save_trace_record(Some("t1"), json!({})).await;
    clock.advance(10);
    offline.save_trace_record(Some("t2"), json!({})).await;

    offline.set_online(true);
    clock.advance(1_000);
    let run = offline.sync_data().await;

    let report = run.report().unwrap();
    assert_eq!((report.total, report.success, report.failed), (2, 2, 0));
    assert_eq!(transport.sent_ids(), vec!["t1", "t2"]);
    assert_eq!(offline.pending_count(), 0);

    let synced = offline.get_trace_record("t2").await.unwrap();
    assert!(synced.synced);
    assert_eq!(synced.synced_at, Some(clock.now_millis()));
}

#[tokio::test]
async fn failed_item_retried_next_run() {
    let Setup {
        offline, transport, ..
    } = sqlite_setup(true).await;
    transport.reject("t2");
    for id in ["t1", "t2", "t3"] {
        offline.save_trace_record(Some(id), json!({})).await;
    }

    let first = offline.sync_data().await;
    assert_eq!(first.report().unwrap().failed, 1);
    assert_eq!(offline.pending_items()[0].id, "t2");

    transport.heal();
    let second = offline.sync_data().await;
    assert_eq!(second.report().unwrap().success, 1);
    assert_eq!(offline.pending_count(), 0);
}

#[tokio::test]
async fn connectivity_failure_leaves_rest_queued() {
    let Setup {
        offline, transport, ..
    } = sqlite_setup(true).await;
    transport.drop_connection_on("t2");
    for id in ["t1", "t2", "t3"] {
        offline.save_trace_record(Some(id), json!({})).await;
    }

    let run = offline.sync_data().await;
    assert!(run.report().unwrap().aborted);
    assert_eq!(transport.sent_ids(), vec!["t1", "t2"]);

    let pending: Vec<_> = offline.pending_items().into_iter().map(|i| i.id).collect();
    assert_eq!(pending, vec!["t2", "t3"]);
    assert!(!offline.get_trace_record("t3").await.unwrap().synced);
}

#[tokio::test]
async fn sync_status_reports_partial_failure() {
    let Setup {
        offline, transport, ..
    } = sqlite_setup(true).await;
    transport.reject("t1");
    offline.save_trace_record(Some("t1"), json!({})).await;
    offline.save_trace_record(Some("t2"), json!({})).await;

    let last = Arc::new(Mutex::new(None));
    let sink = last.clone();
    offline.add_event_listener(EventName::SyncStatus, move |event| {
        if let Event::SyncStatus(status) = event {
            *sink.lock().unwrap() = Some(*status);
        }
    });

    offline.sync_data().await;
    assert_eq!(
        *last.lock().unwrap(),
        Some(SyncStatus::Completed {
            total: 2,
            success: 1,
            failed: 1
        })
    );
}

#[tokio::test]
async fn queue_keeps_newest_when_full() {
    let transport = Arc::new(MockTransport::default());
    let offline = TraceOffline::builder(OfflineConfig {
        max_queue_size: 3,
        ..kv_config()
    })
    .transport(transport.clone())
    .connectivity(Connectivity::new(false))
    .build()
    .await
    .unwrap();

    for n in 0..5 {
        offline.save_trace_record(Some(&format!("t{n}")), json!({})).await;
    }
    let pending: Vec<_> = offline.pending_items().into_iter().map(|i| i.id).collect();
    assert_eq!(pending, vec!["t2", "t3", "t4"]);

    // Records themselves are never evicted, only their queue entries.
    assert_eq!(offline.list_trace_records().await.len(), 5);
}

// ============================================================================
// Storage fallback and durability
// ============================================================================

#[tokio::test]
async fn unopenable_database_falls_back_to_key_value() {
    let offline = TraceOffline::builder(OfflineConfig {
        database_url: "sqlite:/nonexistent-dir/deeper/trace.db".into(),
        ..OfflineConfig::default()
    })
    .connectivity(Connectivity::new(false))
    .build()
    .await
    .unwrap();

    assert_eq!(offline.backend_kind(), BackendKind::KeyValue);
    assert!(offline.save_trace_record(Some("t1"), json!({})).await.success);
    assert!(offline.get_trace_record("t1").await.is_some());
}

#[tokio::test]
async fn file_backend_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let offline = TraceOffline::builder(kv_config())
            .key_value(Arc::new(FileKv::open(dir.path()).unwrap()))
            .connectivity(Connectivity::new(false))
            .build()
            .await
            .unwrap();
        offline.save_trace_record(Some("t1"), json!({"lot": 9})).await;
        offline.save_draft(Some("d1"), json!({})).await;
    }

    let transport = Arc::new(MockTransport::default());
    let offline = TraceOffline::builder(kv_config())
        .key_value(Arc::new(FileKv::open(dir.path()).unwrap()))
        .transport(transport.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(offline.pending_count(), 1);
    assert_eq!(offline.get_trace_record("t1").await.unwrap().data["lot"], 9);
    assert!(offline.get_draft("d1").await.is_some());

    offline.sync_data().await;
    assert_eq!(transport.sent_ids(), vec!["t1"]);
}

#[tokio::test]
async fn sqlite_file_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("trace.db").display());
    let kv = MemoryKv::new_shared();

    {
        let offline = TraceOffline::builder(OfflineConfig {
            database_url: url.clone(),
            ..OfflineConfig::default()
        })
        .key_value(kv.clone())
        .connectivity(Connectivity::new(false))
        .build()
        .await
        .unwrap();
        assert_eq!(offline.backend_kind(), BackendKind::Structured);
        offline.save_trace_record(Some("t1"), json!({"lot": 3})).await;
    }

    let offline = TraceOffline::builder(OfflineConfig {
        database_url: url,
        ..OfflineConfig::default()
    })
    .key_value(kv)
    .connectivity(Connectivity::new(false))
    .build()
    .await
    .unwrap();
    assert_eq!(offline.list_trace_records().await.len(), 1);
    assert_eq!(offline.pending_count(), 1);
}

#[tokio::test]
async fn instances_are_independent() {
    let a = TraceOffline::builder(kv_config())
        .connectivity(Connectivity::new(false))
        .build()
        .await
        .unwrap();
    let b = TraceOffline::builder(kv_config())
        .connectivity(Connectivity::new(false))
        .build()
        .await
        .unwrap();

    a.save_trace_record(Some("only-a"), json!({})).await;
    assert_eq!(a.pending_count(), 1);
    assert_eq!(b.pending_count(), 0);
    assert!(b.get_trace_record("only-a").await.is_none());
}

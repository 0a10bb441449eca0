//! Drains the sync queue against the remote endpoint.

use super::{Connectivity, SyncItem, SyncQueue, Transport, TransportError};
use crate::events::{Event, EventBus, SyncStatus};
use crate::notify::{Notifier, NotifyLevel};
use crate::persistence::Persistence;
use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Why a sync request did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkipReason {
    Offline,
    EmptyQueue,
}

/// Result of delivering one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    pub id: RecordId,
    pub timestamp: Timestamp,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Items in the run's snapshot
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// The run stopped before attempting every item
    pub aborted: bool,
    pub results: Vec<ItemOutcome>,
}

impl SyncReport {
    /// Items the run never attempted.
    pub fn skipped(&self) -> usize {
        self.total - self.success - self.failed
    }
}

/// What a call to [`Synchronizer::sync_data`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SyncRun {
    Skipped { reason: SkipReason },
    Completed(SyncReport),
}

impl SyncRun {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncRun::Completed(report) => Some(report),
            SyncRun::Skipped { .. } => None,
        }
    }
}

/// Delivers queued items one at a time, oldest first.
pub struct Synchronizer {
    queue: Arc<SyncQueue>,
    persistence: Arc<Persistence>,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    events: Arc<EventBus>,
    notifier: Arc<dyn Notifier>,
    endpoint: String,
    // One run at a time; a second caller waits and then sees the drained queue.
    run_lock: Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        queue: Arc<SyncQueue>,
        persistence: Arc<Persistence>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
        events: Arc<EventBus>,
        notifier: Arc<dyn Notifier>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            persistence,
            transport,
            connectivity,
            events,
            notifier,
            endpoint: endpoint.into(),
            run_lock: Mutex::new(()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Push every queued item to the server.
    ///
    /// Items enqueued while the run is in progress wait for the next run. A
    /// rejected item stays queued and the run moves on; a connectivity
    /// failure stops the run and leaves the rest queued.
    pub async fn sync_data(&self) -> SyncRun {
        let _run = self.run_lock.lock().await;

        if !self.connectivity.is_online() {
            return SyncRun::Skipped {
                reason: SkipReason::Offline,
            };
        }

        let snapshot = self.queue.snapshot();
        if snapshot.is_empty() {
            return SyncRun::Skipped {
                reason: SkipReason::EmptyQueue,
            };
        }

        let total = snapshot.len();
        tracing::info!(pending = total, endpoint = %self.endpoint, "sync started");
        self.emit(SyncStatus::Syncing { count: total });

        let mut report = SyncReport {
            total,
            ..SyncReport::default()
        };

        for (index, item) in snapshot.iter().enumerate() {
            if !self.connectivity.is_online() {
                tracing::info!(remaining = total - index, "went offline, stopping sync");
                report.aborted = true;
                break;
            }

            match self.deliver(item).await {
                Ok(()) => {
                    report.success += 1;
                    report.results.push(ItemOutcome {
                        id: item.id.clone(),
                        timestamp: item.timestamp,
                        success: true,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(id = %item.id, action = ?item.action, error = %e, "sync item failed");
                    report.failed += 1;
                    report.results.push(ItemOutcome {
                        id: item.id.clone(),
                        timestamp: item.timestamp,
                        success: false,
                        error: Some(e.to_string()),
                    });

                    if e.is_connectivity() || !self.connectivity.is_online() {
                        report.aborted = true;
                        self.emit(SyncStatus::Progress {
                            processed: index + 1,
                            total,
                        });
                        break;
                    }
                }
            }

            self.emit(SyncStatus::Progress {
                processed: index + 1,
                total,
            });
        }

        self.emit(SyncStatus::Completed {
            total,
            success: report.success,
            failed: report.failed,
        });
        tracing::info!(
            total,
            success = report.success,
            failed = report.failed,
            aborted = report.aborted,
            "sync completed"
        );
        self.report_to_user(&report);

        SyncRun::Completed(report)
    }

    async fn deliver(&self, item: &SyncItem) -> Result<(), TransportError> {
        let body =
            serde_json::to_value(item).map_err(|e| TransportError::Request(e.to_string()))?;
        self.transport.post_json(&self.endpoint, &body).await?;

        self.queue.remove(item.timestamp);
        // A later create for the same id means the stored record already
        // holds data this acknowledgement does not cover.
        if item.is_trace_create() && !self.queue.has_pending_create(&item.kind, &item.id) {
            self.persistence.mark_trace_synced(&item.id).await;
        }
        Ok(())
    }

    fn emit(&self, status: SyncStatus) {
        self.events.dispatch(&Event::SyncStatus(status));
    }

    fn report_to_user(&self, report: &SyncReport) {
        if report.failed > 0 {
            self.notifier.notify(
                &format!(
                    "Sync partially completed: {} of {} items failed",
                    report.failed, report.total
                ),
                NotifyLevel::Warning,
            );
        } else if report.success > 0 {
            self.notifier.notify(
                &format!("Synced {} items", report.success),
                NotifyLevel::Success,
            );
        }
    }
}

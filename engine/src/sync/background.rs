//! Periodic and on-demand sync driver.

use super::{Connectivity, SyncScheduler, Synchronizer};
use crate::events::{Event, EventBus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Handle to the running sync loop.
///
/// The loop syncs on start, on every interval tick, whenever new work is
/// scheduled and whenever the device comes back online. Dropping the handle
/// stops the loop after its current run.
pub struct BackgroundSync {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSync {
    pub fn spawn(
        synchronizer: Arc<Synchronizer>,
        scheduler: Arc<SyncScheduler>,
        connectivity: Connectivity,
        events: Arc<EventBus>,
        period: Duration,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut online_rx = connectivity.subscribe();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(period_ms = period.as_millis() as u64, "background sync started");

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                    _ = scheduler.requested() => {}
                    changed = online_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *online_rx.borrow_and_update();
                        events.dispatch(&Event::Connectivity { online });
                        if !online {
                            continue;
                        }
                    }
                }

                let run = synchronizer.sync_data().await;
                tracing::trace!(?run, "background sync pass finished");
            }

            tracing::debug!("background sync stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "background sync task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for BackgroundSync {
    fn drop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for BackgroundSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSync")
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventName;
    use crate::persistence::Persistence;
    use crate::storage::{KeyValueAdapter, MemoryKv};
    use crate::sync::{SyncQueue, Transport, TransportError};
    use crate::{ManualClock, TracingNotifier};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingTransport {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn post_json(&self, _: &str, _: &Value) -> Result<Value, TransportError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"success": true}))
        }
    }

    struct Harness {
        persistence: Arc<Persistence>,
        queue: Arc<SyncQueue>,
        scheduler: Arc<SyncScheduler>,
        connectivity: Connectivity,
        events: Arc<EventBus>,
        transport: Arc<CountingTransport>,
        synchronizer: Arc<Synchronizer>,
    }

    fn harness(online: bool) -> Harness {
        let clock = Arc::new(ManualClock::new(1));
        let kv = MemoryKv::new_shared();
        let connectivity = Connectivity::new(online);
        let queue = Arc::new(SyncQueue::load(10, "q", vec![kv.clone()], clock.clone()));
        let scheduler = Arc::new(SyncScheduler::new(connectivity.clone()));
        let events = EventBus::new_shared();
        let persistence = Arc::new(Persistence::new(
            Arc::new(KeyValueAdapter::new(kv, "bg")),
            queue.clone(),
            scheduler.clone(),
            events.clone(),
            clock,
        ));
        let transport = Arc::new(CountingTransport::default());
        let synchronizer = Arc::new(Synchronizer::new(
            queue.clone(),
            persistence.clone(),
            transport.clone(),
            connectivity.clone(),
            events.clone(),
            Arc::new(TracingNotifier),
            "http://sync.test",
        ));
        Harness {
            persistence,
            queue,
            scheduler,
            connectivity,
            events,
            transport,
            synchronizer,
        }
    }

    fn spawn(h: &Harness, period: Duration) -> BackgroundSync {
        BackgroundSync::spawn(
            h.synchronizer.clone(),
            h.scheduler.clone(),
            h.connectivity.clone(),
            h.events.clone(),
            period,
        )
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn save_triggers_sync() {
        let h = harness(true);
        let bg = spawn(&h, Duration::from_secs(3600));

        h.persistence.save_trace_record(Some("t1"), json!({})).await;
        wait_until(|| h.queue.is_empty()).await;
        assert_eq!(h.transport.posts.load(Ordering::SeqCst), 1);

        bg.stop().await;
    }

    #[tokio::test]
    async fn reconnect_dispatches_event_and_syncs() {
        let h = harness(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        h.events.add_event_listener(EventName::Connectivity, move |event| {
            if let Event::Connectivity { online } = event {
                sink.lock().unwrap().push(*online);
            }
        });

        let bg = spawn(&h, Duration::from_secs(3600));
        h.persistence.save_trace_record(Some("t1"), json!({})).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.queue.len(), 1);

        h.connectivity.set_online(true);
        wait_until(|| h.queue.is_empty()).await;
        assert_eq!(*seen.lock().unwrap(), vec![true]);

        bg.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn interval_tick_syncs() {
        let h = harness(true);
        // Queue while nobody is listening so only the timer can pick it up.
        h.queue.enqueue(crate::sync::SyncItem::create("trace", "t1", json!({})));

        let bg = spawn(&h, Duration::from_secs(60));
        // First tick is immediate.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(h.queue.is_empty());

        h.queue.enqueue(crate::sync::SyncItem::create("trace", "t2", json!({})));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(h.queue.is_empty());
        assert_eq!(h.transport.posts.load(Ordering::SeqCst), 2);

        bg.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_loop() {
        let h = harness(true);
        let bg = spawn(&h, Duration::from_secs(3600));
        assert!(bg.is_running());
        bg.stop().await;

        h.queue.enqueue(crate::sync::SyncItem::create("trace", "late", json!({})));
        h.scheduler.schedule_sync();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.queue.len(), 1);
    }
}

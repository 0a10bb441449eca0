//! Sync queue, transport and the synchronizer that drains one into the other.

mod background;
mod connectivity;
mod queue;
mod synchronizer;
mod transport;

pub use background::BackgroundSync;
pub use connectivity::Connectivity;
pub use queue::{SyncAction, SyncItem, SyncQueue};
pub use synchronizer::{ItemOutcome, SkipReason, SyncReport, SyncRun, Synchronizer};
pub use transport::{HttpTransport, Transport, TransportError};

use tokio::sync::Notify;

/// Wakes the background sync loop when new work is queued.
///
/// Requests made while no loop is waiting are remembered (one permit), so a
/// loop that is mid-run syncs again once it finishes.
#[derive(Debug)]
pub struct SyncScheduler {
    notify: Notify,
    connectivity: Connectivity,
}

impl SyncScheduler {
    pub fn new(connectivity: Connectivity) -> Self {
        Self {
            notify: Notify::new(),
            connectivity,
        }
    }

    /// Ask for a sync run if the device is online. Returns whether a run was
    /// requested.
    pub fn schedule_sync(&self) -> bool {
        if !self.connectivity.is_online() {
            return false;
        }
        self.notify.notify_one();
        true
    }

    pub(crate) async fn requested(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn schedule_only_when_online() {
        let connectivity = Connectivity::new(false);
        let scheduler = SyncScheduler::new(connectivity.clone());
        assert!(!scheduler.schedule_sync());

        connectivity.set_online(true);
        assert!(scheduler.schedule_sync());

        // The stored permit wakes the next waiter immediately.
        tokio::time::timeout(Duration::from_secs(1), scheduler.requested())
            .await
            .unwrap();
    }
}

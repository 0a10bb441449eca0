//! # Trace Offline
//!
//! Offline persistence and background sync for a food-traceability client,
//! plus an observable state store for UI state.
//!
//! Records are written locally first. Every trace mutation is appended to a
//! bounded, durably mirrored queue, and a synchronizer drains that queue to
//! a remote endpoint whenever the device is online.
//!
//! ## Design Principles
//!
//! - **Local first**: saves never wait on the network
//! - **Never throws at the boundary**: storage and network failures come back
//!   as `SaveResult`, `None`, `false` or failure-carrying events
//! - **Injected capabilities**: storage, transport, clock, connectivity and
//!   notifications are all traits or handles passed in at construction
//! - **No globals**: [`TraceOffline`] and [`StateStore`] are plain values
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! - [`TraceRecord`] - synced to the server; `synced` flips once the server
//!   acknowledges it
//! - [`Draft`] - local-only work in progress (also used for templates and
//!   products)
//!
//! ### Storage
//!
//! [`StorageAdapter`] has two implementations: [`SqliteAdapter`] (preferred)
//! and [`KeyValueAdapter`] over any [`KeyValueBackend`]. If SQLite cannot be
//! opened the key/value adapter serves the rest of the session.
//!
//! ### Sync
//!
//! - [`SyncQueue`] - FIFO of [`SyncItem`]s, capped; the oldest item is
//!   dropped when full
//! - [`Synchronizer`] - sends items one at a time, oldest first, removing each
//!   on success and stopping early on connectivity failures
//! - [`BackgroundSync`] - runs the synchronizer on a timer, on reconnect and
//!   whenever work is queued
//!
//! ### Events
//!
//! [`EventBus`] delivers `connectivity`, `syncstatus` and `dataupdated`
//! events. A panicking listener is logged and skipped.
//!
//! ### State Store
//!
//! [`StateStore`] holds a JSON tree addressed by dotted paths, with per-key
//! and wildcard subscriptions, a bounded change log, snapshot/restore and
//! interval auto-save.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trace_offline::{Connectivity, EventName, OfflineConfig, TraceOffline};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), trace_offline::ConfigError> {
//! let offline = TraceOffline::builder(OfflineConfig::default())
//!     .connectivity(Connectivity::new(true))
//!     .build()
//!     .await?;
//!
//! offline.add_event_listener(EventName::SyncStatus, |event| {
//!     println!("{event:?}");
//! });
//!
//! let background = offline.start();
//! let saved = offline
//!     .save_trace_record(None, json!({"lot": "A-17", "crop": "corn"}))
//!     .await;
//! assert!(saved.success);
//!
//! background.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod notify;
pub mod offline;
pub mod persistence;
pub mod record;
pub mod state;
pub mod storage;
pub mod sync;

// Re-export main types at crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, OfflineConfig, StoreConfig};
pub use error::{Error, Result};
pub use events::{DataAction, Event, EventBus, EventCallback, EventName, SyncStatus};
pub use notify::{Notifier, NotifyLevel, TracingNotifier};
pub use offline::{TraceOffline, TraceOfflineBuilder};
pub use persistence::{select_adapter, Persistence, SaveResult, TRACE_ITEM_TYPE};
pub use record::{generate_id, Collection, Draft, TraceRecord};
pub use state::{ChangeEntry, ChangeKind, ChangeMeta, StateStore, StoreListener, WILDCARD};
pub use storage::{
    BackendKind, FileKv, KeyValueAdapter, KeyValueBackend, MemoryKv, SqliteAdapter,
    StorageAdapter,
};
pub use sync::{
    BackgroundSync, Connectivity, HttpTransport, ItemOutcome, SkipReason, SyncAction, SyncItem,
    SyncQueue, SyncReport, SyncRun, SyncScheduler, Synchronizer, Transport, TransportError,
};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type Timestamp = u64;
pub type ListenerId = u64;

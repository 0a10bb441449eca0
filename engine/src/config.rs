//! Configuration for the offline layer and the state store.
//!
//! Both structs deserialize from partial camelCase JSON; missing fields keep
//! their defaults.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Configuration for persistence, the sync queue and the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OfflineConfig {
    /// URL the synchronizer POSTs queued items to
    pub sync_endpoint: String,
    /// Maximum number of pending sync items before the oldest is dropped
    pub max_queue_size: usize,
    /// Period of the background sync timer
    pub sync_interval_ms: u64,
    /// Prefer the structured (SQLite) store over the key/value store
    pub use_structured_store: bool,
    /// Location of the structured store
    pub database_url: String,
    /// Prefix for every key written to the key/value backend
    pub namespace: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            sync_endpoint: "http://localhost:3000/api/sync".to_string(),
            max_queue_size: 100,
            sync_interval_ms: 60_000,
            use_structured_store: true,
            database_url: "sqlite:trace_offline.db".to_string(),
            namespace: "trace_offline".to_string(),
        }
    }
}

impl OfflineConfig {
    /// Load configuration from environment variables over the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let sync_endpoint = env::var("TRACE_SYNC_ENDPOINT").unwrap_or(defaults.sync_endpoint);

        let max_queue_size = match env::var("TRACE_MAX_QUEUE_SIZE") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidQueueSize)?,
            Err(_) => defaults.max_queue_size,
        };

        let sync_interval_ms = match env::var("TRACE_SYNC_INTERVAL_MS") {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidSyncInterval)?,
            Err(_) => defaults.sync_interval_ms,
        };

        let use_structured_store = match env::var("TRACE_USE_STRUCTURED_STORE") {
            Ok(v) => parse_flag(&v).ok_or(ConfigError::InvalidFlag("TRACE_USE_STRUCTURED_STORE"))?,
            Err(_) => defaults.use_structured_store,
        };

        let database_url = env::var("TRACE_DATABASE_URL").unwrap_or(defaults.database_url);

        let config = Self {
            sync_endpoint,
            max_queue_size,
            sync_interval_ms,
            use_structured_store,
            database_url,
            namespace: defaults.namespace,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a (possibly partial) JSON document over the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Period of the background sync timer.
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    /// Reject settings the queue and timer cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidQueueSize);
        }
        if self.sync_interval_ms == 0 {
            return Err(ConfigError::InvalidSyncInterval);
        }
        Ok(())
    }
}

/// Configuration for the observable state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreConfig {
    /// Key the state is persisted under
    pub storage_key: String,
    /// Period of the auto-save timer
    pub auto_save_interval_ms: u64,
    pub auto_save_enabled: bool,
    /// Top-level keys to persist; empty means the whole state
    pub persistent_keys: Vec<String>,
    /// Record a change-log entry for every mutation
    pub log_changes: bool,
    pub max_log_length: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            storage_key: "trace_store".to_string(),
            auto_save_interval_ms: 5_000,
            auto_save_enabled: true,
            persistent_keys: Vec::new(),
            log_changes: true,
            max_log_length: 100,
        }
    }
}

impl StoreConfig {
    /// Parse a (possibly partial) JSON document over the defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_millis(self.auto_save_interval_ms.max(1))
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max queue size must be a positive integer")]
    InvalidQueueSize,

    #[error("sync interval must be a positive number of milliseconds")]
    InvalidSyncInterval,

    #[error("{0} must be a boolean flag")]
    InvalidFlag(&'static str),

    #[error("malformed configuration: {0}")]
    Malformed(String),
}

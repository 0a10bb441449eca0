//! User-facing notifications.
//!
//! The host decides how a notification is shown (toast, banner, log line);
//! the engine only says what and how serious.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyLevel {
    Info,
    Success,
    Warning,
    Error,
}

/// Sink for unobtrusive user notifications.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, level: NotifyLevel);
}

/// Notifier that writes to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: &str, level: NotifyLevel) {
        match level {
            NotifyLevel::Info | NotifyLevel::Success => tracing::info!(%message, ?level, "notify"),
            NotifyLevel::Warning => tracing::warn!(%message, "notify"),
            NotifyLevel::Error => tracing::error!(%message, "notify"),
        }
    }
}

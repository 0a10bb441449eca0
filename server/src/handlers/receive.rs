//! Receive handler - applies one sync item posted by a client queue.

use crate::error::{AppError, Result};
use crate::records::{ApplyOutcome, RecordStore};
use serde::{Deserialize, Serialize};
use trace_offline::{SyncAction, Timestamp};

/// Request body: one queued mutation, as the client's queue stores it.
///
/// `action` is kept as a string so an unknown action is a 400 rather than a
/// body-deserialization failure.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingItem {
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    pub id: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    pub timestamp: Timestamp,
}

/// Acknowledgement returned for an accepted item.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub success: bool,
    pub receipt_id: String,
    pub received_at: String,
    /// False when a newer write for the same record had already arrived
    pub applied: bool,
}

fn parse_action(action: &str) -> Result<SyncAction> {
    serde_json::from_value(serde_json::Value::String(action.to_string()))
        .map_err(|_| AppError::UnsupportedAction(action.to_string()))
}

/// Validate and apply an incoming item.
pub fn handle_item(records: &RecordStore, item: IncomingItem) -> Result<Receipt> {
    if item.id.is_empty() {
        return Err(AppError::BadRequest("id must not be empty".to_string()));
    }
    if item.kind.is_empty() {
        return Err(AppError::BadRequest("type must not be empty".to_string()));
    }
    let action = parse_action(&item.action)?;
    if action != SyncAction::Delete && item.data.is_none() {
        return Err(AppError::BadRequest(format!(
            "{} requires data",
            item.action
        )));
    }

    let outcome = records.apply(&item.kind, &item.id, action, item.data, item.timestamp);
    let applied = outcome == ApplyOutcome::Applied;

    tracing::info!(
        kind = %item.kind,
        id = %item.id,
        action = ?action,
        timestamp = item.timestamp,
        applied,
        "sync item received"
    );

    Ok(Receipt {
        success: true,
        receipt_id: uuid::Uuid::new_v4().to_string(),
        received_at: chrono::Utc::now().to_rfc3339(),
        applied,
    })
}

//! List handler - serves the records received so far.

use crate::records::{RecordStore, StoredRecord};
use serde::{Deserialize, Serialize};

/// Query parameters for listing records.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Only records of this type
    #[serde(rename = "type")]
    pub kind: Option<String>,
    /// Maximum number of records to return
    pub limit: Option<usize>,
}

/// Response for a record listing.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub records: Vec<StoredRecord>,
    /// Live records matching the filter before `limit` was applied
    pub total: usize,
}

/// Default limit for listings.
const DEFAULT_LIMIT: usize = 100;

/// Maximum limit for listings.
const MAX_LIMIT: usize = 1000;

pub fn handle_list(records: &RecordStore, query: ListQuery) -> ListResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    let mut matching = records.list(query.kind.as_deref());
    let total = matching.len();
    matching.truncate(limit);

    ListResponse {
        records: matching,
        total,
    }
}

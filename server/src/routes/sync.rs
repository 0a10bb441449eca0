//! Sync endpoint routes.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    routing::{get, post},
    Json, Router,
};

use crate::error::Result;
use crate::handlers::{handle_item, handle_list, IncomingItem, ListQuery, ListResponse, Receipt};
use crate::AppState;

/// Create sync routes.
pub fn routes(sync_path: &str) -> Router<AppState> {
    Router::new()
        .route(sync_path, post(receive_handler))
        .route("/api/records", get(list_handler))
}

/// POST {sync_path} - Apply one queued item from a client.
async fn receive_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<IncomingItem>, JsonRejection>,
) -> Result<Json<Receipt>> {
    let Json(item) = body?;
    let receipt = handle_item(&state.records, item)?;
    Ok(Json(receipt))
}

/// GET /api/records - List records received so far.
async fn list_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Json<ListResponse> {
    Json(handle_list(&state.records, query))
}

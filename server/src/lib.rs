//! Trace Sync Server - reference endpoint for trace-offline clients.
//!
//! Accepts the sync items a client queue POSTs one at a time, applies them to
//! an in-memory record store and acknowledges each with a receipt.

pub mod config;
pub mod error;
pub mod handlers;
pub mod records;
mod routes;

use crate::config::Config;
use crate::records::RecordStore;
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<RecordStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            records: Arc::new(RecordStore::new()),
            config: Arc::new(config),
        }
    }
}

/// Build the router with tracing and permissive CORS.
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes(&state.config.sync_path))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

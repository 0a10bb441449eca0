//! HTTP route definitions.

mod health;
mod sync;

use crate::AppState;
use axum::Router;

/// Create all application routes.
pub fn create_routes(sync_path: &str) -> Router<AppState> {
    Router::new()
        .merge(health::routes())
        .merge(sync::routes(sync_path))
}

//! Axum Router Configuration

use crate::{relay::ws_handler, state::AppState};
use axum::{
    Router,
    routing::{any, get},
};
use std::sync::Arc;

/// Liveness probe.
async fn health() -> &'static str {
    "ok"
}

/// Creates the main Axum router for the gateway.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        // Any method, so every non-upgrade request gets the handler's 400.
        .route("/realtime", any(ws_handler))
        .route("/health", get(health))
        .with_state(app_state)
}

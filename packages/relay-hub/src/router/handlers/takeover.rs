//! Cooperative handoff endpoint.
//!
//! A newer process asks the current router to step aside. The response
//! is sent before shutdown actually begins so the requester always sees
//! the acceptance; the stop itself is scheduled by the router's
//! lifecycle task after a short delay.

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::info;

use super::AppState;

/// Accepts exactly one takeover; every later call (or any call once a
/// shutdown is already in motion) gets 409.
pub async fn takeover_handler(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let already_claimed = state.takeover_claimed.swap(true, Ordering::SeqCst);
    if already_claimed || state.shutdown.is_shutting_down() {
        return (
            StatusCode::CONFLICT,
            Json(json!({"error": "Already shutting down"})),
        );
    }

    let current_clients = state.registry.count();
    info!(current_clients, "takeover accepted, scheduling shutdown");

    // The lifecycle task applies the takeover delay before stopping; if it
    // is already gone a shutdown is in progress anyway.
    let _ = state.stop_requests.try_send("takeover".to_string());

    (
        StatusCode::OK,
        Json(json!({"status": "accepted", "currentClients": current_clients})),
    )
}

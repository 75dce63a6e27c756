//! Health endpoint for the control surface.
//!
//! Bootstrap probes this before deciding whether to start a router, so
//! the response shape is part of the election contract: `status: "ok"`
//! means a live router owns the port.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

/// Returns router status, uptime, and traffic metrics as JSON.
///
/// Always 200; the `status` field distinguishes a live router from one
/// that is starting or draining.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.metrics.snapshot(state.registry.count());

    let client_list: Vec<Value> = state
        .registry
        .connections()
        .iter()
        .map(|handle| {
            let info = handle.info.read();
            json!({
                "id": handle.id.wire(),
                "type": info.client_type,
                "name": info.name,
                "pid": info.pid,
                "version": info.version,
                "connectedFor": handle.connected_at.elapsed().as_millis() as u64,
                "isRouter": info.is_router,
                "pingLatency": info.ping_latency.map(|d| d.as_millis() as u64),
            })
        })
        .collect();

    Json(json!({
        "status": state.shutdown.state().as_status(),
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.start_time.elapsed().as_millis() as u64,
        "metrics": {
            "messagesRouted": snapshot.messages_routed,
            "clientsConnected": snapshot.clients_connected,
            "clientsDisconnected": snapshot.clients_disconnected,
            "errors": snapshot.errors,
            "currentClients": snapshot.current_clients,
            "clientList": client_list,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::handlers::test_state;
    use relay_core::messages::Identity;

    #[tokio::test]
    async fn reports_ok_once_ready() {
        let (state, _stop_rx) = test_state();
        state.shutdown.set_ready();

        let response = health_handler(State(state)).await;
        let body = response.0;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["uptime"].is_number());
        assert_eq!(body["metrics"]["currentClients"], 0);
    }

    #[tokio::test]
    async fn reports_starting_before_ready() {
        let (state, _stop_rx) = test_state();
        let response = health_handler(State(state)).await;
        assert_eq!(response.0["status"], "starting");
    }

    #[tokio::test]
    async fn reports_draining_during_shutdown() {
        let (state, _stop_rx) = test_state();
        state.shutdown.set_ready();
        state.shutdown.begin_shutdown();

        let response = health_handler(State(state)).await;
        assert_eq!(response.0["status"], "draining");
    }

    #[tokio::test]
    async fn client_list_reflects_identify_and_latency() {
        let (state, _stop_rx) = test_state();
        state.shutdown.set_ready();

        let (handle, _rx) = state.registry.register(&state.config.connection);
        handle.info.write().apply_identify(&Identity {
            client_type: Some("mcp".into()),
            name: Some("A".into()),
            pid: Some(77),
            ..Identity::default()
        });
        handle.mark_ping_sent();
        handle.mark_pong();

        let response = health_handler(State(state)).await;
        let list = &response.0["metrics"]["clientList"];
        assert_eq!(list.as_array().map(Vec::len), Some(1));
        assert_eq!(list[0]["id"], "client-1");
        assert_eq!(list[0]["type"], "mcp");
        assert_eq!(list[0]["name"], "A");
        assert_eq!(list[0]["pid"], 77);
        assert!(list[0]["pingLatency"].is_number());
        assert!(!list[0]["isRouter"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn ping_latency_null_until_first_pong() {
        let (state, _stop_rx) = test_state();
        let (_handle, _rx) = state.registry.register(&state.config.connection);

        let response = health_handler(State(state)).await;
        assert!(response.0["metrics"]["clientList"][0]["pingLatency"].is_null());
    }
}

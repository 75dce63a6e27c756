//! WebSocket session handler for the relay listener.
//!
//! Each accepted socket gets a write task draining its bounded outbound
//! channel, a liveness ping task, and a read loop that intercepts
//! control traffic and routes everything else. Malformed frames are
//! counted and logged; they never close the connection.

use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use relay_core::envelope::{unix_millis, Envelope};
use relay_core::messages::ControlMessage;
use relay_core::routing::{route, RouteDecision};
use tracing::{debug, warn};

use super::AppState;
use crate::router::connection::{ConnectionHandle, OutboundFrame};

/// Upgrades an HTTP connection to a relay WebSocket session.
///
/// Upgrades are refused once shutdown has begun.
pub async fn ws_upgrade_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

/// Serializes and broadcasts the current roster to every connection.
pub(crate) fn broadcast_roster(state: &AppState) {
    let roster = ControlMessage::Roster {
        clients: state.registry.roster(),
        timestamp: unix_millis(),
    };
    if let Ok(text) = serde_json::to_string(&roster) {
        state.registry.broadcast_text(&text);
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (handle, mut outbound_rx) = state.registry.register(&state.config.connection);
    let client_id = handle.id;
    let wire_id = client_id.wire();
    state.metrics.record_connect();
    debug!(client = %wire_id, "connection registered");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Write task: drains the bounded channel onto the socket.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let message = match frame {
                OutboundFrame::Text(text) => Message::Text(text.into()),
                OutboundFrame::Close(reason) => {
                    let close = Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    }));
                    let _ = ws_tx.send(close).await;
                    break;
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Liveness task: periodic protocol-level pings.
    let ping_handle = Arc::clone(&handle);
    let ping_interval = state.config.ping_interval;
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ping_interval);
        // The first tick fires immediately; skip it so a fresh connection
        // is not pinged before its welcome.
        interval.tick().await;
        loop {
            interval.tick().await;
            let ping = ControlMessage::Ping {
                timestamp: unix_millis(),
            };
            let Ok(text) = serde_json::to_string(&ping) else {
                continue;
            };
            ping_handle.mark_ping_sent();
            if !ping_handle.try_send(OutboundFrame::Text(text)) {
                break;
            }
        }
    });

    send_welcome(&handle);
    broadcast_roster(&state);

    while let Some(result) = ws_rx.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!(client = %wire_id, error = %err, "socket error, closing");
                break;
            }
        };
        match message {
            Message::Text(text) => handle_frame(&state, &handle, text.as_str()).await,
            Message::Close(_) => break,
            // Transport-level ping/pong is handled by the stack; the relay
            // protocol has its own.
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    if state.registry.remove(client_id).is_some() {
        state.metrics.record_disconnect();
        broadcast_roster(&state);
    }
    debug!(client = %wire_id, "connection closed");
    ping_task.abort();
    write_task.abort();
}

fn send_welcome(handle: &Arc<ConnectionHandle>) {
    let welcome = ControlMessage::Welcome {
        client_id: handle.id.wire(),
        timestamp: unix_millis(),
    };
    if let Ok(text) = serde_json::to_string(&welcome) {
        let _ = handle.try_send(OutboundFrame::Text(text));
    }
}

/// Processes one inbound text frame: control messages are consumed here,
/// everything else goes through the routing rules.
async fn handle_frame(state: &AppState, handle: &Arc<ConnectionHandle>, text: &str) {
    if let Ok(control) = serde_json::from_str::<ControlMessage>(text) {
        match control {
            ControlMessage::Identify(identity) => {
                handle.info.write().apply_identify(&identity);
                debug!(client = %handle.id.wire(), "identified");
                broadcast_roster(state);
            }
            ControlMessage::Pong { .. } => handle.mark_pong(),
            ControlMessage::Ping { .. } => {
                let pong = ControlMessage::Pong {
                    timestamp: unix_millis(),
                };
                if let Ok(reply) = serde_json::to_string(&pong) {
                    let _ = handle.try_send(OutboundFrame::Text(reply));
                }
            }
            // Router-originated message types arriving from a connection
            // are ignored.
            ControlMessage::Welcome { .. }
            | ControlMessage::Roster { .. }
            | ControlMessage::Shutdown { .. } => {}
        }
        return;
    }

    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            state.metrics.record_error();
            warn!(client = %handle.id.wire(), error = %err, "malformed frame dropped");
            return;
        }
    };

    let sender = handle.id.wire();
    let roster = state.registry.roster_peers();
    match route(&envelope, &sender, &roster, unix_millis()) {
        RouteDecision::Identify => {
            // Covered by the ControlMessage branch above; nothing to do
            // for an identify that failed to parse as one.
        }
        RouteDecision::Drop => {
            debug!(client = %sender, kind = %envelope.kind, "no recipients, dropped");
        }
        RouteDecision::Deliver {
            recipients,
            payload,
        } => {
            let Ok(text) = serde_json::to_string(&payload) else {
                state.metrics.record_error();
                return;
            };
            // A unicast names its one recipient, so it gets a bounded
            // wait on a full channel; fan-out stays non-blocking and
            // skips slow connections.
            let unicast = envelope.target_id.is_some();
            for recipient in recipients {
                let Some(target) = state.registry.resolve(&recipient) else {
                    continue;
                };
                if unicast {
                    let frame = OutboundFrame::Text(text.clone());
                    let timeout = state.config.connection.send_timeout;
                    if let Err(err) = target.send_timeout(frame, timeout).await {
                        warn!(client = %recipient, error = ?err, "unicast delivery failed");
                    }
                } else {
                    let _ = target.try_send(OutboundFrame::Text(text.clone()));
                }
            }
            state.metrics.record_routed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::router::handlers::test_state;
    use serde_json::Value;
    use std::time::Duration;

    fn recv_json(rx: &mut tokio::sync::mpsc::Receiver<OutboundFrame>) -> Value {
        match rx.try_recv() {
            Ok(OutboundFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identify_triggers_roster_broadcast() {
        let (state, _stop_rx) = test_state();
        let (h1, mut rx1) = state.registry.register(&state.config.connection);
        let (_h2, mut rx2) = state.registry.register(&state.config.connection);

        handle_frame(
            &state,
            &h1,
            r#"{"type":"identify","clientType":"mcp","name":"A"}"#,
        ).await;

        let roster = recv_json(&mut rx1);
        assert_eq!(roster["type"], "roster");
        let clients = roster["clients"].as_array().unwrap();
        assert!(clients
            .iter()
            .any(|c| c["type"] == "mcp" && c["name"] == "A"));
        // Every connection sees the broadcast
        assert_eq!(recv_json(&mut rx2)["type"], "roster");
    }

    #[tokio::test]
    async fn malformed_frame_counts_error_and_keeps_connection() {
        let (state, _stop_rx) = test_state();
        let (handle, _rx) = state.registry.register(&state.config.connection);

        handle_frame(&state, &handle, "{not json").await;

        assert_eq!(state.metrics.snapshot(1).errors, 1);
        assert_eq!(state.registry.count(), 1);
        assert!(handle.is_connected());
    }

    #[tokio::test]
    async fn unicast_reaches_only_target() {
        let (state, _stop_rx) = test_state();
        let (h1, mut rx1) = state.registry.register(&state.config.connection);
        let (_h2, mut rx2) = state.registry.register(&state.config.connection);
        let (_h3, mut rx3) = state.registry.register(&state.config.connection);

        handle_frame(
            &state,
            &h1,
            r#"{"type":"unicast","targetId":"client-2","data":{"x":1}}"#,
        ).await;

        let delivered = recv_json(&mut rx2);
        assert_eq!(delivered["x"], 1);
        assert_eq!(delivered["sender"], "client-1");
        assert!(rx1.try_recv().is_err());
        assert!(rx3.try_recv().is_err());
        assert_eq!(state.metrics.snapshot(3).messages_routed, 1);
    }

    #[tokio::test]
    async fn unicast_to_unknown_target_is_silent() {
        let (state, _stop_rx) = test_state();
        let (h1, mut rx1) = state.registry.register(&state.config.connection);

        handle_frame(
            &state,
            &h1,
            r#"{"type":"unicast","targetId":"client-404","data":{}}"#,
        ).await;

        assert!(rx1.try_recv().is_err());
        assert_eq!(state.metrics.snapshot(1).messages_routed, 0);
        assert_eq!(state.metrics.snapshot(1).errors, 0);
    }

    #[tokio::test]
    async fn multicast_respects_declared_type() {
        let (state, _stop_rx) = test_state();
        let (h1, _rx1) = state.registry.register(&state.config.connection);
        let (h2, mut rx2) = state.registry.register(&state.config.connection);
        let (_h3, mut rx3) = state.registry.register(&state.config.connection);

        handle_frame(&state, &h2, r#"{"type":"identify","clientType":"extension"}"#).await;
        // Drain h2's roster broadcast
        while rx2.try_recv().is_ok() {}
        while rx3.try_recv().is_ok() {}

        handle_frame(
            &state,
            &h1,
            r#"{"type":"multicast","targetType":"extension","data":{"cmd":"go"}}"#,
        ).await;

        let delivered = recv_json(&mut rx2);
        assert_eq!(delivered["cmd"], "go");
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn unicast_waits_for_channel_capacity() {
        let (state, _stop_rx) = test_state();
        let (h1, _rx1) = state.registry.register(&state.config.connection);
        let tight = ConnectionConfig {
            outbound_channel_capacity: 1,
            ..ConnectionConfig::default()
        };
        let (h2, mut rx2) = state.registry.register(&tight);
        assert!(h2.try_send(OutboundFrame::Text("first".into())));

        let deliver = tokio::spawn({
            let state = state.clone();
            async move {
                handle_frame(
                    &state,
                    &h1,
                    r#"{"type":"unicast","targetId":"client-2","data":{"x":1}}"#,
                )
                .await;
            }
        });

        // The delivery parks on the full channel instead of dropping.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!deliver.is_finished());

        // Draining one frame makes room; the unicast then lands.
        assert!(rx2.recv().await.is_some());
        deliver.await.unwrap();
        let delivered = recv_json(&mut rx2);
        assert_eq!(delivered["x"], 1);
        assert_eq!(delivered["sender"], "client-1");
    }

    #[tokio::test]
    async fn protocol_ping_gets_pong_reply() {
        let (state, _stop_rx) = test_state();
        let (handle, mut rx) = state.registry.register(&state.config.connection);

        handle_frame(&state, &handle, r#"{"type":"ping","timestamp":123}"#).await;

        let reply = recv_json(&mut rx);
        assert_eq!(reply["type"], "pong");
    }

    #[tokio::test]
    async fn pong_records_latency() {
        let (state, _stop_rx) = test_state();
        let (handle, _rx) = state.registry.register(&state.config.connection);
        handle.mark_ping_sent();

        handle_frame(&state, &handle, r#"{"type":"pong","timestamp":123}"#).await;

        assert!(handle.info.read().ping_latency.is_some());
    }

    #[tokio::test]
    async fn app_level_ping_request_is_routed_not_consumed() {
        // "ping" with an id but no timestamp is an application request,
        // not protocol liveness; it must reach the other connections.
        let (state, _stop_rx) = test_state();
        let (h1, _rx1) = state.registry.register(&state.config.connection);
        let (_h2, mut rx2) = state.registry.register(&state.config.connection);

        handle_frame(&state, &h1, r#"{"type":"ping","id":7}"#).await;

        let delivered = recv_json(&mut rx2);
        assert_eq!(delivered["type"], "ping");
        assert_eq!(delivered["id"], 7);
        assert_eq!(delivered["sender"], "client-1");
    }
}

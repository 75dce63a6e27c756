//! Peer-side connection to the router.
//!
//! Owns one WebSocket at a time and a reconnect loop: on loss the delay
//! doubles from the base up to the cap, and messages sent while offline
//! are buffered in a bounded drop-oldest queue that flushes after the
//! next successful identify.
//!
//! Inbound frames are disambiguated by the `sender` field: routed
//! payloads always carry one (the router injects it), control messages
//! never do.

use std::collections::VecDeque;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use relay_core::backoff::{delay_for_attempt, ConnEvent, PeerState};
use relay_core::envelope::unix_millis;
use relay_core::messages::{ControlMessage, Identity, RosterEntry};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;

/// Events emitted to the owner of a [`PeerConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Socket open, identify sent, offline queue flushed.
    Connected,
    /// The router assigned this connection an id.
    Welcome { client_id: String },
    /// Membership update.
    Roster(Vec<RosterEntry>),
    /// A routed application payload (always carries `sender`).
    Message(Value),
    /// The router announced a graceful shutdown.
    ShutdownNotice {
        reason: String,
        grace_period_ms: u64,
    },
    /// Connection lost; the reconnect loop takes over.
    Disconnected,
}

enum PeerCommand {
    Send(String),
    Shutdown,
}

/// Handle to the connection task.
///
/// Dropping the handle shuts the task down, since the command channel
/// closes.
pub struct PeerConnection {
    commands: mpsc::Sender<PeerCommand>,
    state: watch::Receiver<PeerState>,
    client_id: Arc<RwLock<Option<String>>>,
}

impl PeerConnection {
    /// Spawns the connection task. The returned receiver carries every
    /// [`PeerEvent`]; an owner that stops draining it will eventually
    /// stall the connection.
    #[must_use]
    pub fn connect(config: RelayConfig, identity: Identity) -> (Self, mpsc::Receiver<PeerEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.connection.outbound_channel_capacity);
        let (event_tx, event_rx) = mpsc::channel(config.connection.outbound_channel_capacity);
        let (state_tx, state_rx) = watch::channel(PeerState::Disconnected);
        let client_id = Arc::new(RwLock::new(None));

        tokio::spawn(run(
            config,
            identity,
            command_rx,
            event_tx,
            state_tx,
            Arc::clone(&client_id),
        ));

        (
            Self {
                commands: command_tx,
                state: state_rx,
                client_id,
            },
            event_rx,
        )
    }

    /// Queues a JSON value for sending. While disconnected it lands in
    /// the offline queue.
    ///
    /// # Errors
    ///
    /// [`RelayError::Closed`] once the connection task has exited.
    pub async fn send_json(&self, value: &Value) -> Result<(), RelayError> {
        let text = serde_json::to_string(value).map_err(|_| RelayError::Closed)?;
        self.send_text(text).await
    }

    /// Queues a pre-serialized frame.
    ///
    /// # Errors
    ///
    /// [`RelayError::Closed`] once the connection task has exited.
    pub async fn send_text(&self, text: String) -> Result<(), RelayError> {
        self.commands
            .send(PeerCommand::Send(text))
            .await
            .map_err(|_| RelayError::Closed)
    }

    /// Permanently tears the connection down. No reconnect follows.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(PeerCommand::Shutdown).await;
    }

    #[must_use]
    pub fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    /// Watch handle for state transitions, for callers that need to wait
    /// for `Connected`.
    #[must_use]
    pub fn state_watch(&self) -> watch::Receiver<PeerState> {
        self.state.clone()
    }

    /// The router-assigned id, once a welcome has arrived.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.client_id.read().clone()
    }
}

/// Bounded buffer for frames sent while disconnected. Overflow drops the
/// oldest entry.
struct OfflineQueue {
    frames: VecDeque<String>,
    capacity: usize,
}

impl OfflineQueue {
    fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, frame: String) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            warn!("offline queue full, dropped oldest frame");
        }
        self.frames.push_back(frame);
    }

    fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    /// Returns a frame taken by [`pop`](Self::pop) whose send failed; it
    /// goes back to the head so flush order is preserved on the next
    /// connection.
    fn requeue_front(&mut self, frame: String) {
        self.frames.push_front(frame);
    }

    fn len(&self) -> usize {
        self.frames.len()
    }
}

/// Classification of one inbound text frame.
#[derive(Debug)]
enum Inbound {
    /// Routed application payload; carries a router-injected `sender`.
    Routed(Value),
    Control(ControlMessage),
    /// Senderless and not a control message; passed through opaquely.
    Opaque(Value),
    Invalid,
}

fn classify_inbound(text: &str) -> Inbound {
    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return Inbound::Invalid;
    };
    if value.get("sender").is_some() {
        return Inbound::Routed(value);
    }
    match serde_json::from_value::<ControlMessage>(value.clone()) {
        Ok(control) => Inbound::Control(control),
        Err(_) => Inbound::Opaque(value),
    }
}

#[allow(clippy::too_many_lines)]
async fn run(
    config: RelayConfig,
    identity: Identity,
    mut commands: mpsc::Receiver<PeerCommand>,
    events: mpsc::Sender<PeerEvent>,
    state_tx: watch::Sender<PeerState>,
    client_id: Arc<RwLock<Option<String>>>,
) {
    let url = config.ws_url();
    let mut state = PeerState::Disconnected;
    let mut attempt: u32 = 0;
    let mut queue = OfflineQueue::new(config.connection.offline_queue_capacity);

    let mut transition = |state: &mut PeerState, event: ConnEvent| {
        *state = state.apply(event);
        let _ = state_tx.send(*state);
    };

    loop {
        transition(&mut state, ConnEvent::ConnectRequested);

        match connect_async(&url).await {
            Ok((mut ws, _response)) => {
                let identify = ControlMessage::Identify(identity.clone());
                let Ok(identify_text) = serde_json::to_string(&identify) else {
                    return;
                };
                if ws.send(Message::Text(identify_text.into())).await.is_err() {
                    transition(&mut state, ConnEvent::Failed);
                } else {
                    attempt = 0;
                    transition(&mut state, ConnEvent::Established);
                    info!(url = %url, "peer connected");

                    if queue.len() > 0 {
                        debug!(count = queue.len(), "flushing offline queue");
                    }
                    let mut flush_failed = false;
                    while let Some(frame) = queue.pop() {
                        if ws.send(Message::Text(frame.clone().into())).await.is_err() {
                            // The unsent frame stays queued for the next
                            // connection.
                            queue.requeue_front(frame);
                            flush_failed = true;
                            break;
                        }
                    }

                    if !flush_failed {
                        let _ = events.send(PeerEvent::Connected).await;
                        session(
                            &mut ws,
                            &mut commands,
                            &events,
                            &mut state,
                            &mut transition,
                            &mut queue,
                            &client_id,
                        )
                        .await;
                    }

                    if state == PeerState::ShuttingDown {
                        let _ = ws.close(None).await;
                        return;
                    }
                    transition(&mut state, ConnEvent::Lost);
                    let _ = events.send(PeerEvent::Disconnected).await;
                }
            }
            Err(err) => {
                transition(&mut state, ConnEvent::Failed);
                debug!(url = %url, error = %err, "connect failed");
            }
        }

        attempt += 1;
        let delay = delay_for_attempt(attempt, config.reconnect_base, config.reconnect_cap);
        warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");

        // During the backoff sleep, sends keep landing in the offline
        // queue and a shutdown still takes effect immediately.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(PeerCommand::Send(text)) => queue.push(text),
                    Some(PeerCommand::Shutdown) | None => {
                        transition(&mut state, ConnEvent::ShutdownRequested);
                        return;
                    }
                },
            }
        }
    }
}

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Pumps one established session until loss or shutdown.
async fn session(
    ws: &mut WsStream,
    commands: &mut mpsc::Receiver<PeerCommand>,
    events: &mpsc::Sender<PeerEvent>,
    state: &mut PeerState,
    transition: &mut impl FnMut(&mut PeerState, ConnEvent),
    queue: &mut OfflineQueue,
    client_id: &Arc<RwLock<Option<String>>>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(PeerCommand::Send(text)) => {
                    if ws.send(Message::Text(text.clone().into())).await.is_err() {
                        queue.push(text);
                        return;
                    }
                }
                Some(PeerCommand::Shutdown) | None => {
                    transition(state, ConnEvent::ShutdownRequested);
                    return;
                }
            },
            frame = ws.next() => {
                let Some(Ok(message)) = frame else { return };
                match message {
                    Message::Text(text) => {
                        if handle_inbound(text.as_str(), ws, events, client_id).await.is_err() {
                            return;
                        }
                    }
                    Message::Close(_) => return,
                    _ => {}
                }
            }
        }
    }
}

/// Dispatches one inbound frame. Returns `Err` only when a reply could
/// not be written, which the session treats as connection loss.
async fn handle_inbound(
    text: &str,
    ws: &mut WsStream,
    events: &mpsc::Sender<PeerEvent>,
    client_id: &Arc<RwLock<Option<String>>>,
) -> Result<(), ()> {
    match classify_inbound(text) {
        Inbound::Routed(value) | Inbound::Opaque(value) => {
            let _ = events.send(PeerEvent::Message(value)).await;
        }
        Inbound::Control(control) => match control {
            ControlMessage::Welcome {
                client_id: assigned,
                ..
            } => {
                debug!(client_id = %assigned, "welcome received");
                *client_id.write() = Some(assigned.clone());
                let _ = events
                    .send(PeerEvent::Welcome {
                        client_id: assigned,
                    })
                    .await;
            }
            ControlMessage::Roster { clients, .. } => {
                let _ = events.send(PeerEvent::Roster(clients)).await;
            }
            ControlMessage::Shutdown {
                reason,
                grace_period_ms,
                ..
            } => {
                info!(reason = %reason, grace_period_ms, "router shutting down");
                let _ = events
                    .send(PeerEvent::ShutdownNotice {
                        reason,
                        grace_period_ms,
                    })
                    .await;
            }
            ControlMessage::Ping { .. } => {
                let pong = ControlMessage::Pong {
                    timestamp: unix_millis(),
                };
                let Ok(reply) = serde_json::to_string(&pong) else {
                    return Ok(());
                };
                if ws.send(Message::Text(reply.into())).await.is_err() {
                    return Err(());
                }
            }
            // Pongs and stray identifies need no reaction here.
            ControlMessage::Pong { .. } | ControlMessage::Identify(_) => {}
        },
        Inbound::Invalid => {
            warn!("malformed inbound frame dropped");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn routed_payload_classified_by_sender() {
        let classified =
            classify_inbound(r#"{"type":"ping","id":1,"sender":"client-2","timestamp":5}"#);
        assert!(matches!(classified, Inbound::Routed(_)));
    }

    #[test]
    fn senderless_ping_is_control() {
        let classified = classify_inbound(r#"{"type":"ping","timestamp":123}"#);
        assert!(matches!(
            classified,
            Inbound::Control(ControlMessage::Ping { timestamp: 123 })
        ));
    }

    #[test]
    fn app_ping_response_with_sender_stays_routed() {
        // Same "type" as the liveness probe, but the router injected a
        // sender, so it must reach the application layer.
        let classified = classify_inbound(r#"{"type":"pong","timestamp":9,"sender":"client-1"}"#);
        match classified {
            Inbound::Routed(value) => assert_eq!(value["sender"], "client-1"),
            other => panic!("expected Routed, got {other:?}"),
        }
    }

    #[test]
    fn welcome_is_control() {
        let classified = classify_inbound(r#"{"type":"welcome","clientId":"client-3","timestamp":1}"#);
        assert!(matches!(
            classified,
            Inbound::Control(ControlMessage::Welcome { .. })
        ));
    }

    #[test]
    fn senderless_unknown_type_is_opaque() {
        let classified = classify_inbound(r#"{"type":"customEvent","x":1}"#);
        match classified {
            Inbound::Opaque(value) => assert_eq!(value, json!({"type":"customEvent","x":1})),
            other => panic!("expected Opaque, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(classify_inbound("{nope"), Inbound::Invalid));
    }

    #[test]
    fn offline_queue_drops_oldest_on_overflow() {
        let mut queue = OfflineQueue::new(2);
        queue.push("a".into());
        queue.push("b".into());
        queue.push("c".into());

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop().as_deref(), Some("c"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn offline_queue_capacity_floor_is_one() {
        let mut queue = OfflineQueue::new(0);
        queue.push("a".into());
        queue.push("b".into());
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn failed_flush_keeps_unsent_frames() {
        let mut queue = OfflineQueue::new(8);
        queue.push("a".into());
        queue.push("b".into());
        queue.push("c".into());

        // First frame goes out; the second send fails and is put back,
        // so the remainder survives for the next connection.
        assert_eq!(queue.pop().as_deref(), Some("a"));
        let failed = queue.pop().unwrap();
        assert_eq!(failed, "b");
        queue.requeue_front(failed);

        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop().as_deref(), Some("c"));
        assert_eq!(queue.pop(), None);
    }
}

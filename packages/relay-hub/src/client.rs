//! Request/response correlation over a peer connection.
//!
//! Turns fire-and-forget routed messages into awaitable requests with a
//! timeout, tracks milestone progress for long-running remote
//! operations, re-emits forwarded logs, and passes everything else
//! through to the application.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use relay_core::backoff::PeerState;
use relay_core::envelope::{unix_millis, Envelope};
use relay_core::messages::{LogLevel, Notification, RosterEntry};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::peer::{PeerConnection, PeerEvent};

/// One recorded progress notification of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Milestone {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A long-running remote action correlated by operation id, with its
/// ordered milestone history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub milestones: Vec<Milestone>,
}

/// Read-only relay snapshot for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayStatus {
    pub is_router: bool,
    pub connection_state: PeerState,
    pub pending_requests: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// Membership changed; the same roster is also cached on the client.
    Roster(Vec<RosterEntry>),
    /// A milestone was recorded for the named operation.
    Milestone {
        operation_id: String,
        milestone: Milestone,
    },
    /// An uncorrelated message with no other interpretation.
    Notification(Value),
    /// The router announced shutdown; reconnects will follow.
    ShutdownNotice {
        reason: String,
        grace_period_ms: u64,
    },
}

struct PendingRequest {
    tx: oneshot::Sender<Result<Value, RelayError>>,
    kind: String,
}

struct ClientInner {
    pending: DashMap<u64, PendingRequest>,
    next_id: AtomicU64,
    operations: DashMap<String, Operation>,
    roster: RwLock<Vec<RosterEntry>>,
    shutting_down: AtomicBool,
}

impl ClientInner {
    fn new() -> Self {
        Self {
            pending: DashMap::new(),
            next_id: AtomicU64::new(0),
            operations: DashMap::new(),
            roster: RwLock::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
        }
    }
}

/// The correlation layer: one per relay instance, owned and passed
/// explicitly by the embedding process.
pub struct RelayClient {
    peer: PeerConnection,
    inner: Arc<ClientInner>,
    config: RelayConfig,
    is_router: bool,
}

impl RelayClient {
    /// Wraps a peer connection, spawning the dispatch task that consumes
    /// its events. The returned receiver carries application-facing
    /// [`ClientEvent`]s.
    #[must_use]
    pub fn new(
        peer: PeerConnection,
        peer_events: mpsc::Receiver<PeerEvent>,
        config: RelayConfig,
        is_router: bool,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let inner = Arc::new(ClientInner::new());
        let (event_tx, event_rx) = mpsc::channel(config.connection.outbound_channel_capacity);

        tokio::spawn(dispatch(Arc::clone(&inner), peer_events, event_tx));

        (
            Self {
                peer,
                inner,
                config,
                is_router,
            },
            event_rx,
        )
    }

    /// Sends a request to the given responder type and awaits the
    /// correlated response.
    ///
    /// # Errors
    ///
    /// [`RelayError::RequestTimeout`] when no response arrives in the
    /// request window, [`RelayError::Remote`] when the responder answers
    /// with an error, [`RelayError::ShuttingDown`] during teardown, and
    /// [`RelayError::Closed`] when the connection task is gone.
    pub async fn send_request(
        &self,
        kind: &str,
        responder_type: &str,
        params: Value,
    ) -> Result<Value, RelayError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            id,
            PendingRequest {
                tx,
                kind: kind.to_string(),
            },
        );

        let envelope = Envelope::multicast(
            responder_type,
            json!({
                "id": id,
                "type": kind,
                "params": params,
                "timestamp": unix_millis(),
            }),
        );
        let payload = serde_json::to_value(&envelope).map_err(|_| RelayError::Closed)?;
        if let Err(err) = self.peer.send_json(&payload).await {
            self.inner.pending.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // The sender is dropped only when the dispatch task dies.
            Ok(Err(_)) => Err(RelayError::Closed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(RelayError::RequestTimeout {
                    id,
                    kind: kind.to_string(),
                })
            }
        }
    }

    /// Fire-and-forget broadcast to every other connection.
    ///
    /// # Errors
    ///
    /// [`RelayError::Closed`] once the connection task has exited.
    pub async fn broadcast(&self, data: Value) -> Result<(), RelayError> {
        self.send_envelope(&Envelope::broadcast(data)).await
    }

    /// Fire-and-forget message to a single connection id.
    ///
    /// # Errors
    ///
    /// [`RelayError::Closed`] once the connection task has exited.
    pub async fn unicast(&self, target_id: &str, data: Value) -> Result<(), RelayError> {
        self.send_envelope(&Envelope::unicast(target_id, data)).await
    }

    /// Fire-and-forget message to every connection of a declared type.
    ///
    /// # Errors
    ///
    /// [`RelayError::Closed`] once the connection task has exited.
    pub async fn multicast(&self, target_type: &str, data: Value) -> Result<(), RelayError> {
        self.send_envelope(&Envelope::multicast(target_type, data))
            .await
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), RelayError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(RelayError::ShuttingDown);
        }
        let payload = serde_json::to_value(envelope).map_err(|_| RelayError::Closed)?;
        self.peer.send_json(&payload).await
    }

    /// Rejects every outstanding request and tears the connection down.
    /// Safe to call more than once.
    pub async fn graceful_shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let ids: Vec<u64> = self.inner.pending.iter().map(|e| *e.key()).collect();
        info!(outstanding = ids.len(), "rejecting pending requests");
        for id in ids {
            if let Some((_, pending)) = self.inner.pending.remove(&id) {
                let _ = pending.tx.send(Err(RelayError::ShuttingDown));
            }
        }
        self.peer.shutdown().await;
    }

    #[must_use]
    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            is_router: self.is_router,
            connection_state: self.peer.state(),
            pending_requests: self.inner.pending.len(),
            client_id: self.peer.client_id(),
        }
    }

    /// The most recently received roster.
    #[must_use]
    pub fn roster(&self) -> Vec<RosterEntry> {
        self.inner.roster.read().clone()
    }

    /// Milestone history for one operation, if any milestones arrived.
    #[must_use]
    pub fn operation(&self, operation_id: &str) -> Option<Operation> {
        self.inner
            .operations
            .get(operation_id)
            .map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn is_router(&self) -> bool {
        self.is_router
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// The underlying connection, for callers needing raw access.
    #[must_use]
    pub fn peer(&self) -> &PeerConnection {
        &self.peer
    }
}

async fn dispatch(
    inner: Arc<ClientInner>,
    mut peer_events: mpsc::Receiver<PeerEvent>,
    events: mpsc::Sender<ClientEvent>,
) {
    while let Some(event) = peer_events.recv().await {
        match event {
            PeerEvent::Message(value) => handle_message(&inner, value, &events).await,
            PeerEvent::Roster(clients) => {
                *inner.roster.write() = clients.clone();
                let _ = events.send(ClientEvent::Roster(clients)).await;
            }
            PeerEvent::Connected => {
                let _ = events.send(ClientEvent::Connected).await;
            }
            PeerEvent::Disconnected => {
                let _ = events.send(ClientEvent::Disconnected).await;
            }
            PeerEvent::ShutdownNotice {
                reason,
                grace_period_ms,
            } => {
                let _ = events
                    .send(ClientEvent::ShutdownNotice {
                        reason,
                        grace_period_ms,
                    })
                    .await;
            }
            PeerEvent::Welcome { .. } => {}
        }
    }
}

/// Correlates one routed message: pending response, milestone, log, or
/// passthrough notification.
async fn handle_message(inner: &ClientInner, value: Value, events: &mpsc::Sender<ClientEvent>) {
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        if let Some((_, pending)) = inner.pending.remove(&id) {
            let outcome = match kind {
                "error" => {
                    let message = value
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("remote error")
                        .to_string();
                    Err(RelayError::Remote(message))
                }
                "response" => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                // Anything with a matching id resolves the request; the
                // whole message is the fallback result.
                _ => Ok(value),
            };
            let _ = pending.tx.send(outcome);
            return;
        }
        if kind == "response" || kind == "error" {
            // The request already timed out; its response is dropped.
            debug!(id, kind, "late response dropped");
            return;
        }
    }

    match Notification::classify(value) {
        Notification::Milestone {
            operation_id,
            milestone,
            data,
            timestamp,
        } => {
            let record = Milestone {
                name: milestone,
                timestamp,
                data,
            };
            inner
                .operations
                .entry(operation_id.clone())
                .or_insert_with(|| Operation {
                    id: operation_id.clone(),
                    milestones: Vec::new(),
                })
                .milestones
                .push(record.clone());
            let _ = events
                .send(ClientEvent::Milestone {
                    operation_id,
                    milestone: record,
                })
                .await;
        }
        Notification::Log { level, message } => match level {
            LogLevel::Debug => debug!(target: "relay_remote", "{message}"),
            LogLevel::Info => info!(target: "relay_remote", "{message}"),
            LogLevel::Warn => warn!(target: "relay_remote", "{message}"),
            LogLevel::Error => error!(target: "relay_remote", "{message}"),
        },
        Notification::Other(value) => {
            let _ = events.send(ClientEvent::Notification(value)).await;
        }
    }
}

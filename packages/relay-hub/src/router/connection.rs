//! Connection tracking for the router.
//!
//! Each accepted WebSocket gets a bounded mpsc channel for backpressure
//! and a registry entry keyed by its assigned client id. Identify
//! payloads are merged into the entry so the roster reflects what each
//! peer declared about itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::RwLock;
use relay_core::envelope::unix_millis;
use relay_core::messages::{Identity, RosterEntry};
use relay_core::routing::RosterPeer;
use tokio::sync::mpsc;

use crate::config::ConnectionConfig;

/// Registry-assigned identifier for a connection.
///
/// On the wire it appears as `client-{n}`; peers address each other by
/// that string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl ClientId {
    /// The string form used in envelopes and rosters.
    #[must_use]
    pub fn wire(&self) -> String {
        format!("client-{}", self.0)
    }

    /// Parses the wire form back into an id.
    #[must_use]
    pub fn from_wire(s: &str) -> Option<Self> {
        s.strip_prefix("client-")?.parse().ok().map(Self)
    }
}

/// Message to be sent outbound to a connection.
#[derive(Debug, Clone)]
pub enum OutboundFrame {
    /// A JSON text payload.
    Text(String),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

/// Error returned when sending a message to a connection fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The channel remained full for the whole timeout.
    Timeout,
    /// The receiver was dropped; the write loop has exited.
    Disconnected,
    /// The channel is full (non-blocking `try_send` only).
    Full,
}

/// What a connection has declared about itself, merged from identify
/// payloads as they arrive.
#[derive(Debug)]
pub struct ConnectionInfo {
    /// `None` until the first identify; unidentified connections are
    /// excluded from multicast matching.
    pub client_type: Option<String>,
    pub name: Option<String>,
    pub pid: Option<u32>,
    pub version: Option<String>,
    pub is_router: bool,
    pub capabilities: Vec<String>,
    pub component: Option<String>,
    /// Last time a pong (or any liveness signal) was seen.
    pub last_pong_at: Instant,
    /// When the most recent ping was sent, cleared by the matching pong.
    pub last_ping_sent_at: Option<Instant>,
    /// Round trip of the most recent completed ping/pong pair.
    pub ping_latency: Option<Duration>,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            client_type: None,
            name: None,
            pid: None,
            version: None,
            is_router: false,
            capabilities: Vec::new(),
            component: None,
            last_pong_at: Instant::now(),
            last_ping_sent_at: None,
            ping_latency: None,
        }
    }
}

impl ConnectionInfo {
    /// Merges an identify payload. Absent fields keep their current value,
    /// so repeated identifies refine rather than reset.
    pub fn apply_identify(&mut self, identity: &Identity) {
        if identity.client_type.is_some() {
            self.client_type.clone_from(&identity.client_type);
        }
        if identity.name.is_some() {
            self.name.clone_from(&identity.name);
        }
        if identity.pid.is_some() {
            self.pid = identity.pid;
        }
        if identity.version.is_some() {
            self.version.clone_from(&identity.version);
        }
        if let Some(is_router) = identity.is_router {
            self.is_router = is_router;
        }
        if let Some(capabilities) = &identity.capabilities {
            self.capabilities.clone_from(capabilities);
        }
        if identity.component.is_some() {
            self.component.clone_from(&identity.component);
        }
    }
}

/// Handle to a single connection: sender end of its outbound channel
/// plus the declared identity.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ClientId,
    pub tx: mpsc::Sender<OutboundFrame>,
    pub info: RwLock<ConnectionInfo>,
    pub connected_at: Instant,
    /// Wall-clock connect time, reported in rosters.
    pub connected_at_ms: u64,
}

impl ConnectionHandle {
    /// Attempts to send without blocking. Returns `false` if the channel
    /// is full or the connection has closed.
    #[must_use]
    pub fn try_send(&self, frame: OutboundFrame) -> bool {
        self.tx.try_send(frame).is_ok()
    }

    /// Sends with a timeout.
    ///
    /// # Errors
    ///
    /// `SendError::Timeout` if the channel remained full, or
    /// `SendError::Disconnected` if the write loop has exited.
    pub async fn send_timeout(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Records an outbound liveness ping.
    pub fn mark_ping_sent(&self) {
        self.info.write().last_ping_sent_at = Some(Instant::now());
    }

    /// Records a pong, completing the latency measurement if a ping was
    /// outstanding.
    pub fn mark_pong(&self) {
        let mut info = self.info.write();
        info.last_pong_at = Instant::now();
        if let Some(sent_at) = info.last_ping_sent_at.take() {
            info.ping_latency = Some(sent_at.elapsed());
        }
    }

    /// The roster line for this connection.
    #[must_use]
    pub fn roster_entry(&self) -> RosterEntry {
        let info = self.info.read();
        RosterEntry {
            id: self.id.wire(),
            client_type: info.client_type.clone(),
            name: info.name.clone(),
            connected_at: self.connected_at_ms,
            is_router: info.is_router,
        }
    }
}

/// Thread-safe registry of all active connections.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: DashMap<ClientId, Arc<ConnectionHandle>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates an empty registry. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new connection, returning its handle and the receiver
    /// the write loop drains.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundFrame>) {
        let id = ClientId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id,
            tx,
            info: RwLock::new(ConnectionInfo::default()),
            connected_at: Instant::now(),
            connected_at_ms: unix_millis(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        (handle, rx)
    }

    /// Removes a connection, returning its handle if it was present.
    pub fn remove(&self, id: ClientId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|r| r.value().clone())
    }

    /// Looks up a connection by its wire-form id.
    pub fn resolve(&self, wire_id: &str) -> Option<Arc<ConnectionHandle>> {
        self.get(ClientId::from_wire(wire_id)?)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// All active connections as owned handles.
    ///
    /// `DashMap` iteration yields guard types that borrow the map, so we
    /// collect into a `Vec` to return owned values.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// The full roster, sorted by id for stable output.
    #[must_use]
    pub fn roster(&self) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .connections
            .iter()
            .map(|entry| entry.value().roster_entry())
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// The roster in the reduced form routing decisions consume.
    #[must_use]
    pub fn roster_peers(&self) -> Vec<RosterPeer> {
        self.connections
            .iter()
            .map(|entry| {
                let handle = entry.value();
                let info = handle.info.read();
                RosterPeer {
                    id: handle.id.wire(),
                    client_type: info.client_type.clone(),
                }
            })
            .collect()
    }

    /// Sends a text frame to every connection.
    ///
    /// Uses non-blocking `try_send` so a single slow connection cannot
    /// stall the broadcast. Full channels are silently skipped.
    pub fn broadcast_text(&self, text: &str) {
        for entry in &self.connections {
            let _ = entry.value().try_send(OutboundFrame::Text(text.to_string()));
        }
    }

    /// Like [`broadcast_text`](Self::broadcast_text) but skips one
    /// connection, typically the originator.
    pub fn broadcast_text_except(&self, text: &str, except: ClientId) {
        for entry in &self.connections {
            let handle = entry.value();
            if handle.id != except {
                let _ = handle.try_send(OutboundFrame::Text(text.to_string()));
            }
        }
    }

    /// Removes and returns all connections. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ClientId> = self.connections.iter().map(|entry| *entry.key()).collect();

        let mut handles = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, handle)) = self.connections.remove(&key) {
                handles.push(handle);
            }
        }
        handles
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

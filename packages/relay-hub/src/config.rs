//! Relay configuration types.
//!
//! The library only reads resolved values; how they are resolved (flags,
//! environment, files) is the embedding binary's concern.

use std::time::Duration;

use relay_core::messages::Identity;

/// Top-level relay configuration.
///
/// The control surface always lives on `port + 1`.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Bind/connect address for the relay.
    pub host: String,
    /// The well-known relay port.
    pub port: u16,
    /// Delay between the shutdown notice and socket closure.
    pub grace_period: Duration,
    /// Interval of the per-connection liveness probe.
    pub ping_interval: Duration,
    /// Timeout for the bootstrap health probe.
    pub health_probe_timeout: Duration,
    /// Window for a correlated response before a request is rejected.
    pub request_timeout: Duration,
    /// Delay between accepting a takeover and starting the shutdown, so
    /// the HTTP response flushes before sockets close.
    pub takeover_delay: Duration,
    /// First reconnect delay.
    pub reconnect_base: Duration,
    /// Ceiling for the doubled reconnect delay.
    pub reconnect_cap: Duration,
    /// Per-connection settings.
    pub connection: ConnectionConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9000,
            grace_period: Duration::from_secs(3),
            ping_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            takeover_delay: Duration::from_millis(250),
            reconnect_base: relay_core::backoff::RECONNECT_BASE,
            reconnect_cap: relay_core::backoff::RECONNECT_CAP,
            connection: ConnectionConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Port of the HTTP control surface.
    #[must_use]
    pub fn control_port(&self) -> u16 {
        self.port.saturating_add(1)
    }

    #[must_use]
    pub fn relay_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port())
    }

    /// WebSocket URL peers connect to.
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }

    /// Health check URL on the control surface.
    #[must_use]
    pub fn health_url(&self) -> String {
        format!("http://{}:{}/health", self.host, self.control_port())
    }
}

/// Per-connection settings controlling backpressure and queueing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bounded mpsc capacity for outbound messages per connection.
    pub outbound_channel_capacity: usize,
    /// Maximum time to wait when sending to a connection.
    pub send_timeout: Duration,
    /// Bound on the queue of messages buffered while a peer is
    /// disconnected. Overflow drops the oldest entry.
    pub offline_queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            outbound_channel_capacity: 256,
            send_timeout: Duration::from_secs(5),
            offline_queue_capacity: 256,
        }
    }
}

/// What this process declares about itself when identifying to the router.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub client_type: String,
    pub name: String,
    pub pid: u32,
    pub version: String,
    pub capabilities: Vec<String>,
    pub component: Option<String>,
}

impl ClientIdentity {
    /// Identity with the current process id and crate version filled in.
    #[must_use]
    pub fn new(client_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            client_type: client_type.into(),
            name: name.into(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: Vec::new(),
            component: None,
        }
    }

    /// The wire-level identify payload, with the router flag resolved by
    /// the bootstrap outcome.
    #[must_use]
    pub fn to_wire(&self, is_router: bool) -> Identity {
        Identity {
            client_type: Some(self.client_type.clone()),
            name: Some(self.name.clone()),
            pid: Some(self.pid),
            version: Some(self.version.clone()),
            is_router: Some(is_router),
            capabilities: Some(self.capabilities.clone()),
            component: self.component.clone(),
        }
    }
}

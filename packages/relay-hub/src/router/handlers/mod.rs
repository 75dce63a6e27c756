//! HTTP and WebSocket handlers for the router's two listeners.
//!
//! `AppState` is the shared state carried through axum extractors; both
//! the relay listener (`/ws`) and the control listener (`/health`,
//! `/takeover`) are built over the same state.

pub mod health;
pub mod takeover;
pub mod websocket;

pub use health::health_handler;
pub use takeover::takeover_handler;
pub use websocket::ws_upgrade_handler;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::config::RelayConfig;
use crate::metrics::RelayMetrics;
use crate::router::connection::ConnectionRegistry;
use crate::router::shutdown::ShutdownController;

/// Shared state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Registry of active relay connections.
    pub registry: Arc<ConnectionRegistry>,
    /// Lifecycle controller coordinating graceful shutdown.
    pub shutdown: Arc<ShutdownController>,
    /// Traffic counters.
    pub metrics: Arc<RelayMetrics>,
    /// Resolved relay configuration.
    pub config: Arc<RelayConfig>,
    /// Process start time, for uptime reporting.
    pub start_time: Instant,
    /// Latch claimed by the first accepted takeover.
    pub takeover_claimed: Arc<AtomicBool>,
    /// Stop requests queued for the router's lifecycle task; carries the
    /// shutdown reason.
    pub stop_requests: mpsc::Sender<String>,
}

#[cfg(test)]
pub(crate) fn test_state() -> (AppState, mpsc::Receiver<String>) {
    let (stop_tx, stop_rx) = mpsc::channel(4);
    let state = AppState {
        registry: Arc::new(ConnectionRegistry::new()),
        shutdown: Arc::new(ShutdownController::new()),
        metrics: Arc::new(RelayMetrics::default()),
        config: Arc::new(RelayConfig::default()),
        start_time: Instant::now(),
        takeover_claimed: Arc::new(AtomicBool::new(false)),
        stop_requests: stop_tx,
    };
    (state, stop_rx)
}

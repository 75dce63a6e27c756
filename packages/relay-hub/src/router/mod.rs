//! The routing process: two listeners, a connection registry, and a
//! graceful shutdown sequence.
//!
//! The relay listener (`/ws`) carries all peer traffic on the well-known
//! port; the control listener (`/health`, `/takeover`) lives on the next
//! port up. Winning the bind on the relay port is what makes a process
//! the router.

pub mod connection;
pub mod handlers;
pub mod shutdown;

pub use connection::{ClientId, ConnectionHandle, ConnectionRegistry, OutboundFrame};
pub use handlers::AppState;
pub use shutdown::{RouterState, ShutdownController};

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router as AxumRouter;
use parking_lot::Mutex;
use relay_core::envelope::unix_millis;
use relay_core::messages::ControlMessage;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::metrics::RelayMetrics;
use handlers::{health_handler, takeover_handler, ws_upgrade_handler};

/// A running router: owns both listeners and the shutdown sequence.
pub struct Router {
    config: Arc<RelayConfig>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<ShutdownController>,
    metrics: Arc<RelayMetrics>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Router {
    /// Binds both listeners and starts serving.
    ///
    /// # Errors
    ///
    /// [`RelayError::BindConflict`] when either port is already taken
    /// (the caller falls back to peer mode), [`RelayError::Io`] for any
    /// other bind failure.
    pub async fn start(config: RelayConfig) -> Result<Arc<Self>, RelayError> {
        let config = Arc::new(config);

        let relay_listener = TcpListener::bind(config.relay_addr())
            .await
            .map_err(|err| classify_bind(err, config.port))?;
        let control_listener = TcpListener::bind(config.control_addr())
            .await
            .map_err(|err| classify_bind(err, config.control_port()))?;

        let registry = Arc::new(ConnectionRegistry::new());
        let shutdown = Arc::new(ShutdownController::new());
        let metrics = Arc::new(RelayMetrics::default());
        let (stop_tx, mut stop_rx) = mpsc::channel::<String>(4);

        let state = AppState {
            registry: Arc::clone(&registry),
            shutdown: Arc::clone(&shutdown),
            metrics: Arc::clone(&metrics),
            config: Arc::clone(&config),
            start_time: Instant::now(),
            takeover_claimed: Arc::new(AtomicBool::new(false)),
            stop_requests: stop_tx,
        };

        let relay_app = AxumRouter::new()
            .route("/ws", get(ws_upgrade_handler))
            .with_state(state.clone());
        let control_app = AxumRouter::new()
            .route("/health", get(health_handler))
            .route("/takeover", post(takeover_handler))
            .with_state(state);

        let router = Arc::new(Self {
            config: Arc::clone(&config),
            registry,
            shutdown,
            metrics,
            tasks: Mutex::new(Vec::new()),
        });

        let relay_task = tokio::spawn(serve(
            relay_listener,
            relay_app,
            router.shutdown.shutdown_receiver(),
        ));
        let control_task = tokio::spawn(serve(
            control_listener,
            control_app,
            router.shutdown.shutdown_receiver(),
        ));
        router.tasks.lock().extend([relay_task, control_task]);

        // Lifecycle task: applies the takeover delay so the HTTP response
        // is flushed before sockets close. Holds only a weak reference, so
        // it never keeps a dropped router alive; it exits once the last
        // stop-request sender (held by the listeners) is gone.
        let weak = Arc::downgrade(&router);
        let takeover_delay = config.takeover_delay;
        tokio::spawn(async move {
            if let Some(reason) = stop_rx.recv().await {
                tokio::time::sleep(takeover_delay).await;
                if let Some(router) = weak.upgrade() {
                    router.stop(&reason).await;
                }
            }
        });

        router.shutdown.set_ready();
        info!(
            relay = %config.relay_addr(),
            control = %config.control_addr(),
            "router listening"
        );
        Ok(router)
    }

    /// Graceful shutdown: notice, grace period, close, teardown.
    ///
    /// Idempotent; only the first caller runs the sequence.
    pub async fn stop(&self, reason: &str) {
        if !self.shutdown.begin_shutdown() {
            return;
        }
        info!(reason, "router stopping");

        let notice = ControlMessage::Shutdown {
            reason: reason.to_string(),
            grace_period_ms: millis(self.config.grace_period),
            timestamp: unix_millis(),
        };
        if let Ok(text) = serde_json::to_string(&notice) {
            self.registry.broadcast_text(&text);
        }

        tokio::time::sleep(self.config.grace_period).await;

        let handles = self.registry.drain_all();
        info!(connections = handles.len(), "closing connections");
        for handle in &handles {
            let _ = handle.try_send(OutboundFrame::Close(Some("router shutting down".into())));
        }
        // Let the write loops flush their close frames before the
        // listeners are torn down.
        tokio::time::sleep(Duration::from_millis(50)).await;

        self.shutdown.set_stopped();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("router stopped");
    }

    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.metrics)
    }

    #[must_use]
    pub fn state(&self) -> RouterState {
        self.shutdown.state()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutting_down()
    }

    /// The relay port this router is bound to.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.config.port
    }
}

async fn serve(listener: TcpListener, app: AxumRouter, mut signal: watch::Receiver<bool>) {
    let shutdown = async move {
        let _ = signal.wait_for(|stopping| *stopping).await;
    };
    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(error = %err, "listener failed");
    }
}

fn classify_bind(err: io::Error, port: u16) -> RelayError {
    if err.kind() == io::ErrorKind::AddrInUse {
        RelayError::BindConflict { port }
    } else {
        RelayError::Io(err)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_in_use_classifies_as_bind_conflict() {
        let err = io::Error::new(io::ErrorKind::AddrInUse, "in use");
        assert!(matches!(
            classify_bind(err, 9000),
            RelayError::BindConflict { port: 9000 }
        ));
    }

    #[test]
    fn other_io_errors_stay_io() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(matches!(classify_bind(err, 9000), RelayError::Io(_)));
    }

    #[test]
    fn millis_saturates() {
        assert_eq!(millis(Duration::from_secs(3)), 3000);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}

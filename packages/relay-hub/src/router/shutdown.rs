//! Router lifecycle controller.
//!
//! Lock-free state transitions via `ArcSwap`, a watch channel that stops
//! both listeners, and an atomic latch that makes shutdown idempotent:
//! whichever caller flips the latch first runs the teardown sequence,
//! everyone else returns immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

/// Router lifecycle state, reported by the health endpoint.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Listeners are being bound.
    Starting,
    /// Accepting connections; health reports `ok`.
    Ready,
    /// Shutdown notice sent, grace period running.
    Draining,
    /// Sockets closed, listeners stopped.
    Stopped,
}

impl RouterState {
    /// The status string health responses carry.
    #[must_use]
    pub fn as_status(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ok",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Coordinates graceful shutdown across the router's tasks.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<RouterState>,
    stopping: AtomicBool,
    signal: watch::Sender<bool>,
}

impl ShutdownController {
    /// New controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(RouterState::Starting),
            stopping: AtomicBool::new(false),
            signal,
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(RouterState::Ready));
    }

    pub fn set_stopped(&self) {
        self.state.store(Arc::new(RouterState::Stopped));
    }

    /// Claims the shutdown latch. Returns `true` exactly once; the caller
    /// that gets `true` owns the teardown sequence. Also transitions to
    /// `Draining` and signals every shutdown receiver.
    pub fn begin_shutdown(&self) -> bool {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.store(Arc::new(RouterState::Draining));
        // Receivers may have been dropped already
        let _ = self.signal.send(true);
        true
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> RouterState {
        **self.state.load()
    }

    /// Receiver for the shutdown signal; listeners select on this next to
    /// their accept loops.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

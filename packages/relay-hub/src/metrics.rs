//! Router traffic counters, served as JSON by the control surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lock-free counters updated on the hot routing path.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    messages_routed: AtomicU64,
    clients_connected: AtomicU64,
    clients_disconnected: AtomicU64,
    errors: AtomicU64,
}

impl RelayMetrics {
    pub fn record_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect(&self) {
        self.clients_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.clients_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for health reporting and [`crate::RelayStatus`].
    #[must_use]
    pub fn snapshot(&self, current_clients: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            clients_connected: self.clients_connected.load(Ordering::Relaxed),
            clients_disconnected: self.clients_disconnected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            current_clients,
        }
    }
}

/// Derived snapshot; never independently mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub messages_routed: u64,
    pub clients_connected: u64,
    pub clients_disconnected: u64,
    pub errors: u64,
    pub current_clients: usize,
}

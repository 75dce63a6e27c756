//! Embedded relay runtime: router election, peer connections, and the
//! request/response correlation layer.
//!
//! One process per machine wins the well-known port and routes messages
//! between every connected peer; everyone else (including the winner's own
//! loopback connection) talks through it. Start with [`bootstrap`].

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod peer;
pub mod router;

pub use bootstrap::{bootstrap, Relay};
pub use client::{ClientEvent, Milestone, Operation, RelayClient, RelayStatus};
pub use config::{ClientIdentity, ConnectionConfig, RelayConfig};
pub use error::RelayError;
pub use metrics::{MetricsSnapshot, RelayMetrics};
pub use peer::{PeerConnection, PeerEvent};
pub use router::Router;

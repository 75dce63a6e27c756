//! Relay error taxonomy.
//!
//! Transport faults (socket errors, malformed frames) are absorbed and
//! logged where they occur; only protocol-level faults surface here as
//! values callers must handle.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// The well-known port is already bound. Recoverable: the caller falls
    /// back to peer mode.
    #[error("relay port {port} is already in use")]
    BindConflict { port: u16 },

    /// Any other I/O failure while starting the router. Fatal to relay
    /// capability for this process; surfaced, never retried automatically.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// No correlated response arrived inside the request window.
    #[error("request {id} ({kind}) timed out")]
    RequestTimeout { id: u64, kind: String },

    /// The responder answered with an error message.
    #[error("remote error: {0}")]
    Remote(String),

    /// The relay is shutting down; outstanding and new requests are
    /// rejected with this.
    #[error("relay is shutting down")]
    ShuttingDown,

    /// The peer connection is permanently closed.
    #[error("relay connection closed")]
    Closed,
}

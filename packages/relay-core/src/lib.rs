//! Relay protocol core: envelope schema, routing rules, control messages,
//! and the reconnect backoff/state machine.
//!
//! Everything in this crate is pure protocol logic with no I/O, so the
//! routing and reconnection semantics can be tested without sockets. The
//! runtime half of the relay lives in the `relay-hub` crate.

pub mod backoff;
pub mod envelope;
pub mod messages;
pub mod routing;

pub use backoff::{delay_for_attempt, ConnEvent, PeerState};
pub use envelope::{unix_millis, Envelope};
pub use messages::{ControlMessage, Identity, LogLevel, Notification, RosterEntry};
pub use routing::{route, RosterPeer, RouteDecision};

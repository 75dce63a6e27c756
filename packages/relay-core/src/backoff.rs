//! Reconnect backoff and the peer connection state machine.
//!
//! Both are pure: the delay is a function of the attempt number, and the
//! state machine is an explicit transition table, so reconnection logic is
//! testable without sockets or timers.

use std::time::Duration;

use serde::Serialize;

/// Default base delay before the first reconnect attempt.
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);
/// Default ceiling for the doubled delay.
pub const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Delay before reconnect attempt `attempt` (1-based).
///
/// Attempt 1 waits `base`; each further attempt doubles the delay up to
/// `cap`. Attempt 0 is treated as 1.
#[must_use]
pub fn delay_for_attempt(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let attempt = attempt.max(1);
    // 2^20 * base already exceeds any sane cap; clamp the shift so the
    // multiplication cannot overflow.
    let exponent = (attempt - 1).min(20);
    base.saturating_mul(1 << exponent).min(cap)
}

/// Connection lifecycle as observed by the peer side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    ShuttingDown,
}

/// Events that drive [`PeerState`] transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnEvent {
    /// A connection attempt is about to start (initial connect, retry, or
    /// a send issued while disconnected).
    ConnectRequested,
    /// The socket opened and identification was sent.
    Established,
    /// A connection attempt failed before establishing.
    Failed,
    /// An established connection dropped.
    Lost,
    /// The owner asked for permanent teardown.
    ShutdownRequested,
}

impl PeerState {
    /// Applies one event. `ShuttingDown` is absorbing; events that make no
    /// sense in the current state leave it unchanged.
    #[must_use]
    pub fn apply(self, event: ConnEvent) -> Self {
        use ConnEvent::{ConnectRequested, Established, Failed, Lost, ShutdownRequested};
        match (self, event) {
            (_, ShutdownRequested) | (Self::ShuttingDown, _) => Self::ShuttingDown,
            (Self::Disconnected | Self::Reconnecting, ConnectRequested) => Self::Connecting,
            (Self::Connecting, Established) => Self::Connected,
            (Self::Connecting, Failed | Lost) | (Self::Connected, Failed | Lost) => {
                Self::Reconnecting
            }
            (state, _) => state,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::ShuttingDown => "shutting_down",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_doubles_to_cap() {
        let base = Duration::from_millis(1000);
        let cap = Duration::from_millis(30_000);
        let delays: Vec<u64> = (1..=7)
            .map(|n| delay_for_attempt(n, base, cap).as_millis().try_into().unwrap())
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000]);
    }

    #[test]
    fn attempt_zero_behaves_like_first() {
        assert_eq!(
            delay_for_attempt(0, RECONNECT_BASE, RECONNECT_CAP),
            RECONNECT_BASE
        );
    }

    #[test]
    fn huge_attempt_stays_capped() {
        assert_eq!(
            delay_for_attempt(u32::MAX, RECONNECT_BASE, RECONNECT_CAP),
            RECONNECT_CAP
        );
    }

    #[test]
    fn happy_path_transitions() {
        let mut state = PeerState::Disconnected;
        state = state.apply(ConnEvent::ConnectRequested);
        assert_eq!(state, PeerState::Connecting);
        state = state.apply(ConnEvent::Established);
        assert_eq!(state, PeerState::Connected);
    }

    #[test]
    fn loss_enters_reconnecting_then_connecting() {
        let state = PeerState::Connected.apply(ConnEvent::Lost);
        assert_eq!(state, PeerState::Reconnecting);
        assert_eq!(
            state.apply(ConnEvent::ConnectRequested),
            PeerState::Connecting
        );
    }

    #[test]
    fn failed_attempt_enters_reconnecting() {
        assert_eq!(
            PeerState::Connecting.apply(ConnEvent::Failed),
            PeerState::Reconnecting
        );
    }

    #[test]
    fn shutdown_is_absorbing() {
        let state = PeerState::Connected.apply(ConnEvent::ShutdownRequested);
        assert_eq!(state, PeerState::ShuttingDown);
        for event in [
            ConnEvent::ConnectRequested,
            ConnEvent::Established,
            ConnEvent::Failed,
            ConnEvent::Lost,
        ] {
            assert_eq!(state.apply(event), PeerState::ShuttingDown);
        }
    }

    #[test]
    fn nonsense_events_are_ignored() {
        assert_eq!(
            PeerState::Disconnected.apply(ConnEvent::Established),
            PeerState::Disconnected
        );
        assert_eq!(
            PeerState::Connected.apply(ConnEvent::ConnectRequested),
            PeerState::Connected
        );
    }

    #[test]
    fn state_serializes_snake_case() {
        let text = serde_json::to_string(&PeerState::ShuttingDown).unwrap();
        assert_eq!(text, "\"shutting_down\"");
    }
}

//! Connection state machine types.
//!
//! Exactly one state holds at any instant; the manager's single lock guards
//! every transition. The legal transitions are:
//!
//! ```text
//! DISCONNECTED ──connect()──▶ CONNECTING ──success──▶ CONNECTED
//!      ▲                          │                       │
//!      │                     dial failed            link dropped
//!      │                          ▼                       ▼
//!      └──────────────────── DISCONNECTED          RECONNECTING
//!                                                    │        │
//!                                          retry ok  │        │ attempts
//!                                                    ▼        ▼ exhausted
//!                                               CONNECTED   FAILED ──connect()──▶ CONNECTING
//! ```
//!
//! `disconnect()` is additionally legal from every state and always lands in
//! `Disconnected`. `Failed` never recovers on its own.

use std::fmt;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No sockets exist; initial state and the result of `disconnect()`.
    Disconnected,
    /// An explicit `connect()` call is dialing the command socket.
    Connecting,
    /// Both channels usable; command traffic and video frames flow.
    Connected,
    /// The link dropped while connected; the retry loop is running.
    Reconnecting,
    /// The retry loop exhausted its attempts. Only an explicit `connect()`
    /// leaves this state.
    Failed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Failed, Connecting)
                | (Connecting, Connected)
                | (Connected, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::*;

    #[test]
    fn connect_path_is_legal() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Failed.can_transition_to(Connecting));
    }

    #[test]
    fn recovery_path_is_legal() {
        assert!(Connected.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Reconnecting.can_transition_to(Failed));
    }

    #[test]
    fn disconnect_is_legal_from_every_state() {
        for state in [Disconnected, Connecting, Connected, Reconnecting, Failed] {
            assert!(state.can_transition_to(Disconnected));
        }
    }

    #[test]
    fn shortcuts_are_rejected() {
        // No skipping the dial phase.
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Reconnecting));
        assert!(!Disconnected.can_transition_to(Failed));
        // A first connect() that fails does not count as a retry failure.
        assert!(!Connecting.can_transition_to(Failed));
        assert!(!Connecting.can_transition_to(Reconnecting));
        // Failed is sticky until an explicit connect().
        assert!(!Failed.can_transition_to(Connected));
        assert!(!Failed.can_transition_to(Reconnecting));
        // Connected callers go through the retry loop, never straight back.
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(Failed));
    }
}

//! The two finite-state machines a connection runs.
//!
//! [`ConnectionState`] says what the link *is* (open, authorized, dead…).
//! [`ConnectionActivity`] says what the connection is *doing* right now
//! (dialing, closing…). They change independently, and both are changed
//! only through their pure `transition` functions, so the tables below can
//! be tested without a socket in sight.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TransitionError;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// The lifecycle state of a connection.
///
/// ```text
///   NotConnected → Connected | Errored
///   Connected    → Authorized | NoPing | Errored | NotConnected
///   Authorized   → Connected | NoPing | Errored | NotConnected
///   NoPing       → NotConnected
///   Errored      → NotConnected | Errored
/// ```
///
/// - **NotConnected**: no usable socket; may be waiting to reconnect.
/// - **Connected**: socket open, not (yet) authorized.
/// - **Authorized**: socket open and trusted to carry secure traffic.
/// - **NoPing**: the peer stopped answering pings; a forced disconnect is
///   pending.
/// - **Errored**: the socket failed; heading back to `NotConnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    NotConnected,
    Connected,
    Authorized,
    NoPing,
    Errored,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (NotConnected, Connected | Errored)
                | (Connected, Authorized | NoPing | Errored | NotConnected)
                | (Authorized, Connected | NoPing | Errored | NotConnected)
                | (NoPing, NotConnected)
                | (Errored, NotConnected | Errored)
        )
    }

    /// Validates a move to `next`.
    ///
    /// On success returns the new state. On failure the caller keeps the
    /// state it already has.
    pub fn transition(self, next: ConnectionState) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::State {
                from: self,
                to: next,
            })
        }
    }

    /// `true` for the two states in which the socket is open and usable.
    pub fn is_open(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Authorized)
    }

    /// Every state, in declaration order.
    pub const ALL: [ConnectionState; 5] = [
        ConnectionState::NotConnected,
        ConnectionState::Connected,
        ConnectionState::Authorized,
        ConnectionState::NoPing,
        ConnectionState::Errored,
    ];
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::NotConnected => "not connected",
            ConnectionState::Connected => "connected",
            ConnectionState::Authorized => "authorized",
            ConnectionState::NoPing => "no ping",
            ConnectionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ConnectionActivity
// ---------------------------------------------------------------------------

/// What the connection is doing at the moment.
///
/// Not a queue: every non-idle activity must return to `Idle` before the
/// next one starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionActivity {
    Idle,
    Connecting,
    Closing,
    Terminating,
    Authorizing,
}

impl ConnectionActivity {
    /// Returns `true` if moving from `self` to `next` is allowed.
    pub fn can_transition_to(self, next: ConnectionActivity) -> bool {
        use ConnectionActivity::*;
        match (self, next) {
            (Idle, Idle) => false,
            (Idle, _) => true,
            (_, Idle) => true,
            _ => false,
        }
    }

    /// Validates a move to `next`.
    pub fn transition(
        self,
        next: ConnectionActivity,
    ) -> Result<Self, TransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(TransitionError::Activity {
                from: self,
                to: next,
            })
        }
    }

    /// Every activity, in declaration order.
    pub const ALL: [ConnectionActivity; 5] = [
        ConnectionActivity::Idle,
        ConnectionActivity::Connecting,
        ConnectionActivity::Closing,
        ConnectionActivity::Terminating,
        ConnectionActivity::Authorizing,
    ];
}

// ---------------------------------------------------------------------------
// ConnectionStatus
// ---------------------------------------------------------------------------

/// A snapshot of a connection, published on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub activity: ConnectionActivity,
    /// Dial attempts since the last successful open.
    pub attempts: u32,
    /// The most recent socket failure, cleared on open.
    pub last_error: Option<String>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::NotConnected,
            activity: ConnectionActivity::Idle,
            attempts: 0,
            last_error: None,
        }
    }
}

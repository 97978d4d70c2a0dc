//! Error types for the connection layer.

use tandem_transport::TransportError;

use crate::{ConnectionActivity, ConnectionState};

/// A rejected move in one of the connection state machines.
///
/// The machine that rejected the move keeps its current value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("invalid state transition {from:?} -> {to:?}")]
    State {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("invalid activity transition {from:?} -> {to:?}")]
    Activity {
        from: ConnectionActivity,
        to: ConnectionActivity,
    },
}

/// Errors returned by [`Connection`](crate::Connection) operations.
///
/// Socket failures never show up here on their own: they drive the state
/// machine and reconnection instead. What does surface is a failure of the
/// specific call being made.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// The socket refused a send that the state machine allowed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The operation needs an open socket and there is none.
    #[error("socket is not open")]
    NotOpen,

    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The connection was destroyed; the handle is inert.
    #[error("connection has been destroyed")]
    Destroyed,
}

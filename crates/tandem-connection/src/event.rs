//! Notifications a connection sends to its subscribers.

use serde_json::Value;

use crate::{ConnectionActivity, ConnectionState};

/// A lifecycle notification.
///
/// Delivered in the order the actor processed the underlying signals.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    ActivityChanged {
        from: ConnectionActivity,
        to: ConnectionActivity,
    },
    /// A socket opened and the connection is ready to send.
    Opened,
    /// A JSON message arrived.
    Message(Value),
    /// A payload was queued to history instead of sent.
    NotSent(Value),
    /// The peer missed a ping; a forced disconnect follows.
    NoPing,
    /// The socket closed.
    Closed { code: u16, reason: String },
    /// Something went wrong that did not warrant a state change on its own:
    /// an unparsable message, a failed dial, a failed history replay.
    Error(String),
}

//! Unified error type for Tandem clients.

use std::time::Duration;

use tandem_connection::ConnectionError;
use tandem_protocol::{ProtocolError, RemoteError};
use tandem_router::RouterError;
use tandem_transport::TransportError;

/// Top-level error that wraps all crate-specific errors.
///
/// The `#[from]` variants let `?` convert sub-crate errors automatically.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Router(#[from] RouterError),

    /// The peer answered with an errored response.
    #[error(transparent)]
    Remote(RemoteError),

    /// No response arrived in time.
    #[error("request {id} timed out after {elapsed:?}")]
    Timeout { id: String, elapsed: Duration },

    /// A token was needed but there is neither a cached one, a stored one
    /// nor a provider to ask.
    #[error("no token available")]
    NoToken,

    #[error("token provider failed: {0}")]
    TokenProvider(String),

    /// The client was destroyed while the operation was in flight.
    #[error("client destroyed")]
    Destroyed,
}

impl ClientError {
    /// The peer's error, when this is one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            ClientError::Remote(err) => Some(err),
            ClientError::Protocol(ProtocolError::Remote(err)) => Some(err),
            _ => None,
        }
    }
}

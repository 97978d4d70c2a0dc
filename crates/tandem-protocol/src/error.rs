//! Error types for the protocol layer.
//!
//! Every validation failure gets its own variant so that callers can tell a
//! malformed envelope from an unauthorized one from one aimed at a route
//! nobody registered. All of them are fatal to a single message only; none
//! of them should ever tear down a connection.

use crate::{RemoteError, RouteKey};

/// Errors that can occur in the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning an envelope into JSON).
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning JSON into an envelope).
    ///
    /// Common causes: missing required fields or wrong data types.
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The envelope id is not a syntactically valid v4 UUID.
    #[error("id not valid: {0:?}")]
    InvalidId(String),

    /// Neither the security allow-list nor the credential validator
    /// accepted the envelope.
    #[error("unauthorized: credentials rejected for {0}")]
    Unauthorized(RouteKey),

    /// The envelope's `type` is not registered.
    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    /// The envelope's `(type, name)` pair is not registered.
    #[error("unknown route: {0}")]
    UnknownRoute(RouteKey),

    /// `pack` was called without service data and without an error.
    #[error("service data is required unless an error is packed")]
    MissingServiceData,

    /// The envelope carried an application error from the peer.
    #[error(transparent)]
    Remote(RemoteError),
}

//! Error types for routing.

use tandem_protocol::{RemoteError, RouteKey};

/// Code sent back when a request names a route nobody registered.
pub const ROUTE_NOT_FOUND: &str = "ROUTE_NOT_FOUND";

/// Code sent back for a malformed registration that reached a peer.
pub const INVALID_ROUTE: &str = "INVALID_ROUTE";

/// Errors produced while registering or dispatching routes.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    /// Nothing is registered under this `(type, name)` pair.
    #[error("route not found: {0}")]
    NotFound(RouteKey),

    #[error("route type must be a non-empty string")]
    InvalidType,

    #[error("route names under type {0:?} must be non-empty strings")]
    InvalidRouteName(String),

    /// A guard refused the request; the terminal handler never ran.
    #[error("rejected by guard: {0}")]
    Rejected(RemoteError),

    /// The terminal handler failed.
    #[error(transparent)]
    Handler(RemoteError),
}

impl RouterError {
    /// The error to report to the peer that sent the request.
    pub fn into_remote(self) -> RemoteError {
        match self {
            RouterError::Rejected(err) | RouterError::Handler(err) => err,
            err @ RouterError::NotFound(_) => {
                RemoteError::new(ROUTE_NOT_FOUND, err.to_string())
            }
            err @ (RouterError::InvalidType | RouterError::InvalidRouteName(_)) => {
                RemoteError::new(INVALID_ROUTE, err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_the_pair() {
        let err = RouterError::NotFound(RouteKey::new("request", "getX"));
        assert_eq!(err.to_string(), "route not found: request/getX");

        let remote = err.into_remote();
        assert_eq!(remote.code.as_deref(), Some(ROUTE_NOT_FOUND));
        assert!(remote.message.contains("request/getX"));
    }

    #[test]
    fn test_handler_error_passes_through() {
        let original = RemoteError::new("E_DENIED", "no");
        let err = RouterError::Rejected(original.clone());
        assert_eq!(err.into_remote(), original);
    }
}

//! The route registry.

use std::collections::HashMap;

use serde_json::Value;
use tandem_protocol::{kind, service, RemoteError, RouteKey};

use crate::{Route, RouteRequest, RouterError};

/// Maps `type → name → Route`.
///
/// `S` is the state handed to every handler, typically a cheap clone of
/// the client that owns the router.
pub struct Router<S> {
    routes: HashMap<String, HashMap<String, Route<S>>>,
}

impl<S> std::fmt::Debug for Router<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.keys())
            .finish()
    }
}

impl<S: Clone + Send + Sync + 'static> Default for Router<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Router<S> {
    /// A router with no routes at all.
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    /// Every registered pair, sorted.
    pub fn keys(&self) -> Vec<RouteKey> {
        let mut keys: Vec<RouteKey> = self
            .routes
            .iter()
            .flat_map(|(kind, names)| names.keys().map(move |name| RouteKey::new(kind, name)))
            .collect();
        keys.sort_by(|a, b| (&a.kind, &a.name).cmp(&(&b.kind, &b.name)));
        keys
    }

    pub fn contains(&self, kind: &str, name: &str) -> bool {
        self.routes
            .get(kind)
            .is_some_and(|names| names.contains_key(name))
    }

    /// Looks up the route for a pair, cloned so it can be dispatched
    /// without borrowing the router.
    pub fn resolve(&self, kind: &str, name: &str) -> Option<Route<S>> {
        self.routes.get(kind)?.get(name).cloned()
    }

    /// Registers `routes` under `kind`, merging with what is already there.
    ///
    /// Nothing is changed unless every name is valid.
    pub fn set_routes_for_type<N: Into<String>>(
        &mut self,
        kind: &str,
        routes: impl IntoIterator<Item = (N, Route<S>)>,
    ) -> Result<(), RouterError> {
        if kind.is_empty() {
            return Err(RouterError::InvalidType);
        }
        let routes: Vec<(String, Route<S>)> = routes
            .into_iter()
            .map(|(name, route)| (name.into(), route))
            .collect();
        if routes.iter().any(|(name, _)| name.is_empty()) {
            return Err(RouterError::InvalidRouteName(kind.to_owned()));
        }

        let bucket = self.routes.entry(kind.to_owned()).or_default();
        for (name, route) in routes {
            tracing::debug!(kind, name = %name, "route registered");
            bucket.insert(name, route);
        }
        if bucket.is_empty() {
            self.routes.remove(kind);
        }
        Ok(())
    }

    /// Registers a single route.
    pub fn set_route(
        &mut self,
        kind: &str,
        name: &str,
        route: Route<S>,
    ) -> Result<(), RouterError> {
        self.set_routes_for_type(kind, [(name, route)])
    }

    /// Removes the named routes under `kind`. Missing names are ignored;
    /// the bucket goes away with its last route.
    pub fn unset_routes_for_type<N: AsRef<str>>(
        &mut self,
        kind: &str,
        names: impl IntoIterator<Item = N>,
    ) -> Result<(), RouterError> {
        if kind.is_empty() {
            return Err(RouterError::InvalidType);
        }
        let Some(bucket) = self.routes.get_mut(kind) else {
            return Ok(());
        };
        for name in names {
            if bucket.remove(name.as_ref()).is_some() {
                tracing::debug!(kind, name = name.as_ref(), "route removed");
            }
        }
        if bucket.is_empty() {
            self.routes.remove(kind);
        }
        Ok(())
    }
}

impl<S: Clone + Send + Sync + 'static> Router<S> {
    /// A router with the built-in service routes registered:
    ///
    /// - `service/renewToken`: does nothing until the owner replaces it
    /// - `service/updateToken`: acknowledges a peer's token push without
    ///   keeping it; owners that need the token replace this route
    /// - `service/time`: answers with the local epoch-ms clock
    pub fn new() -> Self {
        let mut router = Self::empty();
        router.routes.insert(
            kind::SERVICE.to_owned(),
            HashMap::from([
                (service::RENEW_TOKEN.to_owned(), Route::single(renew_token::<S>)),
                (service::UPDATE_TOKEN.to_owned(), Route::single(update_token::<S>)),
                (service::TIME.to_owned(), Route::single(time::<S>)),
            ]),
        );
        router
    }

    /// Dispatches a request to its route.
    pub async fn route(&self, request: RouteRequest, state: S) -> Result<Value, RouterError> {
        let route = self
            .resolve(&request.service.kind, &request.service.name)
            .ok_or_else(|| {
                RouterError::NotFound(RouteKey::new(
                    &request.service.kind,
                    &request.service.name,
                ))
            })?;
        route.dispatch(request, state).await
    }
}

async fn renew_token<S>(_request: RouteRequest, _state: S) -> Result<Value, RemoteError> {
    tracing::debug!("renewToken requested but no renewal is wired");
    Ok(Value::Null)
}

async fn update_token<S>(_request: RouteRequest, _state: S) -> Result<Value, RemoteError> {
    tracing::debug!("peer pushed a new token");
    Ok(Value::Null)
}

async fn time<S>(_request: RouteRequest, _state: S) -> Result<Value, RemoteError> {
    Ok(Value::from(chrono::Utc::now().timestamp_millis()))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ok(_req: RouteRequest, _state: ()) -> Result<Value, RemoteError> {
        Ok(Value::Null)
    }

    #[test]
    fn test_new_registers_service_routes() {
        let router: Router<()> = Router::new();
        assert!(router.contains(kind::SERVICE, service::RENEW_TOKEN));
        assert!(router.contains(kind::SERVICE, service::UPDATE_TOKEN));
        assert!(router.contains(kind::SERVICE, service::TIME));
        assert_eq!(router.keys().len(), 3);
    }

    #[test]
    fn test_set_routes_merges_into_bucket() {
        let mut router: Router<()> = Router::empty();
        router
            .set_routes_for_type("request", [("a", Route::single(ok))])
            .unwrap();
        router
            .set_routes_for_type("request", [("b", Route::single(ok))])
            .unwrap();
        assert!(router.contains("request", "a"));
        assert!(router.contains("request", "b"));
    }

    #[test]
    fn test_set_routes_rejects_empty_type_and_names() {
        let mut router: Router<()> = Router::empty();
        assert_eq!(
            router
                .set_routes_for_type("", [("a", Route::single(ok))])
                .unwrap_err(),
            RouterError::InvalidType
        );
        let err = router
            .set_routes_for_type("request", [("a", Route::single(ok)), ("", Route::single(ok))])
            .unwrap_err();
        assert_eq!(err, RouterError::InvalidRouteName("request".into()));
        // All-or-nothing: the valid name was not registered either.
        assert!(!router.contains("request", "a"));
    }

    #[test]
    fn test_unset_removes_empty_bucket() {
        let mut router: Router<()> = Router::empty();
        router
            .set_routes_for_type("request", [("a", Route::single(ok)), ("b", Route::single(ok))])
            .unwrap();
        router.unset_routes_for_type("request", ["a"]).unwrap();
        assert_eq!(router.keys(), vec![RouteKey::new("request", "b")]);
        router.unset_routes_for_type("request", ["b", "missing"]).unwrap();
        assert!(router.keys().is_empty());
        router.unset_routes_for_type("nothing", ["x"]).unwrap();
    }
}

//! Handlers and routes.
//!
//! Every handler has the same shape: it takes the request and a clone of
//! the shared state, and returns a future of `Result<Value, RemoteError>`.
//! A handler with nothing to wait on simply returns a ready future, so the
//! router never needs to know which kind it is calling.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::{join_all, BoxFuture};
use serde_json::Value;
use tandem_protocol::{RemoteError, ServiceData};

use crate::RouterError;

/// What a handler gets to see of an incoming message.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub service: ServiceData,
    pub cred: Option<Value>,
    pub payload: Value,
}

/// The future every handler returns.
pub type HandlerFuture = BoxFuture<'static, Result<Value, RemoteError>>;

/// A route handler or guard.
///
/// Implemented for every `Fn(RouteRequest, S) -> impl Future` closure with
/// the right output, so plain `async` closures and functions work:
///
/// ```
/// # use tandem_router::{Route, RouteRequest};
/// # use tandem_protocol::RemoteError;
/// # use serde_json::Value;
/// async fn echo(req: RouteRequest, _state: ()) -> Result<Value, RemoteError> {
///     Ok(req.payload)
/// }
/// let route: Route<()> = Route::single(echo);
/// ```
pub trait Handler<S>: Send + Sync + 'static {
    fn call(&self, request: RouteRequest, state: S) -> HandlerFuture;
}

impl<S, F, Fut> Handler<S> for F
where
    F: Fn(RouteRequest, S) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RemoteError>> + Send + 'static,
{
    fn call(&self, request: RouteRequest, state: S) -> HandlerFuture {
        Box::pin(self(request, state))
    }
}

/// A shareable, type-erased handler.
pub type BoxHandler<S> = Arc<dyn Handler<S>>;

/// Erases a handler's type.
pub fn boxed<S>(handler: impl Handler<S>) -> BoxHandler<S> {
    Arc::new(handler)
}

// ---------------------------------------------------------------------------
// Route
// ---------------------------------------------------------------------------

/// What is registered under a `(type, name)` pair.
pub enum Route<S> {
    /// One handler, called directly.
    Single(BoxHandler<S>),
    /// Guards that must all succeed before the terminal handler runs.
    ///
    /// The guards run concurrently and each one runs to completion. If any
    /// failed, the first failure in guard order is reported and the
    /// terminal handler is never called.
    Guarded {
        guards: Vec<BoxHandler<S>>,
        terminal: BoxHandler<S>,
    },
}

impl<S> Clone for Route<S> {
    fn clone(&self) -> Self {
        match self {
            Route::Single(handler) => Route::Single(Arc::clone(handler)),
            Route::Guarded { guards, terminal } => Route::Guarded {
                guards: guards.clone(),
                terminal: Arc::clone(terminal),
            },
        }
    }
}

impl<S> std::fmt::Debug for Route<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Route::Single(_) => f.write_str("Route::Single"),
            Route::Guarded { guards, .. } => f
                .debug_struct("Route::Guarded")
                .field("guards", &guards.len())
                .finish_non_exhaustive(),
        }
    }
}

impl<S: Clone + Send + Sync + 'static> Route<S> {
    pub fn single(handler: impl Handler<S>) -> Self {
        Route::Single(boxed(handler))
    }

    /// A terminal handler behind `guards`. No guards means a plain
    /// [`Route::Single`].
    pub fn guarded(guards: Vec<BoxHandler<S>>, terminal: impl Handler<S>) -> Self {
        let terminal = boxed(terminal);
        if guards.is_empty() {
            Route::Single(terminal)
        } else {
            Route::Guarded { guards, terminal }
        }
    }

    /// Adds one more guard in front of this route.
    pub fn with_guard(self, guard: impl Handler<S>) -> Self {
        let guard = boxed(guard);
        match self {
            Route::Single(terminal) => Route::Guarded {
                guards: vec![guard],
                terminal,
            },
            Route::Guarded {
                mut guards,
                terminal,
            } => {
                guards.push(guard);
                Route::Guarded { guards, terminal }
            }
        }
    }

    /// Runs the route.
    pub async fn dispatch(&self, request: RouteRequest, state: S) -> Result<Value, RouterError> {
        match self {
            Route::Single(handler) => handler
                .call(request, state)
                .await
                .map_err(RouterError::Handler),
            Route::Guarded { guards, terminal } => {
                let checks = guards
                    .iter()
                    .map(|guard| guard.call(request.clone(), state.clone()));
                // Every guard settles; the first refusal in guard order wins.
                for outcome in join_all(checks).await {
                    outcome.map_err(RouterError::Rejected)?;
                }
                terminal
                    .call(request, state)
                    .await
                    .map_err(RouterError::Handler)
            }
        }
    }
}

//! Routing for Tandem.
//!
//! A [`Router`] maps a message's `(type, name)` pair to a [`Route`]: either
//! a single handler, or a terminal handler behind guards that all have to
//! succeed first.
//!
//! ```text
//! RouteRequest ──▶ Router::route ──▶ Route::Single(handler)
//!                                └─▶ Route::Guarded { guards ∥ , terminal }
//! ```

mod error;
mod route;
mod router;

pub use error::{RouterError, INVALID_ROUTE, ROUTE_NOT_FOUND};
pub use route::{boxed, BoxHandler, Handler, HandlerFuture, Route, RouteRequest};
pub use router::Router;

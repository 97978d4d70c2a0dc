//! # Tandem
//!
//! A bidirectional request/response and event protocol over persistent
//! sockets.
//!
//! Either end of a Tandem link can send requests, answer requests and emit
//! events. A [`Client`] is one end: it keeps its connection alive
//! (reconnecting with backoff, pinging, buffering unsent messages),
//! correlates responses with the requests that caused them, and routes
//! incoming requests and events to handlers.
//!
//! ## Layers
//!
//! ```text
//! tandem_transport   sockets (WebSocket, in-memory)
//! tandem_connection  lifecycle state machine, ping, reconnect, history
//! tandem_protocol    envelopes and the Messenger codec
//! tandem_router      (type, name) → guarded handlers
//! tandem             Client: correlation, tokens, clock offset
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tandem::prelude::*;
//! use tandem::transport::WebSocketConnector;
//!
//! # async fn run() -> Result<(), ClientError> {
//! let client = Client::builder()
//!     .uri("ws://127.0.0.1:9000")
//!     .dial(WebSocketConnector)?;
//! client.connect().await?;
//! let sum = client.send_request("add", serde_json::json!({"a": 1, "b": 2})).await?;
//! # let _ = sum;
//! # Ok(())
//! # }
//! ```

mod builder;
mod client;
mod config;
mod driver;
mod error;
mod token;

pub use builder::ClientBuilder;
pub use client::{Client, Incoming, RENEW_TOKEN_FAILED};
pub use config::ClientConfig;
pub use error::ClientError;
pub use token::{MemoryTokenStore, TokenProvider, TokenStore};

pub use tandem_connection as connection;
pub use tandem_protocol as protocol;
pub use tandem_router as router;
pub use tandem_transport as transport;

/// The types most applications need.
pub mod prelude {
    pub use crate::{
        Client, ClientBuilder, ClientConfig, ClientError, Incoming, MemoryTokenStore,
        TokenProvider, TokenStore,
    };
    pub use tandem_connection::{ConnectionConfig, ConnectionState};
    pub use tandem_protocol::{kind, service, MessengerConfig, RemoteError};
    pub use tandem_router::{Route, RouteRequest};
}

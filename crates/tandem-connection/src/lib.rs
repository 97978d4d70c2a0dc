//! Connection lifecycle for Tandem.
//!
//! A [`Connection`] owns exactly one socket at a time and keeps it healthy:
//!
//! 1. **State machines**: [`ConnectionState`] and [`ConnectionActivity`],
//!    each with a pure transition table
//! 2. **Liveness**: a `"ping"`/`"pong"` heartbeat that spots a silent peer
//!    and forces a disconnect
//! 3. **Reconnection**: short then long backoff for dialed connections;
//!    accepted (slave) connections never reconnect on their own
//! 4. **History**: payloads sent while the link is down are buffered and
//!    replayed in order once it is back
//!
//! # How it fits in the stack
//!
//! ```text
//! Client (above)  ← packs envelopes, correlates responses
//!     ↕
//! Connection (this crate)  ← socket lifecycle, gating, heartbeat
//!     ↕
//! Transport (below)  ← Connector / Socket implementations
//! ```

mod close_code;
mod config;
mod connection;
mod error;
mod event;
mod history;
mod state;

pub use close_code::{close_reason, NO_STATUS_RECEIVED};
pub use config::ConnectionConfig;
pub use connection::{Connection, Delivery, PING, PONG};
pub use error::{ConnectionError, TransitionError};
pub use event::ConnectionEvent;
pub use history::{History, DEFAULT_HISTORY_CAPACITY};
pub use state::{ConnectionActivity, ConnectionState, ConnectionStatus};

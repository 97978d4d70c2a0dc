//! Wire protocol for Tandem.
//!
//! This crate defines the "language" both endpoints speak:
//!
//! - **Types** ([`Envelope`], [`ServiceData`], [`ErrorReport`],
//!   [`RemoteError`], the [`kind`] and [`service`] constants): the
//!   structures that travel on the wire.
//! - **Messenger** ([`Messenger`]): packs payloads into envelopes,
//!   validates incoming envelopes, and unpacks them again.
//! - **Errors** ([`ProtocolError`]): what can go wrong along the way.
//!
//! # Architecture
//!
//! The protocol layer sits between the connection (raw JSON values) and the
//! router/client (typed exchanges). It knows nothing about sockets or
//! handlers; it only knows what a well-formed, authorized envelope is.
//!
//! ```text
//! Connection (JSON) → Protocol (Envelope) → Client / Router
//! ```

mod error;
mod messenger;
mod types;

pub use error::ProtocolError;
pub use messenger::{
    CredentialValidator, ErrorWrapper, Messenger, MessengerConfig,
    PayloadWrapper,
};
pub use types::{
    kind, service, Envelope, ErrorReport, RemoteError, RouteKey, ServiceData,
    ServiceFields, Unpacked,
};

//! Socket abstraction layer for Tandem.
//!
//! Provides the [`Connector`], [`Socket`] and [`Listener`] traits that
//! abstract over message-oriented, full-duplex transports. A transport is
//! expected to deliver whole text messages; framing is its job, not ours.
//!
//! # Feature Flags
//!
//! - `websocket` (default): WebSocket transport via `tokio-tungstenite`
//! - `memory`: in-process loopback transport, handy for tests and for
//!   wiring two peers inside one process

mod error;
#[cfg(feature = "memory")]
pub mod memory;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConnector, WebSocketListener, WebSocketSocket};

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for generating unique socket IDs across all transports.
static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_socket_id() -> SocketId {
    SocketId::new(NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed))
}

/// Close code reported when a socket goes away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used for deliberate, clean shutdowns.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Opaque identifier for a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(u64);

impl SocketId {
    /// Creates a new `SocketId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socket-{}", self.0)
    }
}

/// One unit received from a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A whole text message.
    Text(String),
    /// The socket closed. Carries the close code when the peer sent one.
    Close(Option<u16>),
}

/// Opens outbound sockets. Held by connections that are allowed to dial
/// (and therefore to reconnect).
pub trait Connector: Send + Sync + 'static {
    /// The socket type produced by this connector.
    type Socket: Socket;

    /// Opens a socket to `uri`.
    fn open(
        &self,
        uri: &str,
    ) -> impl Future<Output = Result<Self::Socket, TransportError>> + Send;
}

/// Accepts inbound sockets on the listening side.
pub trait Listener: Send + Sync + 'static {
    /// The socket type produced by this listener.
    type Socket: Socket;

    /// Waits for and accepts the next incoming socket.
    fn accept(
        &mut self,
    ) -> impl Future<Output = Result<Self::Socket, TransportError>> + Send;

    /// Gracefully shuts down the listener, stopping new sockets.
    fn shutdown(&self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A single open socket that can send and receive text messages.
///
/// `send` and `recv` may be awaited concurrently from different tasks.
pub trait Socket: Send + Sync + 'static {
    /// Sends a text message to the remote peer.
    fn send(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame from the remote peer.
    ///
    /// After a [`Frame::Close`] or an error, the socket is finished.
    fn recv(&self) -> impl Future<Output = Result<Frame, TransportError>> + Send;

    /// Starts a clean close handshake with the given close code.
    fn close(
        &self,
        code: u16,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Drops the socket abruptly, without a close handshake.
    fn terminate(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the unique identifier for this socket.
    fn id(&self) -> SocketId;
}

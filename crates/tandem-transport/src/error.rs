/// Errors that can occur in the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Opening a socket to the remote endpoint failed.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The socket was closed.
    #[error("socket closed: {0}")]
    Closed(String),

    /// Sending data failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Receiving data failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Binding or accepting sockets failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// The listener was shut down.
    #[error("transport shut down")]
    Shutdown,
}

//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! Dialed and accepted sockets share one stream type
//! (`MaybeTlsStream<TcpStream>`), so a master and a slave connection speak
//! through the same [`WebSocketSocket`].

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{
    next_socket_id, Connector, Frame, Listener, Socket, SocketId,
    TransportError, ABNORMAL_CLOSURE,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dials WebSocket URIs (`ws://` / `wss://` as enabled in tungstenite).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    type Socket = WebSocketSocket;

    async fn open(&self, uri: &str) -> Result<WebSocketSocket, TransportError> {
        let (ws, _response) = tokio_tungstenite::connect_async(uri)
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;
        let socket = WebSocketSocket::new(ws);
        tracing::debug!(id = %socket.id, uri, "opened WebSocket");
        Ok(socket)
    }
}

/// A WebSocket [`Listener`] that accepts incoming sockets.
pub struct WebSocketListener {
    listener: TcpListener,
}

impl WebSocketListener {
    /// Binds a new WebSocket listener to the given address.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "WebSocket listener bound");
        Ok(Self { listener })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for WebSocketListener {
    type Socket = WebSocketSocket;

    async fn accept(&mut self) -> Result<WebSocketSocket, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;

        let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| {
                TransportError::AcceptFailed(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    e,
                ))
            })?;

        let socket = WebSocketSocket::new(ws);
        tracing::debug!(id = %socket.id, %addr, "accepted WebSocket");
        Ok(socket)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// A single WebSocket, split so sends never wait behind a pending receive.
pub struct WebSocketSocket {
    id: SocketId,
    sink: Mutex<SplitSink<WsStream, Message>>,
    stream: Mutex<SplitStream<WsStream>>,
    terminated: AtomicBool,
    halt: Notify,
}

impl WebSocketSocket {
    fn new(ws: WsStream) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id: next_socket_id(),
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            terminated: AtomicBool::new(false),
            halt: Notify::new(),
        }
    }
}

fn broken_pipe(e: tokio_tungstenite::tungstenite::Error) -> TransportError {
    TransportError::SendFailed(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        e,
    ))
}

impl Socket for WebSocketSocket {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(TransportError::Closed("terminated".into()));
        }
        self.sink
            .lock()
            .await
            .send(Message::text(text.to_owned()))
            .await
            .map_err(broken_pipe)
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        loop {
            if self.terminated.load(Ordering::Acquire) {
                return Ok(Frame::Close(Some(ABNORMAL_CLOSURE)));
            }
            let mut stream = self.stream.lock().await;
            let next = tokio::select! {
                msg = stream.next() => msg,
                () = self.halt.notified() => {
                    return Ok(Frame::Close(Some(ABNORMAL_CLOSURE)));
                }
            };
            match next {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Frame::Text(text.as_str().to_owned()));
                }
                Some(Ok(Message::Binary(data))) => {
                    match String::from_utf8(data.to_vec()) {
                        Ok(text) => return Ok(Frame::Text(text)),
                        Err(_) => {
                            tracing::debug!(id = %self.id, "dropping non-UTF-8 binary frame");
                            continue;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Frame::Close(frame.map(|f| u16::from(f.code))));
                }
                None => return Ok(Frame::Close(Some(ABNORMAL_CLOSURE))),
                Some(Ok(_)) => continue, // protocol ping/pong, raw frames
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(
                        std::io::Error::new(
                            std::io::ErrorKind::ConnectionReset,
                            e,
                        ),
                    ));
                }
            }
        }
    }

    async fn close(&self, code: u16) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: String::new().into(),
        };
        self.sink
            .lock()
            .await
            .send(Message::Close(Some(frame)))
            .await
            .map_err(broken_pipe)
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        // The TCP stream goes away once the owner drops the socket; until then
        // the reader is woken up with an abnormal closure.
        self.terminated.store(true, Ordering::Release);
        self.halt.notify_one();
        Ok(())
    }

    fn id(&self) -> SocketId {
        self.id
    }
}

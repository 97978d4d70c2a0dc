//! In-process loopback transport.
//!
//! Two [`MemorySocket`]s created by [`pair`] are wired back to back through
//! unbounded channels. [`listener`] returns a connector/listener pair that
//! behaves like a tiny server: every successful `open` hands the far end of
//! a fresh pair to the listener.
//!
//! The connector can be switched to refuse dials, and it remembers every URI
//! it was asked to open, which is what the connection tests lean on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{mpsc, Mutex};

use crate::{
    next_socket_id, Connector, Frame, Listener, Socket, SocketId,
    TransportError, ABNORMAL_CLOSURE,
};

/// Creates two connected sockets.
pub fn pair() -> (MemorySocket, MemorySocket) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a = MemorySocket::new(b_tx.clone(), a_tx.clone(), a_rx);
    let b = MemorySocket::new(a_tx, b_tx, b_rx);
    (a, b)
}

/// Creates a connector and the listener that receives its sockets.
pub fn listener() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = MemoryConnector {
        accepted: tx,
        available: Arc::new(AtomicBool::new(true)),
        dialed: Arc::new(StdMutex::new(Vec::new())),
    };
    (connector, MemoryListener { accepted: rx })
}

/// One end of an in-process socket pair.
pub struct MemorySocket {
    id: SocketId,
    peer: mpsc::UnboundedSender<Frame>,
    own: mpsc::UnboundedSender<Frame>,
    inbox: Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: AtomicBool,
}

impl MemorySocket {
    fn new(
        peer: mpsc::UnboundedSender<Frame>,
        own: mpsc::UnboundedSender<Frame>,
        inbox: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            id: next_socket_id(),
            peer,
            own,
            inbox: Mutex::new(inbox),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns `true` once either side closed or terminated the pair.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn shut(&self, code: u16) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.peer.send(Frame::Close(Some(code)));
        let _ = self.own.send(Frame::Close(Some(code)));
    }
}

impl Socket for MemorySocket {
    async fn send(&self, text: &str) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed(format!("{} is closed", self.id)));
        }
        self.peer
            .send(Frame::Text(text.to_owned()))
            .map_err(|_| TransportError::Closed("peer dropped".into()))
    }

    async fn recv(&self) -> Result<Frame, TransportError> {
        let frame = self
            .inbox
            .lock()
            .await
            .recv()
            .await
            .unwrap_or(Frame::Close(Some(ABNORMAL_CLOSURE)));
        if matches!(frame, Frame::Close(_)) {
            self.closed.store(true, Ordering::Release);
        }
        Ok(frame)
    }

    async fn close(&self, code: u16) -> Result<(), TransportError> {
        self.shut(code);
        Ok(())
    }

    async fn terminate(&self) -> Result<(), TransportError> {
        self.shut(ABNORMAL_CLOSURE);
        Ok(())
    }

    fn id(&self) -> SocketId {
        self.id
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            let _ = self.peer.send(Frame::Close(Some(ABNORMAL_CLOSURE)));
        }
    }
}

/// Dials the paired [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemorySocket>,
    available: Arc<AtomicBool>,
    dialed: Arc<StdMutex<Vec<String>>>,
}

impl MemoryConnector {
    /// When `false`, every subsequent `open` fails with a refused connection.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Every URI passed to `open`, refused dials included.
    pub fn dialed(&self) -> Vec<String> {
        self.dialed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `open` calls so far.
    pub fn dial_count(&self) -> usize {
        self.dialed.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Connector for MemoryConnector {
    type Socket = MemorySocket;

    async fn open(&self, uri: &str) -> Result<MemorySocket, TransportError> {
        self.dialed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(uri.to_owned());
        if !self.available.load(Ordering::Acquire) {
            return Err(TransportError::ConnectFailed(format!(
                "{uri}: connection refused"
            )));
        }
        let (local, remote) = pair();
        self.accepted
            .send(remote)
            .map_err(|_| TransportError::ConnectFailed("listener dropped".into()))?;
        Ok(local)
    }
}

/// Receives the far ends of sockets opened through a [`MemoryConnector`].
pub struct MemoryListener {
    accepted: mpsc::UnboundedReceiver<MemorySocket>,
}

impl Listener for MemoryListener {
    type Socket = MemorySocket;

    async fn accept(&mut self) -> Result<MemorySocket, TransportError> {
        self.accepted.recv().await.ok_or(TransportError::Shutdown)
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

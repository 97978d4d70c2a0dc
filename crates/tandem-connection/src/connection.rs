//! The connection actor and its handle.
//!
//! Each connection runs as its own tokio task (an "actor") that owns
//! everything mutable: the current socket, both state machines, the
//! history buffer and three timers. Nothing else touches that state. The
//! rest of the program talks to the actor through a [`Connection`] handle
//! over a command channel.
//!
//! ```text
//! Connection (handle) ──commands──▶ ┌────────────────────┐
//!                                   │  ConnectionActor   │──events──▶ subscribers
//! socket tasks ───────signals─────▶ │  state / activity  │
//!                                   │  history / timers  │──status──▶ watch
//!                                   └────────────────────┘
//! ```
//!
//! Every socket the actor opens gets a generation number. Reader and
//! dialer tasks tag their signals with it, and the actor drops any signal
//! whose generation is not the current one. That is how a socket that was
//! forcibly abandoned stays quiet even if its close frame shows up late.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use rand::Rng;
use serde_json::Value;
use tandem_protocol::{kind, service};
use tandem_transport::{
    Connector, Frame, Socket, TransportError, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::close_code::{close_reason, NO_STATUS_RECEIVED};
use crate::{
    ConnectionActivity, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionState, ConnectionStatus, History,
};

/// Liveness request, sent as a bare text frame.
pub const PING: &str = "ping";
/// Liveness answer, sent as a bare text frame.
pub const PONG: &str = "pong";

/// Capacity of the command channel between handle and actor.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// What happened to a payload handed to [`Connection::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Written to the socket.
    Sent,
    /// Stored in history; it goes out when the connection is ready.
    Queued,
}

// ---------------------------------------------------------------------------
// Commands and signals
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, ConnectionError>>;

enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Terminate,
    Authorize(Reply<()>),
    Deauthorize(Reply<()>),
    SetToken(Option<String>),
    Send {
        payload: Value,
        require_secure: bool,
        reply: Reply<Delivery>,
    },
    Subscribe(mpsc::UnboundedSender<ConnectionEvent>),
    Destroy(oneshot::Sender<()>),
}

/// Reports from the dialer and reader tasks, tagged with the socket
/// generation they belong to.
enum Signal<S> {
    Opened { generation: u64, socket: Arc<S> },
    OpenFailed { generation: u64, error: TransportError },
    Text { generation: u64, text: String },
    Closed { generation: u64, code: Option<u16> },
    Failed { generation: u64, error: TransportError },
}

impl<S> Signal<S> {
    fn generation(&self) -> u64 {
        match self {
            Signal::Opened { generation, .. }
            | Signal::OpenFailed { generation, .. }
            | Signal::Text { generation, .. }
            | Signal::Closed { generation, .. }
            | Signal::Failed { generation, .. } => *generation,
        }
    }
}

type Dialer<S> =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<S, TransportError>> + Send + Sync>;

// ---------------------------------------------------------------------------
// Connection (handle)
// ---------------------------------------------------------------------------

/// A handle to a connection actor.
///
/// Cheap to clone. When the last handle is dropped the actor shuts down
/// exactly as if [`destroy`](Self::destroy) had been called.
#[derive(Clone)]
pub struct Connection {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Connection {
    /// Creates a master connection that dials through `connector`.
    ///
    /// Nothing is dialed until [`connect`](Self::connect) is called.
    pub fn dial<C: Connector>(connector: C, config: ConnectionConfig) -> Self {
        Self::dial_inner(connector, config, Vec::new())
    }

    /// Like [`dial`](Self::dial), with a subscriber registered before the
    /// actor starts.
    pub fn dial_with_events<C: Connector>(
        connector: C,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::dial_inner(connector, config, vec![tx]), rx)
    }

    /// Wraps a socket accepted by a listener.
    ///
    /// The connection is treated as opened immediately. It is a slave: once
    /// the socket goes away it stays down, since reconnecting is the
    /// remote side's job.
    pub fn accept<S: Socket>(socket: S, config: ConnectionConfig) -> Self {
        Self::spawn(None, Some(socket), config, Vec::new())
    }

    /// Like [`accept`](Self::accept), with a subscriber registered before
    /// the actor starts, so even the initial `Opened` is seen.
    pub fn accept_with_events<S: Socket>(
        socket: S,
        config: ConnectionConfig,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::spawn(None, Some(socket), config, vec![tx]), rx)
    }

    fn dial_inner<C: Connector>(
        connector: C,
        config: ConnectionConfig,
        subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Self {
        let connector = Arc::new(connector);
        let dialer: Dialer<C::Socket> = Arc::new(move |uri: String| {
            let connector = Arc::clone(&connector);
            async move { connector.open(&uri).await }.boxed()
        });
        Self::spawn(Some(dialer), None, config, subscribers)
    }

    fn spawn<S: Socket>(
        dialer: Option<Dialer<S>>,
        opened: Option<S>,
        config: ConnectionConfig,
        subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Self {
        let config = config.validated();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();

        let mut actor = ConnectionActor {
            history: History::new(config.history_capacity),
            config,
            dialer,
            token: None,
            state: ConnectionState::NotConnected,
            activity: ConnectionActivity::Idle,
            attempts: 0,
            last_error: None,
            liveness: Liveness::Alive,
            socket: Slot::Empty,
            generation: 0,
            reader: None,
            planned_disconnect: false,
            subscribers,
            status: status_tx,
            commands: command_rx,
            signal_tx,
            signals: signal_rx,
            next_ping: None,
            next_reconnect: None,
            force_disconnect_at: None,
        };

        if let Some(socket) = opened {
            actor.generation = 1;
            actor.socket = Slot::Opening;
            let _ = actor.signal_tx.send(Signal::Opened {
                generation: 1,
                socket: Arc::new(socket),
            });
        }

        tokio::spawn(actor.run());

        Self {
            commands: command_tx,
            status: status_rx,
        }
    }

    async fn command(&self, command: Command) -> Result<(), ConnectionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ConnectionError::Destroyed)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, ConnectionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(make(reply_tx)).await?;
        reply_rx.await.map_err(|_| ConnectionError::Destroyed)?
    }

    /// Dials the configured URI.
    ///
    /// Returns once the dial has started. The outcome arrives as events:
    /// `Opened` on success, `Error` plus a scheduled reconnect on failure.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.command(Command::Connect).await
    }

    /// Closes the socket cleanly.
    ///
    /// A connection that was alive when disconnected dials again right
    /// away; use [`destroy`](Self::destroy) to stop for good.
    pub async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.command(Command::Disconnect).await
    }

    /// Disconnects an open socket, or dials immediately if none is open.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        self.command(Command::Reconnect).await
    }

    /// Drops the socket without a close handshake.
    pub async fn terminate(&self) -> Result<(), ConnectionError> {
        self.command(Command::Terminate).await
    }

    /// Promotes an open connection from `Connected` to `Authorized`.
    pub async fn authorize(&self) -> Result<(), ConnectionError> {
        self.request(Command::Authorize).await
    }

    /// Demotes an open connection from `Authorized` to `Connected`.
    pub async fn deauthorize(&self) -> Result<(), ConnectionError> {
        self.request(Command::Deauthorize).await
    }

    /// Stores the token used to build the next connect URI.
    pub async fn set_token(&self, token: Option<String>) -> Result<(), ConnectionError> {
        self.command(Command::SetToken(token)).await
    }

    /// Sends a JSON payload, or queues it if the connection isn't ready.
    ///
    /// With `require_secure` the connection must be `Authorized`; without
    /// it `Connected` is enough. Not being ready is not an error: the
    /// payload goes to history and the result is [`Delivery::Queued`].
    pub async fn send(
        &self,
        payload: Value,
        require_secure: bool,
    ) -> Result<Delivery, ConnectionError> {
        self.request(|reply| Command::Send {
            payload,
            require_secure,
            reply,
        })
        .await
    }

    /// Registers a new event subscriber.
    pub async fn subscribe(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<ConnectionEvent>, ConnectionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.command(Command::Subscribe(tx)).await?;
        Ok(rx)
    }

    /// The current status snapshot.
    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Stops all timers, closes the socket and drops every subscriber.
    ///
    /// Terminal: every later call on any handle fails with
    /// [`ConnectionError::Destroyed`]. Destroying twice is harmless.
    pub async fn destroy(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.command(Command::Destroy(reply_tx)).await.is_ok() {
            let _ = reply_rx.await;
        }
    }

    /// Returns `true` once the actor has shut down.
    pub fn is_destroyed(&self) -> bool {
        self.commands.is_closed()
    }
}

// ---------------------------------------------------------------------------
// ConnectionActor
// ---------------------------------------------------------------------------

/// Two-phase liveness: a ping flips `Alive` to `Suspect`, any ping or pong
/// from the peer flips it back. A tick that finds `Suspect` means the peer
/// missed a whole period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Alive,
    Suspect,
}

enum Slot<S> {
    Empty,
    Opening,
    Open(Arc<S>),
}

struct ConnectionActor<S: Socket> {
    config: ConnectionConfig,
    /// `None` for slave connections.
    dialer: Option<Dialer<S>>,
    token: Option<String>,

    state: ConnectionState,
    activity: ConnectionActivity,
    attempts: u32,
    last_error: Option<String>,
    liveness: Liveness,

    socket: Slot<S>,
    generation: u64,
    reader: Option<JoinHandle<()>>,
    /// Set by a deliberate disconnect of a live socket; consumed when the
    /// state reaches `NotConnected`.
    planned_disconnect: bool,

    history: History,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionEvent>>,
    status: watch::Sender<ConnectionStatus>,

    commands: mpsc::Receiver<Command>,
    signal_tx: mpsc::UnboundedSender<Signal<S>>,
    signals: mpsc::UnboundedReceiver<Signal<S>>,

    next_ping: Option<Instant>,
    next_reconnect: Option<Instant>,
    force_disconnect_at: Option<Instant>,
}

impl<S: Socket> ConnectionActor<S> {
    async fn run(mut self) {
        tracing::debug!(uri = %self.config.uri, slave = self.dialer.is_none(), "connection actor started");

        loop {
            tokio::select! {
                // Commands first, so a destroy is never starved by traffic.
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Destroy(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },

                Some(signal) = self.signals.recv() => self.handle_signal(signal).await,

                () = sleep_until(self.force_disconnect_at) => self.force_disconnect().await,

                () = sleep_until(self.next_ping) => self.ping_tick().await,

                () = sleep_until(self.next_reconnect) => self.reconnect_tick(),
            }
        }

        tracing::debug!(uri = %self.config.uri, "connection actor stopped");
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect => self.connect(),
            Command::Disconnect => self.disconnect().await,
            Command::Reconnect => {
                if matches!(self.socket, Slot::Open(_)) {
                    self.disconnect().await;
                } else {
                    self.connect();
                }
            }
            Command::Terminate => self.terminate().await,
            Command::Authorize(reply) => {
                let _ = reply.send(self.authorize().await);
            }
            Command::Deauthorize(reply) => {
                let _ = reply.send(self.deauthorize());
            }
            Command::SetToken(token) => self.token = token,
            Command::Send {
                payload,
                require_secure,
                reply,
            } => {
                let _ = reply.send(self.send(payload, require_secure).await);
            }
            Command::Subscribe(tx) => self.subscribers.push(tx),
            // Handled in `run`.
            Command::Destroy(_) => {}
        }
    }

    async fn handle_signal(&mut self, signal: Signal<S>) {
        if signal.generation() != self.generation {
            tracing::trace!(
                stale = signal.generation(),
                current = self.generation,
                "ignoring signal from retired socket"
            );
            return;
        }

        match signal {
            Signal::Opened { socket, .. } => self.handle_opened(socket).await,
            Signal::OpenFailed { error, .. } => self.handle_open_failed(error),
            Signal::Text { text, .. } => self.handle_text(text).await,
            Signal::Closed { code, .. } => {
                let code = code.unwrap_or(NO_STATUS_RECEIVED);
                let orderly = self.activity == ConnectionActivity::Closing;
                self.socket_gone(code, orderly);
            }
            Signal::Failed { error, .. } => {
                tracing::warn!(error = %error, "socket error");
                self.last_error = Some(error.to_string());
                self.emit(ConnectionEvent::Error(error.to_string()));
                let orderly = self.activity == ConnectionActivity::Terminating;
                self.socket_gone(ABNORMAL_CLOSURE, orderly);
            }
        }
    }

    // -- Opening --

    fn connect(&mut self) {
        let Some(dialer) = self.dialer.clone() else {
            tracing::debug!("slave connection does not dial");
            return;
        };
        if !matches!(self.socket, Slot::Empty) {
            tracing::debug!("connect ignored, a socket is already present");
            return;
        }
        if self.config.secure && self.token.is_none() {
            tracing::info!("secure connection has no token yet, deferring connect");
            self.schedule_reconnect();
            return;
        }

        self.attempts = self.attempts.saturating_add(1);
        let uri = self.config.connect_uri(self.token.as_deref());
        self.set_activity(ConnectionActivity::Connecting);
        self.liveness = Liveness::Alive;
        self.generation += 1;
        self.socket = Slot::Opening;
        self.publish_status();

        tracing::info!(uri = %self.config.uri, attempt = self.attempts, "connecting");

        let generation = self.generation;
        let signals = self.signal_tx.clone();
        tokio::spawn(async move {
            let signal = match dialer(uri).await {
                Ok(socket) => Signal::Opened {
                    generation,
                    socket: Arc::new(socket),
                },
                Err(error) => Signal::OpenFailed { generation, error },
            };
            let _ = signals.send(signal);
        });
    }

    async fn handle_opened(&mut self, socket: Arc<S>) {
        tracing::info!(socket = %socket.id(), "socket opened");

        self.reader = Some(tokio::spawn(read_loop(
            Arc::clone(&socket),
            self.generation,
            self.signal_tx.clone(),
        )));
        self.socket = Slot::Open(socket);
        self.attempts = 0;
        self.last_error = None;
        self.liveness = Liveness::Alive;
        self.next_reconnect = None;

        self.set_state(ConnectionState::Connected);
        if self.activity != ConnectionActivity::Idle {
            self.set_activity(ConnectionActivity::Idle);
        }
        if self.config.secure {
            // A successful open of a secure connection already passed the
            // token check on the other side.
            self.set_activity(ConnectionActivity::Authorizing);
            self.set_state(ConnectionState::Authorized);
            self.set_activity(ConnectionActivity::Idle);
        }

        self.next_ping = Some(Instant::now() + self.config.ping_interval);
        self.emit(ConnectionEvent::Opened);
        self.drain_history().await;
    }

    fn handle_open_failed(&mut self, error: TransportError) {
        tracing::warn!(error = %error, attempt = self.attempts, "connect failed");
        self.socket = Slot::Empty;
        self.last_error = Some(error.to_string());
        self.emit(ConnectionEvent::Error(error.to_string()));
        if self.activity != ConnectionActivity::Idle {
            self.set_activity(ConnectionActivity::Idle);
        }
        self.set_state(ConnectionState::Errored);
        self.set_state(ConnectionState::NotConnected);
    }

    // -- Inbound --

    async fn handle_text(&mut self, text: String) {
        match text.as_str() {
            PING => {
                self.liveness = Liveness::Alive;
                if let Slot::Open(socket) = &self.socket {
                    let socket = Arc::clone(socket);
                    if let Err(e) = socket.send(PONG).await {
                        tracing::debug!(error = %e, "failed to answer ping");
                    }
                }
            }
            PONG => self.liveness = Liveness::Alive,
            _ => match serde_json::from_str::<Value>(&text) {
                Ok(value) => {
                    tracing::trace!(len = text.len(), "message received");
                    self.emit(ConnectionEvent::Message(value));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "dropping unparsable message");
                    self.emit(ConnectionEvent::Error(format!("unparsable message: {e}")));
                }
            },
        }
    }

    // -- Closing --

    /// The current socket is finished. `orderly` picks the direct route to
    /// `NotConnected`; otherwise the connection passes through `Errored`.
    fn socket_gone(&mut self, code: u16, orderly: bool) {
        self.socket = Slot::Empty;
        self.reader = None;
        self.next_ping = None;
        self.force_disconnect_at = None;

        let reason = close_reason(code);
        tracing::info!(code, reason = %reason, "socket closed");
        self.emit(ConnectionEvent::Closed { code, reason });

        if self.activity != ConnectionActivity::Idle {
            self.set_activity(ConnectionActivity::Idle);
        }
        if self.state == ConnectionState::NotConnected {
            return;
        }
        if !orderly && self.state != ConnectionState::NoPing {
            self.set_state(ConnectionState::Errored);
        }
        self.set_state(ConnectionState::NotConnected);
    }

    async fn disconnect(&mut self) {
        let Slot::Open(socket) = &self.socket else {
            tracing::debug!("disconnect ignored, no open socket");
            return;
        };
        if self.activity == ConnectionActivity::Closing {
            return;
        }
        let socket = Arc::clone(socket);
        self.planned_disconnect = self.liveness == Liveness::Alive;
        self.next_ping = None;
        self.set_activity(ConnectionActivity::Closing);
        tracing::info!(socket = %socket.id(), "disconnecting");
        if let Err(e) = socket.close(NORMAL_CLOSURE).await {
            tracing::warn!(error = %e, "clean close failed, terminating");
            let _ = socket.terminate().await;
        }
    }

    async fn terminate(&mut self) {
        let Slot::Open(socket) = &self.socket else {
            tracing::debug!("terminate ignored, no open socket");
            return;
        };
        let socket = Arc::clone(socket);
        if self.activity != ConnectionActivity::Idle {
            self.set_activity(ConnectionActivity::Idle);
        }
        self.set_activity(ConnectionActivity::Terminating);
        tracing::info!(socket = %socket.id(), "terminating");
        if let Err(e) = socket.terminate().await {
            tracing::debug!(error = %e, "terminate failed");
        }
    }

    // -- Liveness --

    async fn ping_tick(&mut self) {
        let Slot::Open(socket) = &self.socket else {
            self.next_ping = None;
            return;
        };
        let socket = Arc::clone(socket);

        match self.liveness {
            Liveness::Suspect => {
                tracing::warn!(socket = %socket.id(), "peer stopped answering pings");
                self.next_ping = None;
                self.emit(ConnectionEvent::NoPing);
                self.set_state(ConnectionState::NoPing);
                self.force_disconnect_at = Some(Instant::now() + self.config.no_ping_grace);
            }
            Liveness::Alive => {
                self.liveness = Liveness::Suspect;
                self.next_ping = Some(Instant::now() + self.config.ping_interval);
                if let Err(e) = socket.send(PING).await {
                    tracing::debug!(error = %e, "failed to send ping");
                }
            }
        }
    }

    /// Drops a dead socket without waiting for it to report its close.
    ///
    /// The socket's generation is retired first, so its late close or
    /// error signals are ignored; the move to `NotConnected` (and with it
    /// reconnect scheduling) happens only after the socket is gone.
    async fn force_disconnect(&mut self) {
        self.force_disconnect_at = None;
        self.generation += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Slot::Open(socket) = std::mem::replace(&mut self.socket, Slot::Empty) {
            tracing::info!(socket = %socket.id(), "forcing disconnect");
            if let Err(e) = socket.terminate().await {
                tracing::debug!(error = %e, "terminate failed");
            }
        }
        self.emit(ConnectionEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: close_reason(ABNORMAL_CLOSURE),
        });
        self.set_state(ConnectionState::NotConnected);
    }

    // -- Reconnection --

    fn schedule_reconnect(&mut self) {
        if self.dialer.is_none() {
            tracing::debug!("slave connection, not scheduling reconnect");
            return;
        }
        if self.next_reconnect.is_some() {
            return;
        }
        let delay = self.reconnect_delay();
        tracing::info!(attempts = self.attempts, ?delay, "reconnect scheduled");
        self.next_reconnect = Some(Instant::now() + delay);
    }

    fn reconnect_tick(&mut self) {
        if matches!(self.socket, Slot::Empty) {
            self.connect();
        }
        // Repeats until an open cancels it.
        self.next_reconnect = Some(Instant::now() + self.reconnect_delay());
    }

    fn reconnect_delay(&self) -> Duration {
        let base = if self.attempts >= self.config.reconnect_threshold {
            self.config.reconnect_interval_long
        } else {
            self.config.reconnect_interval
        };
        let jitter_ms = u64::try_from(self.config.reconnect_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            base
        } else {
            base + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        }
    }

    // -- Authorization --

    async fn authorize(&mut self) -> Result<(), ConnectionError> {
        if !matches!(self.socket, Slot::Open(_)) {
            return Err(ConnectionError::NotOpen);
        }
        self.state.transition(ConnectionState::Authorized)?;
        self.activity.transition(ConnectionActivity::Authorizing)?;
        self.set_activity(ConnectionActivity::Authorizing);
        self.set_state(ConnectionState::Authorized);
        self.set_activity(ConnectionActivity::Idle);
        self.drain_history().await;
        Ok(())
    }

    fn deauthorize(&mut self) -> Result<(), ConnectionError> {
        if !matches!(self.socket, Slot::Open(_)) {
            return Err(ConnectionError::NotOpen);
        }
        self.state.transition(ConnectionState::Connected)?;
        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    // -- Sending --

    async fn send(
        &mut self,
        payload: Value,
        require_secure: bool,
    ) -> Result<Delivery, ConnectionError> {
        if let Some(socket) = self.sendable_socket(&payload, require_secure) {
            let text = serde_json::to_string(&payload)?;
            socket.send(&text).await?;
            tracing::trace!(len = text.len(), "payload sent");
            return Ok(Delivery::Sent);
        }

        tracing::debug!(state = ?self.state, "connection not ready, queuing payload");
        if self.history.push(payload.clone()).is_some() {
            tracing::warn!(capacity = self.history.capacity(), "history full, dropped oldest payload");
        }
        self.emit(ConnectionEvent::NotSent(payload));
        Ok(Delivery::Queued)
    }

    /// The socket to send `payload` on, if the state gate allows it.
    fn sendable_socket(&self, payload: &Value, require_secure: bool) -> Option<Arc<S>> {
        let Slot::Open(socket) = &self.socket else {
            return None;
        };
        let ready = match self.state {
            ConnectionState::Authorized => true,
            ConnectionState::Connected => !require_secure,
            _ => false,
        };
        (ready || is_update_token(payload)).then(|| Arc::clone(socket))
    }

    /// Resends queued payloads, oldest first. Failures are reported and
    /// the payload is dropped.
    async fn drain_history(&mut self) {
        if self.history.is_empty() {
            return;
        }
        let secure = self.config.secure;
        tracing::info!(count = self.history.len(), "replaying queued payloads");
        while let Some(oldest) = self.history.front() {
            // Stop with the oldest payload still at the head if the gate closes.
            let Some(socket) = self.sendable_socket(oldest, secure) else {
                break;
            };
            let Some(payload) = self.history.pop() else {
                break;
            };
            let result = match serde_json::to_string(&payload) {
                Ok(text) => socket.send(&text).await.map_err(ConnectionError::from),
                Err(e) => Err(ConnectionError::from(e)),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "failed to replay queued payload");
                self.emit(ConnectionEvent::Error(format!("history replay failed: {e}")));
            }
        }
    }

    // -- State bookkeeping --

    fn set_state(&mut self, next: ConnectionState) {
        let from = self.state;
        match from.transition(next) {
            Ok(to) => {
                self.state = to;
                if from != to {
                    tracing::debug!(from = ?from, to = ?to, "state changed");
                    self.emit(ConnectionEvent::StateChanged { from, to });
                }
                self.publish_status();
                if to == ConnectionState::NotConnected && from != to {
                    self.entered_not_connected();
                }
            }
            Err(e) => tracing::error!(error = %e, "rejected state transition"),
        }
    }

    fn set_activity(&mut self, next: ConnectionActivity) {
        let from = self.activity;
        match from.transition(next) {
            Ok(to) => {
                self.activity = to;
                tracing::trace!(from = ?from, to = ?to, "activity changed");
                self.emit(ConnectionEvent::ActivityChanged { from, to });
                self.publish_status();
            }
            Err(e) => tracing::error!(error = %e, "rejected activity transition"),
        }
    }

    /// Planned disconnects of a live socket dial straight away; every other
    /// drop backs off.
    fn entered_not_connected(&mut self) {
        self.next_ping = None;
        if std::mem::take(&mut self.planned_disconnect) {
            self.connect();
        } else {
            self.schedule_reconnect();
        }
    }

    fn publish_status(&self) {
        self.status.send_replace(ConnectionStatus {
            state: self.state,
            activity: self.activity,
            attempts: self.attempts,
            last_error: self.last_error.clone(),
        });
    }

    fn emit(&mut self, event: ConnectionEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn shutdown(&mut self) {
        self.next_ping = None;
        self.next_reconnect = None;
        self.force_disconnect_at = None;
        self.generation += 1;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Slot::Open(socket) = std::mem::replace(&mut self.socket, Slot::Empty) {
            if let Err(e) = socket.close(NORMAL_CLOSURE).await {
                tracing::debug!(error = %e, "close on destroy failed");
            }
        }
        self.subscribers.clear();
        tracing::info!(uri = %self.config.uri, "connection destroyed");
    }
}

/// Pumps frames from a socket into the actor until the socket finishes.
async fn read_loop<S: Socket>(
    socket: Arc<S>,
    generation: u64,
    signals: mpsc::UnboundedSender<Signal<S>>,
) {
    loop {
        let signal = match socket.recv().await {
            Ok(Frame::Text(text)) => Signal::Text { generation, text },
            Ok(Frame::Close(code)) => {
                let _ = signals.send(Signal::Closed { generation, code });
                return;
            }
            Err(error) => {
                let _ = signals.send(Signal::Failed { generation, error });
                return;
            }
        };
        if signals.send(signal).is_err() {
            return;
        }
    }
}

/// The reserved message that has to get through before authorization.
fn is_update_token(payload: &Value) -> bool {
    payload.get("type").and_then(Value::as_str) == Some(kind::SERVICE)
        && payload.get("name").and_then(Value::as_str) == Some(service::UPDATE_TOKEN)
}

/// Sleeps until `deadline`, or forever when there is none.
fn sleep_until(deadline: Option<Instant>) -> impl Future<Output = ()> {
    async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }
}

//! The Tandem client.
//!
//! A [`Client`] ties the layers together: it packs outgoing payloads with
//! its [`Messenger`], hands them to its [`Connection`], and turns incoming
//! envelopes into either a resolved request, a routed event, or a routed
//! request that is always answered.
//!
//! ```text
//! send_request ──▶ pending[id] ──▶ Messenger::pack ──▶ Connection::send
//!                     ▲
//!                     └── response(id) ◀── process_message ◀── Opened socket
//!                                              │
//!                      event / request ──▶ Router ──▶ reply (requests only)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tandem_connection::{Connection, Delivery};
use tandem_protocol::{
    kind, service, Envelope, Messenger, ProtocolError, RemoteError, RouteKey,
    ServiceData, ServiceFields,
};
use tandem_router::{Route, RouteRequest, Router, RouterError};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{ClientBuilder, ClientConfig, ClientError, TokenProvider, TokenStore};

/// Code reported to the peer when the renew-token hook fails.
pub const RENEW_TOKEN_FAILED: &str = "RENEW_TOKEN_FAILED";

/// An incoming envelope as seen by listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub service: ServiceData,
    pub cred: Option<Value>,
    /// The payload, or the error the peer reported.
    pub result: Result<Value, RemoteError>,
}

struct PendingRequest {
    name: String,
    issued_at: Instant,
    reply: oneshot::Sender<Result<Value, ClientError>>,
}

#[derive(Default)]
struct Listeners {
    all: Vec<mpsc::UnboundedSender<Incoming>>,
    by_route: HashMap<RouteKey, Vec<mpsc::UnboundedSender<Incoming>>>,
}

impl Listeners {
    fn notify(&mut self, incoming: &Incoming) {
        self.all.retain(|tx| tx.send(incoming.clone()).is_ok());

        let key = RouteKey::new(&incoming.service.kind, &incoming.service.name);
        if let Some(subscribers) = self.by_route.get_mut(&key) {
            subscribers.retain(|tx| tx.send(incoming.clone()).is_ok());
            if subscribers.is_empty() {
                self.by_route.remove(&key);
            }
        }
    }
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    connection: Connection,
    messenger: RwLock<Messenger>,
    router: RwLock<Router<Client>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    token: Mutex<Option<String>>,
    peer_token: Mutex<Option<String>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    token_store: Option<Arc<dyn TokenStore>>,
    listeners: Mutex<Listeners>,
}

pub(crate) struct ClientParts {
    pub(crate) config: ClientConfig,
    pub(crate) connection: Connection,
    pub(crate) messenger: Messenger,
    pub(crate) router: Router<Client>,
    pub(crate) token_provider: Option<Arc<dyn TokenProvider>>,
    pub(crate) token_store: Option<Arc<dyn TokenStore>>,
}

/// One end of a Tandem link.
///
/// Cheap to clone; every clone drives the same connection. Route handlers
/// receive a clone as their state, so they can send on the link that
/// delivered their request.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("uri", &self.inner.config.connection.uri)
            .field("status", &self.inner.connection.status())
            .finish_non_exhaustive()
    }
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub(crate) fn from_parts(parts: ClientParts) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config: parts.config,
                connection: parts.connection,
                messenger: RwLock::new(parts.messenger),
                router: RwLock::new(parts.router),
                pending: Mutex::new(HashMap::new()),
                token: Mutex::new(None),
                peer_token: Mutex::new(None),
                token_provider: parts.token_provider,
                token_store: parts.token_store,
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> std::sync::Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// The underlying connection, for status and lifecycle control.
    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    // -- Lifecycle --

    /// Opens the link. A secure client first makes sure it has a token.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.config.connection.secure {
            let token = self.get_token(false).await?;
            self.save_token(token).await?;
        }
        self.inner.connection.connect().await?;
        Ok(())
    }

    /// Destroys the connection and fails every pending request with
    /// [`ClientError::Destroyed`].
    pub async fn destroy(&self) {
        self.inner.connection.destroy().await;

        let pending: Vec<PendingRequest> = self
            .inner
            .pending
            .lock()
            .await
            .drain()
            .map(|(_, pending)| pending)
            .collect();
        for request in pending {
            let _ = request.reply.send(Err(ClientError::Destroyed));
        }

        let mut listeners = self.inner.listeners.lock().await;
        listeners.all.clear();
        listeners.by_route.clear();
        tracing::info!(uri = %self.inner.config.connection.uri, "client destroyed");
    }

    /// Destroys the client once `signal` completes.
    ///
    /// ```no_run
    /// # async fn run(client: tandem::Client) {
    /// client.destroy_on(async {
    ///     let _ = tokio::signal::ctrl_c().await;
    /// });
    /// # }
    /// ```
    pub fn destroy_on<F>(&self, signal: F) -> JoinHandle<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let client = self.downgrade();
        tokio::spawn(async move {
            signal.await;
            if let Some(inner) = client.upgrade() {
                Client::from_inner(inner).destroy().await;
            }
        })
    }

    // -- Sending --

    /// Sends a `request` and waits for its response.
    pub async fn send_request(&self, name: &str, payload: Value) -> Result<Value, ClientError> {
        self.request(kind::REQUEST, name, payload).await
    }

    /// Sends a message of any kind and waits for the `response` carrying
    /// the same id.
    ///
    /// The request is registered before it is handed to the connection, so
    /// a request made while the link is down waits in the history and still
    /// gets its answer once the link comes up. Expiry is only checked while
    /// the link is open.
    pub async fn request(
        &self,
        kind: &str,
        name: &str,
        payload: Value,
    ) -> Result<Value, ClientError> {
        let envelope = {
            let mut messenger = self.inner.messenger.write().await;
            messenger.enable_route(kind::RESPONSE, name);
            messenger.pack(payload, Some(ServiceFields::new(kind, name)), None)?
        };
        let id = envelope.id.clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(
            id.clone(),
            PendingRequest {
                name: name.to_owned(),
                issued_at: Instant::now(),
                reply: tx,
            },
        );

        if let Err(e) = self.transmit(&envelope).await {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }
        tracing::debug!(%id, kind, name, "request sent");

        rx.await.unwrap_or(Err(ClientError::Destroyed))
    }

    /// Fire-and-forget send. Failures are logged, not returned.
    pub async fn send_message(&self, kind: &str, name: &str, payload: Value) {
        let packed = self
            .inner
            .messenger
            .read()
            .await
            .pack(payload, Some(ServiceFields::new(kind, name)), None);
        let result = match packed {
            Ok(envelope) => self.transmit(&envelope).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            tracing::warn!(kind, name, error = %e, "message not sent");
        }
    }

    pub async fn send_event(&self, name: &str, payload: Value) {
        self.send_message(kind::EVENT, name, payload).await;
    }

    async fn transmit(&self, envelope: &Envelope) -> Result<Delivery, ClientError> {
        let value = serde_json::to_value(envelope).map_err(ProtocolError::Encode)?;
        let delivery = self
            .inner
            .connection
            .send(value, self.inner.config.connection.secure)
            .await?;
        Ok(delivery)
    }

    /// Number of requests still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    // -- Receiving --

    /// Handles one incoming JSON message.
    ///
    /// Undecodable or invalid envelopes are logged and dropped. Responses
    /// resolve their pending request; events go to the router without a
    /// reply; every other kind goes to the router and is always answered.
    pub async fn process_message(&self, raw: Value) {
        if let Some(incoming) = self.receive(raw).await {
            self.dispatch(incoming).await;
        }
    }

    /// The ordered half of [`Client::process_message`]: decode, validate,
    /// unpack, notify listeners and resolve responses.
    ///
    /// Returns the envelope when it still has to be routed.
    pub(crate) async fn receive(&self, raw: Value) -> Option<Incoming> {
        let envelope: Envelope = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping undecodable message");
                return None;
            }
        };

        let incoming = {
            let messenger = self.inner.messenger.read().await;
            if let Err(e) = messenger.validate(&envelope) {
                tracing::warn!(id = %envelope.id, error = %e, "dropping invalid envelope");
                return None;
            }
            let service = Messenger::service(&envelope);
            let cred = envelope.cred.clone();
            match messenger.unpack(envelope) {
                Ok(unpacked) => Incoming {
                    service: unpacked.service,
                    cred: unpacked.cred,
                    result: Ok(unpacked.payload),
                },
                Err(ProtocolError::Remote(remote)) => Incoming {
                    service,
                    cred,
                    result: Err(remote),
                },
                Err(e) => {
                    tracing::warn!(error = %e, "dropping envelope that failed to unpack");
                    return None;
                }
            }
        };
        tracing::debug!(
            id = %incoming.service.id,
            kind = %incoming.service.kind,
            name = %incoming.service.name,
            "message received"
        );

        self.inner.listeners.lock().await.notify(&incoming);

        if incoming.service.kind == kind::RESPONSE {
            self.resolve_pending(incoming).await;
            return None;
        }
        Some(incoming)
    }

    /// Routes an event or request, answering requests.
    pub(crate) async fn dispatch(&self, incoming: Incoming) {
        if incoming.service.kind == kind::EVENT {
            if let Err(e) = self.route(&incoming).await {
                tracing::warn!(name = %incoming.service.name, error = %e, "event handler failed");
            }
        } else {
            let result = self.route(&incoming).await;
            self.reply(&incoming.service, result).await;
        }
    }

    async fn route(&self, incoming: &Incoming) -> Result<Value, RemoteError> {
        let payload = incoming.result.clone()?;
        let ServiceData { kind, name, .. } = &incoming.service;

        // Cloned out so no lock is held while the handler runs.
        let route = self.inner.router.read().await.resolve(kind, name);
        let Some(route) = route else {
            return Err(RouterError::NotFound(RouteKey::new(kind, name)).into_remote());
        };
        let request = RouteRequest {
            service: incoming.service.clone(),
            cred: incoming.cred.clone(),
            payload,
        };
        route
            .dispatch(request, self.clone())
            .await
            .map_err(RouterError::into_remote)
    }

    async fn reply(&self, request: &ServiceData, result: Result<Value, RemoteError>) {
        let fields = ServiceFields::new(kind::RESPONSE, &request.name).with_id(&request.id);
        let packed = {
            let messenger = self.inner.messenger.read().await;
            match &result {
                Ok(payload) => messenger.pack(payload.clone(), Some(fields), None),
                Err(error) => messenger.pack(Value::Null, Some(fields), Some(error)),
            }
        };
        let sent = match packed {
            Ok(envelope) => self.transmit(&envelope).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = sent {
            tracing::warn!(id = %request.id, name = %request.name, error = %e, "reply not sent");
        }
    }

    async fn resolve_pending(&self, incoming: Incoming) {
        let id = incoming.service.id;
        let pending = self.inner.pending.lock().await.remove(&id);
        match pending {
            Some(request) => {
                tracing::debug!(%id, name = %request.name, "response matched");
                let _ = request.reply.send(incoming.result.map_err(ClientError::Remote));
            }
            None => {
                tracing::debug!(%id, name = %incoming.service.name, "dropping response to unknown request");
            }
        }
    }

    /// Resolves every request older than `request_timeout` with
    /// [`ClientError::Timeout`].
    pub(crate) async fn sweep(&self) {
        let timeout = self.inner.config.request_timeout;
        let now = Instant::now();

        let expired: Vec<(String, PendingRequest)> = {
            let mut pending = self.inner.pending.lock().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| now.duration_since(request.issued_at) >= timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove_entry(&id))
                .collect()
        };

        for (id, request) in expired {
            let elapsed = now.duration_since(request.issued_at);
            tracing::warn!(%id, name = %request.name, ?elapsed, "request timed out");
            let _ = request.reply.send(Err(ClientError::Timeout { id, elapsed }));
        }
    }

    // -- Listeners --

    /// Every incoming envelope, after validation.
    pub async fn messages(&self) -> mpsc::UnboundedReceiver<Incoming> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.listeners.lock().await.all.push(tx);
        rx
    }

    /// Incoming envelopes of one `(type, name)` pair.
    pub async fn on(&self, kind: &str, name: &str) -> mpsc::UnboundedReceiver<Incoming> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .listeners
            .lock()
            .await
            .by_route
            .entry(RouteKey::new(kind, name))
            .or_default()
            .push(tx);
        rx
    }

    // -- Routes --

    /// Registers routes with the router and enables them in the messenger.
    pub async fn set_routes_for_type<N: Into<String>>(
        &self,
        kind: &str,
        routes: impl IntoIterator<Item = (N, Route<Client>)>,
    ) -> Result<(), ClientError> {
        let routes: Vec<(String, Route<Client>)> = routes
            .into_iter()
            .map(|(name, route)| (name.into(), route))
            .collect();
        let names: Vec<String> = routes.iter().map(|(name, _)| name.clone()).collect();

        self.inner.router.write().await.set_routes_for_type(kind, routes)?;
        let mut messenger = self.inner.messenger.write().await;
        for name in &names {
            messenger.enable_route(kind, name);
        }
        Ok(())
    }

    pub async fn set_route(
        &self,
        kind: &str,
        name: &str,
        route: Route<Client>,
    ) -> Result<(), ClientError> {
        self.set_routes_for_type(kind, [(name, route)]).await
    }

    /// Removes routes from both the router and the messenger.
    pub async fn unset_routes_for_type<N: AsRef<str>>(
        &self,
        kind: &str,
        names: impl IntoIterator<Item = N>,
    ) -> Result<(), ClientError> {
        let names: Vec<N> = names.into_iter().collect();
        self.inner
            .router
            .write()
            .await
            .unset_routes_for_type(kind, names.iter().map(AsRef::<str>::as_ref))?;
        let mut messenger = self.inner.messenger.write().await;
        for name in &names {
            messenger.disable_route(kind, name.as_ref());
        }
        Ok(())
    }

    // -- Tokens --

    /// The current token: cached, then stored, then freshly provided.
    /// `renew` skips straight to the provider.
    pub async fn get_token(&self, renew: bool) -> Result<String, ClientError> {
        if !renew {
            if let Some(token) = self.inner.token.lock().await.clone() {
                return Ok(token);
            }
            if let Some(token) = self.inner.token_store.as_ref().and_then(|store| store.load()) {
                return Ok(token);
            }
        }
        let provider = self.inner.token_provider.as_ref().ok_or(ClientError::NoToken)?;
        provider.fetch().await.map_err(ClientError::TokenProvider)
    }

    /// Makes `token` current: stored, stamped onto outgoing envelopes and
    /// used by the connection's next dial.
    pub async fn save_token(&self, token: String) -> Result<(), ClientError> {
        if let Some(store) = &self.inner.token_store {
            store.save(&token);
        }
        self.inner
            .messenger
            .write()
            .await
            .set_credentials(Some(Value::String(token.clone())));
        *self.inner.token.lock().await = Some(token.clone());
        self.inner.connection.set_token(Some(token)).await?;
        Ok(())
    }

    /// The cached token, if any.
    pub async fn token(&self) -> Option<String> {
        self.inner.token.lock().await.clone()
    }

    /// The last token the peer pushed with `service/updateToken`.
    pub async fn peer_token(&self) -> Option<String> {
        self.inner.peer_token.lock().await.clone()
    }

    /// Fetches a fresh token, saves it and pushes it to the peer with
    /// `service/updateToken`. Wired as the `service/renewToken` route.
    pub async fn renew_token(&self) -> Result<(), ClientError> {
        let token = self.get_token(true).await?;
        self.save_token(token.clone()).await?;
        self.request(kind::SERVICE, service::UPDATE_TOKEN, json!({ "token": token }))
            .await?;
        tracing::info!("token renewed");
        Ok(())
    }

    // -- Clock --

    /// Estimates the offset between the peer's clock and ours and applies
    /// it to outgoing timestamps. Returns the new offset in milliseconds.
    pub async fn sync_clock(&self) -> Result<i64, ClientError> {
        let sent = chrono::Utc::now().timestamp_millis();
        let answer = self.request(kind::SERVICE, service::TIME, Value::Null).await?;
        let received = chrono::Utc::now().timestamp_millis();

        let remote = answer.as_i64().ok_or_else(|| {
            ClientError::Remote(RemoteError::message(format!(
                "time service answered with {answer}"
            )))
        })?;
        let latency = (received - sent) / 2;
        let offset = remote + latency - received;

        self.inner.messenger.write().await.set_time_offset(offset);
        tracing::debug!(offset, latency, "clock offset updated");
        Ok(offset)
    }

    /// Milliseconds to add to the local clock to get the peer's.
    pub async fn clock_offset(&self) -> i64 {
        self.inner.messenger.read().await.time_offset()
    }
}

/// Handler for `service/renewToken`.
pub(crate) async fn renew_token_route(
    _request: RouteRequest,
    client: Client,
) -> Result<Value, RemoteError> {
    client
        .renew_token()
        .await
        .map(|()| Value::Null)
        .map_err(|e| RemoteError::new(RENEW_TOKEN_FAILED, e.to_string()))
}

/// Handler for `service/updateToken`: remembers the peer's token.
pub(crate) async fn update_token_route(
    request: RouteRequest,
    client: Client,
) -> Result<Value, RemoteError> {
    let Some(token) = request.payload.get("token").and_then(Value::as_str) else {
        return Err(RemoteError::message("updateToken carries no token"));
    };
    *client.inner.peer_token.lock().await = Some(token.to_owned());
    tracing::debug!("peer pushed a new token");
    Ok(Value::Null)
}

//! [`ClientBuilder`]: configuring and starting a [`Client`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tandem_connection::{Connection, ConnectionEvent};
use tandem_protocol::{kind, service, CredentialValidator, Envelope, Messenger};
use tandem_router::{Route, Router};
use tandem_transport::{Connector, Socket};
use tokio::sync::mpsc;

use crate::client::{renew_token_route, update_token_route, ClientParts};
use crate::driver::Driver;
use crate::{Client, ClientConfig, ClientError, TokenProvider, TokenStore};

/// Builder for a [`Client`].
///
/// # Example
///
/// ```rust,no_run
/// use tandem::prelude::*;
/// use tandem::transport::WebSocketConnector;
///
/// # async fn run() -> Result<(), ClientError> {
/// let client = Client::builder()
///     .uri("ws://127.0.0.1:9000")
///     .route(kind::EVENT, "tick", Route::single(|req: RouteRequest, _c: Client| async move {
///         tracing::info!(payload = %req.payload, "tick");
///         Ok::<_, RemoteError>(serde_json::Value::Null)
///     }))
///     .dial(WebSocketConnector)?;
/// client.connect().await?;
/// let profile = client.send_request("getProfile", serde_json::json!({"id": 7})).await?;
/// tracing::info!(%profile, "got profile");
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    config: ClientConfig,
    token_provider: Option<Arc<dyn TokenProvider>>,
    token_store: Option<Arc<dyn TokenStore>>,
    validator: Option<CredentialValidator>,
    routes: Vec<(String, String, Route<Client>)>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            token_provider: None,
            token_store: None,
            validator: None,
            routes: Vec::new(),
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Where a dialing client connects to.
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.config.connection.uri = uri.into();
        self
    }

    /// Secure mode: the connection needs a token before it dials and the
    /// messenger rejects envelopes whose credentials the validator does not
    /// accept.
    pub fn secure(mut self, secure: bool) -> Self {
        self.config.connection.secure = secure;
        self.config.messenger.secure = secure;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// `None` turns clock sync off.
    pub fn clock_sync_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.clock_sync_interval = interval;
        self
    }

    pub fn token_provider(mut self, provider: impl TokenProvider) -> Self {
        self.token_provider = Some(Arc::new(provider));
        self
    }

    pub fn token_store(mut self, store: impl TokenStore) -> Self {
        self.token_store = Some(Arc::new(store));
        self
    }

    /// Decides which incoming credentials are acceptable.
    pub fn credential_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(Option<&Value>, &Envelope) -> bool + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Registers a route, enabled in the messenger as well.
    pub fn route(mut self, kind: &str, name: &str, route: Route<Client>) -> Self {
        self.routes.push((kind.to_owned(), name.to_owned(), route));
        self
    }

    /// Registers several routes under one kind.
    pub fn routes<N: Into<String>>(
        mut self,
        kind: &str,
        routes: impl IntoIterator<Item = (N, Route<Client>)>,
    ) -> Self {
        self.routes.extend(
            routes
                .into_iter()
                .map(|(name, route)| (kind.to_owned(), name.into(), route)),
        );
        self
    }

    /// Builds a client that dials with `connector` (and reconnects). Call
    /// [`Client::connect`] to open it.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn dial<C: Connector>(self, connector: C) -> Result<Client, ClientError> {
        let parts = self.prepare()?;
        let (connection, events) =
            Connection::dial_with_events(connector, parts.config.connection.clone());
        Ok(start(parts, connection, events))
    }

    /// Builds a client around a socket a listener accepted. It is open
    /// immediately and never reconnects.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn accept<S: Socket>(self, socket: S) -> Result<Client, ClientError> {
        let parts = self.prepare()?;
        let (connection, events) =
            Connection::accept_with_events(socket, parts.config.connection.clone());
        Ok(start(parts, connection, events))
    }

    fn prepare(self) -> Result<Prepared, ClientError> {
        let config = self.config.validated();

        let mut router = Router::new();
        router.set_route(kind::SERVICE, service::RENEW_TOKEN, Route::single(renew_token_route))?;
        router.set_route(kind::SERVICE, service::UPDATE_TOKEN, Route::single(update_token_route))?;
        for (kind, name, route) in self.routes {
            router.set_route(&kind, &name, route)?;
        }

        let mut messenger = Messenger::new(config.messenger.clone());
        for key in router.keys() {
            messenger.register_type(key.kind.clone());
            messenger.enable_route(&key.kind, &key.name);
        }
        if let Some(validator) = self.validator {
            messenger.set_validator(validator);
        }

        Ok(Prepared {
            config,
            messenger,
            router,
            token_provider: self.token_provider,
            token_store: self.token_store,
        })
    }
}

struct Prepared {
    config: ClientConfig,
    messenger: Messenger,
    router: Router<Client>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    token_store: Option<Arc<dyn TokenStore>>,
}

fn start(
    parts: Prepared,
    connection: Connection,
    events: mpsc::UnboundedReceiver<ConnectionEvent>,
) -> Client {
    let check_interval = parts.config.request_check_interval;
    let clock_sync_interval = parts.config.clock_sync_interval;
    let client = Client::from_parts(ClientParts {
        config: parts.config,
        connection,
        messenger: parts.messenger,
        router: parts.router,
        token_provider: parts.token_provider,
        token_store: parts.token_store,
    });
    let driver = Driver::new(client.downgrade(), events, check_interval, clock_sync_interval);
    tokio::spawn(driver.run());
    tracing::debug!(uri = %client.config().connection.uri, "client started");
    client
}

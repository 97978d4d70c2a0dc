//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tandem_connection::ConnectionConfig;
use tandem_protocol::MessengerConfig;

/// Configuration for a [`Client`](crate::Client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub messenger: MessengerConfig,

    /// How long a request may wait for its response.
    pub request_timeout: Duration,

    /// How often pending requests are checked for expiry.
    pub request_check_interval: Duration,

    /// How often the clock offset against the peer is re-estimated. `None`
    /// disables clock sync entirely.
    pub clock_sync_interval: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            messenger: MessengerConfig::default(),
            request_timeout: Duration::from_secs(15),
            request_check_interval: Duration::from_secs(1),
            clock_sync_interval: Some(Duration::from_secs(60)),
        }
    }
}

impl ClientConfig {
    /// Returns a copy with nonsensical values replaced by defaults.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        self.connection = self.connection.validated();
        if self.request_timeout.is_zero() {
            tracing::warn!("request_timeout of zero replaced with default");
            self.request_timeout = defaults.request_timeout;
        }
        if self.request_check_interval.is_zero() {
            tracing::warn!("request_check_interval of zero replaced with default");
            self.request_check_interval = defaults.request_check_interval;
        }
        if self.clock_sync_interval.is_some_and(|d| d.is_zero()) {
            tracing::warn!("clock_sync_interval of zero disables clock sync");
            self.clock_sync_interval = None;
        }
        self
    }
}

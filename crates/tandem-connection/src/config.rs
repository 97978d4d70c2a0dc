//! Connection configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_HISTORY_CAPACITY;

/// Configuration for a [`Connection`](crate::Connection).
///
/// Override the defaults with struct-update syntax:
///
/// ```
/// # use tandem_connection::ConnectionConfig;
/// # use std::time::Duration;
/// let config = ConnectionConfig {
///     uri: "ws://localhost:9000".into(),
///     ping_interval: Duration::from_secs(5),
///     ..ConnectionConfig::default()
/// };
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Where to dial. Ignored by accepted (slave) connections.
    pub uri: String,

    /// Secure connections need a token before they dial, carry it in the
    /// connect URI, and are treated as authorized once open.
    pub secure: bool,

    /// Query parameter the token is sent under.
    pub token_param: String,

    /// Period of the liveness ping.
    pub ping_interval: Duration,

    /// Delay between detecting a dead peer and forcing the disconnect.
    pub no_ping_grace: Duration,

    /// Reconnect delay while attempts are below `reconnect_threshold`.
    pub reconnect_interval: Duration,

    /// Reconnect delay once attempts reach `reconnect_threshold`.
    pub reconnect_interval_long: Duration,

    pub reconnect_threshold: u32,

    /// Upper bound of the random delay added to each reconnect. Zero
    /// disables jitter.
    pub reconnect_jitter: Duration,

    /// Unsent payloads kept while the connection is down.
    pub history_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            secure: false,
            token_param: "token".into(),
            ping_interval: Duration::from_secs(10),
            no_ping_grace: Duration::from_millis(100),
            reconnect_interval: Duration::from_secs(1),
            reconnect_interval_long: Duration::from_secs(30),
            reconnect_threshold: 10,
            reconnect_jitter: Duration::ZERO,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    /// Config for dialing `uri`, everything else default.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    /// Returns a copy with nonsensical values replaced.
    ///
    /// Zero intervals would spin the actor, so they fall back to the
    /// defaults. A long reconnect interval shorter than the short one is
    /// raised to match it.
    pub fn validated(mut self) -> Self {
        let defaults = Self::default();
        if self.ping_interval.is_zero() {
            tracing::warn!("ping_interval is zero, using default");
            self.ping_interval = defaults.ping_interval;
        }
        if self.reconnect_interval.is_zero() {
            tracing::warn!("reconnect_interval is zero, using default");
            self.reconnect_interval = defaults.reconnect_interval;
        }
        if self.reconnect_interval_long < self.reconnect_interval {
            tracing::warn!(
                long = ?self.reconnect_interval_long,
                short = ?self.reconnect_interval,
                "reconnect_interval_long is shorter than reconnect_interval"
            );
            self.reconnect_interval_long = self.reconnect_interval;
        }
        if self.history_capacity == 0 {
            tracing::warn!("history_capacity is zero, keeping one entry");
            self.history_capacity = 1;
        }
        if self.token_param.is_empty() {
            self.token_param = defaults.token_param;
        }
        self
    }

    /// Builds the URI to dial.
    ///
    /// Secure connections append the token as a query parameter; a plain
    /// connection dials `uri` as is.
    pub fn connect_uri(&self, token: Option<&str>) -> String {
        match token {
            Some(token) if self.secure => {
                let separator = if self.uri.contains('?') { '&' } else { '?' };
                format!("{}{separator}{}={token}", self.uri, self.token_param)
            }
            _ => self.uri.clone(),
        }
    }
}

//! Core protocol types for Tandem's wire format.
//!
//! Everything in this module travels "on the wire": it is serialized to a
//! JSON text message, sent over a socket, and deserialized on the other
//! side. The JSON shapes are part of the contract with every peer, so the
//! serde attributes below are deliberate and covered by tests.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Message kinds and reserved names
// ---------------------------------------------------------------------------

/// The `type` values every Messenger knows out of the box.
///
/// A peer may register more kinds, but these five carry the built-in
/// semantics: requests and commands expect a reply, events never get one,
/// responses are matched back to pending requests, and service messages are
/// the protocol's own plumbing (token refresh, clock sync).
pub mod kind {
    /// Expects a `response` carrying the same id.
    pub const REQUEST: &str = "request";
    /// Answer to a `request`, `command` or `service` message.
    pub const RESPONSE: &str = "response";
    /// Fire-and-forget notification; never answered.
    pub const EVENT: &str = "event";
    /// Like a request, but usually sent server → client.
    pub const COMMAND: &str = "command";
    /// Protocol plumbing.
    pub const SERVICE: &str = "service";

    /// All built-in kinds, in registration order.
    pub const DEFAULTS: [&str; 5] = [REQUEST, RESPONSE, EVENT, COMMAND, SERVICE];
}

/// Reserved `name` values under [`kind::SERVICE`].
pub mod service {
    /// "Please renew your credential token." The out-of-band auth-refresh hook.
    pub const RENEW_TOKEN: &str = "renewToken";
    /// "Here is my new token." Deliverable before the connection is authorized.
    pub const UPDATE_TOKEN: &str = "updateToken";
    /// "What time is it on your side?" Used for clock offset estimation.
    pub const TIME: &str = "time";
}

// ---------------------------------------------------------------------------
// RouteKey: a (type, name) pair
// ---------------------------------------------------------------------------

/// A `(type, name)` pair, the key every table in Tandem is indexed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    /// The message kind (`type` on the wire).
    #[serde(rename = "type")]
    pub kind: String,
    /// The route name within that kind.
    pub name: String,
}

impl RouteKey {
    /// Creates a key from anything string-like.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

// ---------------------------------------------------------------------------
// Errors carried on the wire
// ---------------------------------------------------------------------------

/// The `error` field of a failed envelope.
///
/// `#[serde(untagged)]` means serde tries each variant in order and picks
/// the first one that fits the JSON:
///   - `"boom"`                                → `Message("boom")`
///   - `{"code": "E42", "message": "boom"}`    → `Detail { .. }`
///   - anything else (numbers, odd objects)    → `Other(value)`
///
/// The catch-all keeps a peer's unusual error shape from making the whole
/// envelope undecodable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ErrorReport {
    /// A bare error message.
    Message(String),
    /// A structured error with an optional machine-readable code.
    Detail {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
    /// Any other JSON value, preserved as-is.
    Other(Value),
}

/// An application-level error: what a route handler fails with, and what a
/// failed response turns back into on the requesting side.
///
/// This is the only error type the [`Messenger`](crate::Messenger) marks an
/// envelope as errored for. Transport or protocol failures never travel as
/// an `error` field; they are handled locally.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteError {
    /// Machine-readable code, if the peer sent one.
    pub code: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// The report this error was rebuilt from, when it came off the wire.
    pub report: Option<ErrorReport>,
}

impl RemoteError {
    /// Creates an error with a code and a message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
            report: None,
        }
    }

    /// Creates an error carrying only a message.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            report: None,
        }
    }

    /// Rebuilds an error from a received report, keeping the report attached.
    ///
    /// A string becomes the message; an object contributes its `code` and
    /// `message`; anything else is rendered as JSON text.
    pub fn from_report(report: ErrorReport) -> Self {
        let (code, message) = match &report {
            ErrorReport::Message(message) => (None, message.clone()),
            ErrorReport::Detail { code, message } => (code.clone(), message.clone()),
            ErrorReport::Other(value) => (None, value.to_string()),
        };
        Self {
            code,
            message,
            report: Some(report),
        }
    }

    /// The report to put on the wire for this error.
    pub fn to_report(&self) -> ErrorReport {
        match &self.code {
            Some(code) => ErrorReport::Detail {
                code: Some(code.clone()),
                message: self.message.clone(),
            },
            None => ErrorReport::Message(self.message.clone()),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

// ---------------------------------------------------------------------------
// Envelope: the top-level wire format
// ---------------------------------------------------------------------------

/// The top-level message wrapper. Every JSON message on the wire is an
/// Envelope.
///
/// ```text
/// {
///   "id":      "6f1c…-4…",      ← v4 UUID; responses reuse the request's id
///   "time":    1718000000000,   ← sender's clock (epoch ms, offset-corrected)
///   "type":    "request",       ← message kind
///   "name":    "getProfile",    ← route name within the kind
///   "payload": { … },           ← application data
///   "cred":    "token…",        ← optional credentials
///   "error":   { … }            ← present only on failures
/// }
/// ```
///
/// `id` is kept as a plain string rather than a `Uuid`: a malformed id must
/// still decode so that validation can reject it with a precise error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id (v4 UUID text).
    pub id: String,
    /// Sender timestamp in epoch milliseconds.
    pub time: i64,
    /// Message kind. `type` is a Rust keyword, hence the rename.
    #[serde(rename = "type")]
    pub kind: String,
    /// Route name within the kind.
    pub name: String,
    /// Application payload. Missing on the wire reads as `null`.
    #[serde(default)]
    pub payload: Value,
    /// Sender credentials, omitted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cred: Option<Value>,
    /// Failure report; its presence marks the envelope as errored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl Envelope {
    /// Returns `true` if this envelope represents a failure.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The `(type, name)` pair of this envelope.
    pub fn route_key(&self) -> RouteKey {
        RouteKey::new(&self.kind, &self.name)
    }
}

// ---------------------------------------------------------------------------
// Service data: which exchange an envelope belongs to
// ---------------------------------------------------------------------------

/// The identifying subset of an envelope: which exchange this is,
/// independent of payload and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceData {
    pub id: String,
    pub time: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
}

/// The service fields supplied when packing.
///
/// `kind` and `name` are required. `id` and `time` are normally generated
/// by the Messenger; setting them overrides the generated values, which is
/// how a response inherits its request's id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFields {
    pub kind: String,
    pub name: String,
    pub id: Option<String>,
    pub time: Option<i64>,
}

impl ServiceFields {
    /// Fields for a fresh exchange of `kind`/`name`.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            id: None,
            time: None,
        }
    }

    /// Reuses an existing correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Overrides the timestamp.
    pub fn with_time(mut self, time: i64) -> Self {
        self.time = Some(time);
        self
    }
}

impl From<&ServiceData> for ServiceFields {
    fn from(service: &ServiceData) -> Self {
        Self {
            kind: service.kind.clone(),
            name: service.name.clone(),
            id: Some(service.id.clone()),
            time: Some(service.time),
        }
    }
}

/// The result of unpacking a successful envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Unpacked {
    pub cred: Option<Value>,
    pub service: ServiceData,
    pub payload: Value,
}

// =========================================================================
// Tests
// =========================================================================

//! The Messenger: Tandem's envelope codec.
//!
//! A Messenger owns everything needed to turn a payload into a wire
//! [`Envelope`] and back:
//!
//! - the credentials stamped onto every outgoing envelope,
//! - the clock offset applied to outgoing timestamps,
//! - the type and route tables incoming envelopes are checked against,
//! - pluggable hooks for wrapping payloads/errors and validating
//!   credentials.
//!
//! It does no I/O. Feeding envelopes to a socket is the connection's job.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::types::{kind, service};
use crate::{
    Envelope, ErrorReport, ProtocolError, RemoteError, RouteKey, ServiceData,
    ServiceFields, Unpacked,
};

/// Transforms a successful payload before it is packed.
pub type PayloadWrapper = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Produces the wire report for a packed error.
pub type ErrorWrapper = Arc<dyn Fn(&RemoteError) -> ErrorReport + Send + Sync>;

/// Decides whether an envelope's credentials are acceptable.
///
/// Receives the envelope's `cred` field and the envelope itself.
pub type CredentialValidator =
    Arc<dyn Fn(Option<&Value>, &Envelope) -> bool + Send + Sync>;

// ---------------------------------------------------------------------------
// MessengerConfig
// ---------------------------------------------------------------------------

/// Validation settings for a [`Messenger`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessengerConfig {
    /// In secure mode, credentials are rejected unless a custom
    /// [`CredentialValidator`] accepts them.
    pub secure: bool,

    /// Reject envelopes whose `type` is not registered.
    pub check_types: bool,

    /// Reject envelopes whose `(type, name)` pair is not registered.
    pub check_routes: bool,

    /// Pairs that skip credential validation entirely.
    ///
    /// Defaults to `service/updateToken`, which has to get through before a
    /// peer is authorized.
    pub security_exceptions: Vec<RouteKey>,
}

impl Default for MessengerConfig {
    fn default() -> Self {
        Self {
            secure: false,
            check_types: true,
            check_routes: true,
            security_exceptions: vec![RouteKey::new(
                kind::SERVICE,
                service::UPDATE_TOKEN,
            )],
        }
    }
}

// ---------------------------------------------------------------------------
// Messenger
// ---------------------------------------------------------------------------

/// Packs, validates and unpacks envelopes.
pub struct Messenger {
    config: MessengerConfig,
    types: HashSet<String>,
    routes: HashMap<String, HashSet<String>>,
    credentials: Option<Value>,
    time_offset: i64,
    ok_wrapper: Option<PayloadWrapper>,
    error_wrapper: Option<ErrorWrapper>,
    validator: Option<CredentialValidator>,
}

impl fmt::Debug for Messenger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Messenger")
            .field("config", &self.config)
            .field("types", &self.types)
            .field("routes", &self.routes)
            .field("has_credentials", &self.credentials.is_some())
            .field("time_offset", &self.time_offset)
            .finish_non_exhaustive()
    }
}

impl Default for Messenger {
    fn default() -> Self {
        Self::new(MessengerConfig::default())
    }
}

impl Messenger {
    /// Creates a Messenger that knows the built-in message kinds and no
    /// routes.
    pub fn new(config: MessengerConfig) -> Self {
        Self {
            config,
            types: kind::DEFAULTS.iter().map(|k| (*k).to_owned()).collect(),
            routes: HashMap::new(),
            credentials: None,
            time_offset: 0,
            ok_wrapper: None,
            error_wrapper: None,
            validator: None,
        }
    }

    /// Returns the validation settings.
    pub fn config(&self) -> &MessengerConfig {
        &self.config
    }

    // -- Tables --

    /// Registers an additional message kind.
    pub fn register_type(&mut self, kind: impl Into<String>) {
        self.types.insert(kind.into());
    }

    /// Returns `true` if `kind` is a registered message kind.
    pub fn is_type_registered(&self, kind: &str) -> bool {
        self.types.contains(kind)
    }

    /// Registers a `(kind, name)` pair. Registering an existing pair is a
    /// no-op. An unknown `kind` is registered along the way.
    pub fn enable_route(&mut self, kind: &str, name: &str) {
        if !self.types.contains(kind) {
            self.types.insert(kind.to_owned());
        }
        self.routes
            .entry(kind.to_owned())
            .or_default()
            .insert(name.to_owned());
    }

    /// Unregisters a `(kind, name)` pair. Removing a missing pair is a no-op.
    pub fn disable_route(&mut self, kind: &str, name: &str) {
        if let Some(names) = self.routes.get_mut(kind) {
            names.remove(name);
            if names.is_empty() {
                self.routes.remove(kind);
            }
        }
    }

    /// Returns `true` if the `(kind, name)` pair is registered.
    pub fn is_route_enabled(&self, kind: &str, name: &str) -> bool {
        self.routes
            .get(kind)
            .is_some_and(|names| names.contains(name))
    }

    // -- Outgoing state --

    /// Sets (or clears) the credentials attached to every packed envelope.
    pub fn set_credentials(&mut self, credentials: Option<Value>) {
        self.credentials = credentials;
    }

    /// Returns the stored credentials.
    pub fn credentials(&self) -> Option<&Value> {
        self.credentials.as_ref()
    }

    /// Sets the signed offset (ms) added to outgoing timestamps.
    pub fn set_time_offset(&mut self, offset_ms: i64) {
        self.time_offset = offset_ms;
    }

    /// Returns the current clock offset in milliseconds.
    pub fn time_offset(&self) -> i64 {
        self.time_offset
    }

    /// Local epoch-ms time with the clock offset applied.
    pub fn now(&self) -> i64 {
        chrono::Utc::now().timestamp_millis() + self.time_offset
    }

    // -- Hooks --

    /// Replaces the identity wrapper applied to successful payloads.
    pub fn set_ok_wrapper(&mut self, wrapper: PayloadWrapper) {
        self.ok_wrapper = Some(wrapper);
    }

    /// Replaces the default error-to-report conversion.
    pub fn set_error_wrapper(&mut self, wrapper: ErrorWrapper) {
        self.error_wrapper = Some(wrapper);
    }

    /// Installs a custom credential validator.
    pub fn set_validator(&mut self, validator: CredentialValidator) {
        self.validator = Some(validator);
    }

    // -- Codec --

    /// Packs a payload into a fresh envelope.
    ///
    /// The envelope gets a new v4 id and the current (offset) time, the
    /// stored credentials, and then whatever `service` overrides. When
    /// `error` is given the envelope is marked as failed.
    ///
    /// # Errors
    /// Returns [`ProtocolError::MissingServiceData`] when neither `service`
    /// nor `error` is supplied.
    pub fn pack(
        &self,
        payload: Value,
        service: Option<ServiceFields>,
        error: Option<&RemoteError>,
    ) -> Result<Envelope, ProtocolError> {
        if service.is_none() && error.is_none() {
            return Err(ProtocolError::MissingServiceData);
        }

        let payload = match (&self.ok_wrapper, error) {
            (Some(wrap), None) => wrap(payload),
            _ => payload,
        };

        let mut envelope = Envelope {
            id: Uuid::new_v4().to_string(),
            time: self.now(),
            kind: String::new(),
            name: String::new(),
            payload,
            cred: self.credentials.clone(),
            error: None,
        };

        if let Some(error) = error {
            envelope.error = Some(match &self.error_wrapper {
                Some(wrap) => wrap(error),
                None => error.to_report(),
            });
        }

        if let Some(service) = service {
            envelope.kind = service.kind;
            envelope.name = service.name;
            if let Some(id) = service.id {
                envelope.id = id;
            }
            if let Some(time) = service.time {
                envelope.time = time;
            }
        }

        Ok(envelope)
    }

    /// Unpacks an envelope into credentials, service data and payload.
    ///
    /// # Errors
    /// An errored envelope yields [`ProtocolError::Remote`] with the error
    /// rebuilt from its report (and the report attached).
    pub fn unpack(&self, envelope: Envelope) -> Result<Unpacked, ProtocolError> {
        if let Some(report) = envelope.error {
            return Err(ProtocolError::Remote(RemoteError::from_report(report)));
        }
        let service = Self::service(&envelope);
        Ok(Unpacked {
            cred: envelope.cred,
            service,
            payload: envelope.payload,
        })
    }

    /// Checks an incoming envelope before it is unpacked.
    ///
    /// In order: the id must be a v4 UUID; the pair must be security-excepted
    /// or carry acceptable credentials; the type must be registered (when
    /// `check_types`); the pair must be registered (when `check_routes`).
    pub fn validate(&self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let valid_id = Uuid::parse_str(&envelope.id)
            .is_ok_and(|id| id.get_version() == Some(uuid::Version::Random));
        if !valid_id {
            return Err(ProtocolError::InvalidId(envelope.id.clone()));
        }

        let excepted = self
            .config
            .security_exceptions
            .iter()
            .any(|key| key.kind == envelope.kind && key.name == envelope.name);
        if !excepted && !self.credentials_valid(envelope) {
            return Err(ProtocolError::Unauthorized(envelope.route_key()));
        }

        if self.config.check_types && !self.types.contains(&envelope.kind) {
            return Err(ProtocolError::UnknownType(envelope.kind.clone()));
        }

        if self.config.check_routes
            && !self.is_route_enabled(&envelope.kind, &envelope.name)
        {
            return Err(ProtocolError::UnknownRoute(envelope.route_key()));
        }

        Ok(())
    }

    fn credentials_valid(&self, envelope: &Envelope) -> bool {
        match &self.validator {
            Some(validate) => validate(envelope.cred.as_ref(), envelope),
            None => !self.config.secure,
        }
    }

    // -- Accessors --

    /// Extracts the service data of an envelope.
    pub fn service(envelope: &Envelope) -> ServiceData {
        ServiceData {
            id: envelope.id.clone(),
            time: envelope.time,
            kind: envelope.kind.clone(),
            name: envelope.name.clone(),
        }
    }

    /// Returns the credentials carried by an envelope.
    pub fn cred(envelope: &Envelope) -> Option<&Value> {
        envelope.cred.as_ref()
    }

    /// Returns the payload carried by an envelope.
    pub fn payload(envelope: &Envelope) -> &Value {
        &envelope.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn messenger_with(kind: &str, name: &str) -> Messenger {
        let mut messenger = Messenger::default();
        messenger.enable_route(kind, name);
        messenger
    }

    // =====================================================================
    // pack / unpack
    // =====================================================================

    #[test]
    fn test_pack_then_unpack_recovers_payload_and_route() {
        let messenger = messenger_with("test", "sayHello");
        let envelope = messenger
            .pack(
                json!({"hello": 1}),
                Some(ServiceFields::new("test", "sayHello")),
                None,
            )
            .unwrap();

        let unpacked = messenger.unpack(envelope).unwrap();
        assert_eq!(unpacked.payload, json!({"hello": 1}));
        assert_eq!(unpacked.service.kind, "test");
        assert_eq!(unpacked.service.name, "sayHello");
    }

    #[test]
    fn test_pack_generates_v4_id_and_validates() {
        let messenger = messenger_with(kind::EVENT, "tick");
        let envelope = messenger
            .pack(Value::Null, Some(ServiceFields::new(kind::EVENT, "tick")), None)
            .unwrap();
        let id = Uuid::parse_str(&envelope.id).unwrap();
        assert_eq!(id.get_version(), Some(uuid::Version::Random));
        messenger.validate(&envelope).unwrap();
    }

    #[test]
    fn test_pack_without_service_data_fails() {
        let messenger = Messenger::default();
        let result = messenger.pack(json!(1), None, None);
        assert!(matches!(result, Err(ProtocolError::MissingServiceData)));
    }

    #[test]
    fn test_pack_error_without_service_data_is_allowed() {
        let messenger = Messenger::default();
        let error = RemoteError::message("boom");
        let envelope = messenger.pack(Value::Null, None, Some(&error)).unwrap();
        assert!(envelope.is_error());
    }

    #[test]
    fn test_pack_service_fields_override_id_and_time() {
        let messenger = Messenger::default();
        let fields = ServiceFields::new(kind::RESPONSE, "getX")
            .with_id("fixed-id")
            .with_time(42);
        let envelope = messenger.pack(json!(1), Some(fields), None).unwrap();
        assert_eq!(envelope.id, "fixed-id");
        assert_eq!(envelope.time, 42);
        assert_eq!(envelope.kind, kind::RESPONSE);
    }

    #[test]
    fn test_pack_attaches_credentials() {
        let mut messenger = Messenger::default();
        messenger.set_credentials(Some(json!("secret")));
        let envelope = messenger
            .pack(Value::Null, Some(ServiceFields::new(kind::EVENT, "e")), None)
            .unwrap();
        assert_eq!(envelope.cred, Some(json!("secret")));
    }

    #[test]
    fn test_pack_applies_time_offset() {
        let mut messenger = Messenger::default();
        messenger.set_time_offset(60_000);
        let before = chrono::Utc::now().timestamp_millis();
        let envelope = messenger
            .pack(Value::Null, Some(ServiceFields::new(kind::EVENT, "e")), None)
            .unwrap();
        assert!(envelope.time >= before + 60_000);
    }

    #[test]
    fn test_pack_uses_wrappers() {
        let mut messenger = Messenger::default();
        messenger.set_ok_wrapper(Arc::new(|payload| json!({ "data": payload })));
        messenger.set_error_wrapper(Arc::new(|err| {
            ErrorReport::Message(format!("wrapped: {}", err.message))
        }));

        let ok = messenger
            .pack(json!(5), Some(ServiceFields::new(kind::EVENT, "e")), None)
            .unwrap();
        assert_eq!(ok.payload, json!({"data": 5}));

        let failed = messenger
            .pack(Value::Null, None, Some(&RemoteError::message("x")))
            .unwrap();
        assert_eq!(failed.error, Some(ErrorReport::Message("wrapped: x".into())));
    }

    #[test]
    fn test_unpack_errored_envelope_raises_remote_error() {
        let messenger = Messenger::default();
        let error = RemoteError::new("E_NOPE", "not allowed");
        let envelope = messenger
            .pack(
                Value::Null,
                Some(ServiceFields::new(kind::RESPONSE, "getX")),
                Some(&error),
            )
            .unwrap();

        match messenger.unpack(envelope) {
            Err(ProtocolError::Remote(remote)) => {
                assert_eq!(remote.to_string(), "E_NOPE: not allowed");
                assert!(remote.report.is_some());
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_unpack_string_error_becomes_message() {
        let messenger = Messenger::default();
        let mut envelope = messenger
            .pack(Value::Null, Some(ServiceFields::new(kind::RESPONSE, "x")), None)
            .unwrap();
        envelope.error = Some(ErrorReport::Message("plain failure".into()));

        match messenger.unpack(envelope) {
            Err(ProtocolError::Remote(remote)) => {
                assert_eq!(remote.code, None);
                assert_eq!(remote.message, "plain failure");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    // =====================================================================
    // validate
    // =====================================================================

    fn envelope(id: &str, kind: &str, name: &str) -> Envelope {
        Envelope {
            id: id.into(),
            time: 0,
            kind: kind.into(),
            name: name.into(),
            payload: Value::Null,
            cred: None,
            error: None,
        }
    }

    fn fresh_id() -> String {
        Uuid::new_v4().to_string()
    }

    #[test]
    fn test_validate_rejects_malformed_id() {
        let messenger = messenger_with(kind::EVENT, "tick");
        let result = messenger.validate(&envelope("not-a-uuid", kind::EVENT, "tick"));
        match result {
            Err(err @ ProtocolError::InvalidId(_)) => {
                assert!(err.to_string().contains("id not valid"));
            }
            other => panic!("expected InvalidId, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_non_v4_uuid() {
        let messenger = messenger_with(kind::EVENT, "tick");
        // A well-formed version 1 UUID.
        let v1 = "a8098c1a-f86e-11da-bd1a-00112444be1e";
        let result = messenger.validate(&envelope(v1, kind::EVENT, "tick"));
        assert!(matches!(result, Err(ProtocolError::InvalidId(_))));
    }

    #[test]
    fn test_validate_secure_without_validator_is_unauthorized() {
        let mut messenger = Messenger::new(MessengerConfig {
            secure: true,
            ..MessengerConfig::default()
        });
        messenger.enable_route(kind::EVENT, "tick");
        let result = messenger.validate(&envelope(&fresh_id(), kind::EVENT, "tick"));
        assert!(matches!(result, Err(ProtocolError::Unauthorized(_))));
    }

    #[test]
    fn test_validate_secure_allows_security_exceptions() {
        let mut messenger = Messenger::new(MessengerConfig {
            secure: true,
            ..MessengerConfig::default()
        });
        messenger.enable_route(kind::SERVICE, service::UPDATE_TOKEN);
        let env = envelope(&fresh_id(), kind::SERVICE, service::UPDATE_TOKEN);
        messenger.validate(&env).unwrap();
    }

    #[test]
    fn test_validate_custom_validator_decides() {
        let mut messenger = Messenger::new(MessengerConfig {
            secure: true,
            ..MessengerConfig::default()
        });
        messenger.enable_route(kind::EVENT, "tick");
        messenger.set_validator(Arc::new(|cred, _| cred == Some(&json!("good"))));

        let mut env = envelope(&fresh_id(), kind::EVENT, "tick");
        assert!(matches!(
            messenger.validate(&env),
            Err(ProtocolError::Unauthorized(_))
        ));

        env.cred = Some(json!("good"));
        messenger.validate(&env).unwrap();
    }

    #[test]
    fn test_validate_unknown_type() {
        let messenger = Messenger::default();
        let result = messenger.validate(&envelope(&fresh_id(), "gossip", "x"));
        assert!(matches!(result, Err(ProtocolError::UnknownType(k)) if k == "gossip"));
    }

    #[test]
    fn test_validate_unknown_route_names_the_pair() {
        let messenger = Messenger::default();
        let result = messenger.validate(&envelope(&fresh_id(), kind::REQUEST, "getX"));
        match result {
            Err(err @ ProtocolError::UnknownRoute(_)) => {
                assert!(err.to_string().contains("request/getX"));
            }
            other => panic!("expected UnknownRoute, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_checks_can_be_disabled() {
        let messenger = Messenger::new(MessengerConfig {
            check_types: false,
            check_routes: false,
            ..MessengerConfig::default()
        });
        messenger
            .validate(&envelope(&fresh_id(), "gossip", "anything"))
            .unwrap();
    }

    // =====================================================================
    // Route table
    // =====================================================================

    #[test]
    fn test_enable_route_is_idempotent() {
        let mut messenger = Messenger::default();
        messenger.enable_route(kind::REQUEST, "getX");
        messenger.enable_route(kind::REQUEST, "getX");
        assert!(messenger.is_route_enabled(kind::REQUEST, "getX"));

        messenger.disable_route(kind::REQUEST, "getX");
        assert!(!messenger.is_route_enabled(kind::REQUEST, "getX"));
    }

    #[test]
    fn test_disable_missing_route_is_noop() {
        let mut messenger = Messenger::default();
        messenger.disable_route(kind::REQUEST, "never");
        messenger.disable_route("nokind", "never");
        assert!(!messenger.is_route_enabled(kind::REQUEST, "never"));
    }

    #[test]
    fn test_enable_route_registers_new_kind() {
        let mut messenger = Messenger::default();
        assert!(!messenger.is_type_registered("gossip"));
        messenger.enable_route("gossip", "rumor");
        assert!(messenger.is_type_registered("gossip"));
    }

    #[test]
    fn test_accessors_read_envelope_fields() {
        let mut env = envelope("id-1", kind::EVENT, "tick");
        env.cred = Some(json!("c"));
        env.payload = json!([1, 2]);
        assert_eq!(Messenger::service(&env).name, "tick");
        assert_eq!(Messenger::cred(&env), Some(&json!("c")));
        assert_eq!(Messenger::payload(&env), &json!([1, 2]));
    }
}

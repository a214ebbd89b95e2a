//! Action trait registry.
//!
//! Maps an action name to its request/response payload pair. Each entry is
//! an [`ActionTrait`]: a small table of monomorphized decode functions, so
//! the registry can turn an untyped `serde_json::Value` into a boxed typed
//! payload without runtime reflection.
//!
//! The registry is built once at startup and shared read-only
//! (`Arc<TraitRegistry>`); lookups need no locking.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::envelope::{Call, Envelope};
use crate::error::{DecodeError, ErrorCode};
use crate::validate::{Validate, Violation};

// ── Typed payloads ───────────────────────────────────────────────────

/// Object-safe view of a typed request or response payload.
pub trait Payload: fmt::Debug + Send + Sync + 'static {
    fn check(&self) -> Result<(), Violation>;
    fn to_value(&self) -> Result<Value, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> Payload for T
where
    T: Serialize + Validate + fmt::Debug + Send + Sync + 'static,
{
    fn check(&self) -> Result<(), Violation> {
        self.validate()
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

impl dyn Payload {
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    /// Recover the concrete payload, or give the box back on mismatch.
    pub fn downcast<T: Payload>(self: Box<Self>) -> Result<Box<T>, Box<dyn Payload>> {
        if !self.as_any().is::<T>() {
            return Err(self);
        }
        // Safety: the concrete type was just checked to be `T`; this is
        // the same cast `Box<dyn Any>::downcast` performs.
        let raw = Box::into_raw(self) as *mut T;
        Ok(unsafe { Box::from_raw(raw) })
    }
}

/// Payload bound shared by every request and response type.
pub trait PayloadType:
    Payload + Serialize + DeserializeOwned + Validate + Clone + PartialEq
{
}

impl<T> PayloadType for T where
    T: Payload + Serialize + DeserializeOwned + Validate + Clone + PartialEq
{
}

/// Static description of one OCPP action.
pub trait Action: 'static {
    const NAME: &'static str;
    type Request: PayloadType;
    type Response: PayloadType;
}

// ── Trait table ──────────────────────────────────────────────────────

type DecodeFn = fn(Value) -> Result<Box<dyn Payload>, DecodeError>;

fn decode_typed<T: PayloadType>(value: Value) -> Result<Box<dyn Payload>, DecodeError> {
    let typed: T = serde_json::from_value(value).map_err(|e| DecodeError::from_payload(&e))?;
    typed.validate()?;
    Ok(Box::new(typed))
}

/// Registry entry for one action.
#[derive(Clone, Copy)]
pub struct ActionTrait {
    action: &'static str,
    request: DecodeFn,
    response: DecodeFn,
}

impl ActionTrait {
    pub fn of<A: Action>() -> Self {
        Self {
            action: A::NAME,
            request: decode_typed::<A::Request>,
            response: decode_typed::<A::Response>,
        }
    }

    pub fn action(&self) -> &'static str {
        self.action
    }

    /// Decode and validate a request payload.
    pub fn decode_request(&self, payload: Value) -> Result<Box<dyn Payload>, DecodeError> {
        (self.request)(payload)
    }

    /// Decode and validate a response payload.
    pub fn decode_response(&self, payload: Value) -> Result<Box<dyn Payload>, DecodeError> {
        (self.response)(payload)
    }
}

impl fmt::Debug for ActionTrait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionTrait").field("action", &self.action).finish()
    }
}

/// Action name → [`ActionTrait`].
#[derive(Debug, Default, Clone)]
pub struct TraitRegistry {
    traits: HashMap<&'static str, ActionTrait>,
}

impl TraitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every action this crate ships.
    pub fn ocpp16() -> Self {
        let mut registry = Self::new();
        crate::actions::register_all(&mut registry);
        registry
    }

    /// Register an action. A later registration under the same name wins.
    pub fn register(&mut self, entry: ActionTrait) -> &mut Self {
        self.traits.insert(entry.action, entry);
        self
    }

    pub fn register_action<A: Action>(&mut self) -> &mut Self {
        self.register(ActionTrait::of::<A>())
    }

    pub fn lookup(&self, action: &str) -> Option<&ActionTrait> {
        self.traits.get(action)
    }

    pub fn contains(&self, action: &str) -> bool {
        self.traits.contains_key(action)
    }

    pub fn len(&self) -> usize {
        self.traits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traits.is_empty()
    }

    pub fn actions(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.traits.keys().copied()
    }

    /// Parse an inbound frame. A `Call` for an action that is not
    /// registered is rejected with `NotSupported`.
    pub fn decode(&self, text: &str) -> Result<Envelope, DecodeError> {
        let envelope = Envelope::parse(text)?;
        if let Envelope::Call(call) = &envelope {
            if !self.contains(&call.action) {
                return Err(DecodeError::new(
                    ErrorCode::NotSupported,
                    format!("action '{}' is not supported", call.action),
                )
                .with_unique_id(&call.unique_id));
            }
        }
        Ok(envelope)
    }

    /// Full validation of an outbound call: structure, registration, and
    /// the typed payload's semantic constraints.
    pub fn validate_call(&self, call: &Call) -> Result<Box<dyn Payload>, DecodeError> {
        call.validate_structure()?;
        let entry = self.lookup(&call.action).ok_or_else(|| {
            DecodeError::new(
                ErrorCode::NotSupported,
                format!("action '{}' is not supported", call.action),
            )
            .with_unique_id(&call.unique_id)
        })?;
        entry
            .decode_request(call.payload.clone())
            .map_err(|e| e.with_unique_id(&call.unique_id))
    }
}

/// Build a `Call` from a typed request.
pub fn call_for<A: Action>(
    unique_id: impl Into<String>,
    request: &A::Request,
) -> Result<Call, serde_json::Error> {
    Ok(Call::new(unique_id, A::NAME, serde_json::to_value(request)?))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{
        BootNotification, BootNotificationRequest, Heartbeat, HeartbeatRequest, Reset,
        ResetRequest, ResetType,
    };
    use crate::envelope::{CallError, CallResult};
    use serde_json::json;

    fn boot_request() -> BootNotificationRequest {
        BootNotificationRequest {
            charge_point_vendor: "VendorX".into(),
            charge_point_model: "ModelY".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_lookup_registered_and_missing() {
        let registry = TraitRegistry::ocpp16();
        assert!(registry.lookup("BootNotification").is_some());
        assert!(registry.lookup("DataTransfer").is_none());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_register_last_write_wins() {
        let mut registry = TraitRegistry::new();
        registry.register_action::<Heartbeat>();
        registry.register_action::<Heartbeat>();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_decode_unregistered_action_is_not_supported() {
        let mut registry = TraitRegistry::new();
        registry.register_action::<Heartbeat>();
        let err = registry
            .decode(r#"[2,"u1","BootNotification",{}]"#)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::NotSupported);
        assert_eq!(err.unique_id.as_deref(), Some("u1"));
    }

    #[test]
    fn test_round_trip_every_registered_action() {
        let registry = TraitRegistry::ocpp16();
        for action in registry.actions() {
            let call = Envelope::Call(Call::new("rt-1", action, json!({})));
            let text = call.to_text().unwrap();
            assert_eq!(registry.decode(&text).unwrap(), call);

            let result = Envelope::CallResult(CallResult::new("rt-2", json!({"k": [1, 2]})));
            assert_eq!(registry.decode(&result.to_text().unwrap()).unwrap(), result);

            let error = Envelope::CallError(CallError::new(
                "rt-3",
                ErrorCode::InternalError,
                format!("{} failed", action),
            ));
            assert_eq!(registry.decode(&error.to_text().unwrap()).unwrap(), error);
        }
    }

    #[test]
    fn test_typed_decode_and_downcast() {
        let registry = TraitRegistry::ocpp16();
        let entry = registry.lookup(BootNotification::NAME).unwrap();
        let payload = serde_json::to_value(boot_request()).unwrap();
        let decoded = entry.decode_request(payload).unwrap();
        assert_eq!(
            decoded.downcast_ref::<BootNotificationRequest>(),
            Some(&boot_request())
        );
        let typed = decoded.downcast::<BootNotificationRequest>().unwrap();
        assert_eq!(typed.charge_point_vendor, "VendorX");
    }

    #[test]
    fn test_downcast_mismatch_returns_box() {
        let payload: Box<dyn Payload> = Box::new(HeartbeatRequest {});
        let back = payload.downcast::<ResetRequest>().unwrap_err();
        assert!(back.downcast_ref::<HeartbeatRequest>().is_some());
        // The returned box is intact and still downcasts to its own type.
        let typed = back.downcast::<HeartbeatRequest>().unwrap();
        assert_eq!(*typed, HeartbeatRequest {});
    }

    #[test]
    fn test_validate_call() {
        let registry = TraitRegistry::ocpp16();

        let call = call_for::<Reset>("c1", &ResetRequest { kind: ResetType::Soft }).unwrap();
        assert!(registry.validate_call(&call).is_ok());

        let missing = Call::new("c2", "Reset", json!({}));
        let err = registry.validate_call(&missing).unwrap_err();
        assert_eq!(err.code, ErrorCode::OccurenceConstraintViolation);
        assert_eq!(err.unique_id.as_deref(), Some("c2"));

        let unknown = Call::new("c3", "UnlockConnector", json!({}));
        assert_eq!(
            registry.validate_call(&unknown).unwrap_err().code,
            ErrorCode::NotSupported
        );

        let mut too_long = boot_request();
        too_long.charge_point_vendor = "v".repeat(21);
        let call = call_for::<BootNotification>("c4", &too_long).unwrap();
        assert_eq!(
            registry.validate_call(&call).unwrap_err().code,
            ErrorCode::PropertyConstraintViolation
        );
    }
}

//! OCPP-J message envelope.
//!
//! Every WebSocket text frame is a JSON array whose first element is the
//! message type id:
//!
//! ```text
//! Call        [2, "<uniqueId>", "<action>", {payload}]
//! CallResult  [3, "<uniqueId>", {payload}]
//! CallError   [4, "<uniqueId>", "<errorCode>", "<errorDescription>", {errorDetails}]
//! ```
//!
//! The positional-array form is what peers expect on the wire, so encoding
//! goes through serde tuples, never through a map.

use serde::ser::{Serialize, SerializeTuple, Serializer};
use serde_json::{Map, Value};

use crate::error::{DecodeError, ErrorCode};

/// Maximum length of a uniqueId, in characters.
pub const MAX_UNIQUE_ID_LEN: usize = 36;

/// Message type id, the leading integer of every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements a frame of this type carries.
    pub fn arity(&self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// A request, sent by either side.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub unique_id: String,
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(unique_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            unique_id: unique_id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Structural checks that do not need the trait registry.
    pub fn validate_structure(&self) -> Result<(), DecodeError> {
        check_unique_id(&self.unique_id)?;
        if self.action.is_empty() {
            return Err(DecodeError::new(
                ErrorCode::FormationViolation,
                "action must not be empty",
            )
            .with_unique_id(&self.unique_id));
        }
        if !self.payload.is_object() {
            return Err(DecodeError::new(
                ErrorCode::TypeConstraintViolation,
                "payload must be a JSON object",
            )
            .with_unique_id(&self.unique_id));
        }
        Ok(())
    }
}

/// Successful reply to a [`Call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub unique_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(unique_id: impl Into<String>, payload: Value) -> Self {
        Self {
            unique_id: unique_id.into(),
            payload,
        }
    }
}

/// Error reply to a [`Call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub unique_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        unique_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            unique_id: unique_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Map::new()),
        }
    }

    /// Reply for a frame that failed to decode. Falls back to `"-1"` when
    /// no uniqueId could be recovered from the frame.
    pub fn from_decode(err: &DecodeError) -> Self {
        let unique_id = err.unique_id.clone().unwrap_or_else(|| "-1".to_string());
        Self::new(unique_id, err.code, err.description.clone())
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call(_) => MessageType::Call,
            Envelope::CallResult(_) => MessageType::CallResult,
            Envelope::CallError(_) => MessageType::CallError,
        }
    }

    pub fn unique_id(&self) -> &str {
        match self {
            Envelope::Call(c) => &c.unique_id,
            Envelope::CallResult(r) => &r.unique_id,
            Envelope::CallError(e) => &e.unique_id,
        }
    }

    /// Parse a text frame. Does not consult the trait registry; see
    /// `TraitRegistry::decode` for the full inbound path.
    pub fn parse(text: &str) -> Result<Envelope, DecodeError> {
        let value: Value = serde_json::from_str(text).map_err(|e| {
            DecodeError::new(ErrorCode::FormationViolation, format!("invalid JSON: {}", e))
        })?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Envelope, DecodeError> {
        let items = match value {
            Value::Array(items) => items,
            _ => {
                return Err(DecodeError::new(
                    ErrorCode::FormationViolation,
                    "message is not a JSON array",
                ))
            }
        };

        let recovered = items
            .get(1)
            .and_then(Value::as_str)
            .filter(|uid| !uid.is_empty() && uid.chars().count() <= MAX_UNIQUE_ID_LEN)
            .map(str::to_string);
        let fail = |code: ErrorCode, description: String| {
            let err = DecodeError::new(code, description);
            match &recovered {
                Some(uid) => err.with_unique_id(uid),
                None => err,
            }
        };

        let tag = items.first().and_then(Value::as_u64).ok_or_else(|| {
            fail(
                ErrorCode::FormationViolation,
                "first element must be an integer message type id".into(),
            )
        })?;
        let message_type = MessageType::from_tag(tag).ok_or_else(|| {
            fail(
                ErrorCode::NotSupported,
                format!("unsupported message type id {}", tag),
            )
        })?;
        if items.len() != message_type.arity() {
            return Err(fail(
                ErrorCode::FormationViolation,
                format!(
                    "message type {} expects {} elements, got {}",
                    tag,
                    message_type.arity(),
                    items.len()
                ),
            ));
        }

        let mut it = items.into_iter().skip(1);
        let unique_id = match it.next() {
            Some(Value::String(uid)) => uid,
            _ => {
                return Err(fail(
                    ErrorCode::TypeConstraintViolation,
                    "uniqueId must be a string".into(),
                ))
            }
        };
        check_unique_id(&unique_id)?;

        let mut next = || it.next().unwrap_or(Value::Null);
        match message_type {
            MessageType::Call => {
                let action = match next() {
                    Value::String(action) if !action.is_empty() => action,
                    Value::String(_) => {
                        return Err(fail(
                            ErrorCode::FormationViolation,
                            "action must not be empty".into(),
                        ))
                    }
                    _ => {
                        return Err(fail(
                            ErrorCode::TypeConstraintViolation,
                            "action must be a string".into(),
                        ))
                    }
                };
                let payload = next();
                let call = Call {
                    unique_id,
                    action,
                    payload,
                };
                call.validate_structure()?;
                Ok(Envelope::Call(call))
            }
            MessageType::CallResult => Ok(Envelope::CallResult(CallResult {
                unique_id,
                payload: next(),
            })),
            MessageType::CallError => {
                let error_code = match next() {
                    Value::String(code) => ErrorCode::parse(&code).unwrap_or(ErrorCode::GenericError),
                    _ => {
                        return Err(fail(
                            ErrorCode::TypeConstraintViolation,
                            "errorCode must be a string".into(),
                        ))
                    }
                };
                let error_description = match next() {
                    Value::String(desc) => desc,
                    _ => {
                        return Err(fail(
                            ErrorCode::TypeConstraintViolation,
                            "errorDescription must be a string".into(),
                        ))
                    }
                };
                let error_details = next();
                if !error_details.is_object() {
                    return Err(fail(
                        ErrorCode::TypeConstraintViolation,
                        "errorDetails must be a JSON object".into(),
                    ));
                }
                Ok(Envelope::CallError(CallError {
                    unique_id,
                    error_code,
                    error_description,
                    error_details,
                }))
            }
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A uniqueId must be a non-empty string of at most 36 characters.
pub fn check_unique_id(unique_id: &str) -> Result<(), DecodeError> {
    if unique_id.is_empty() {
        return Err(DecodeError::new(
            ErrorCode::PropertyConstraintViolation,
            "uniqueId must not be empty",
        ));
    }
    let len = unique_id.chars().count();
    if len > MAX_UNIQUE_ID_LEN {
        return Err(DecodeError::new(
            ErrorCode::PropertyConstraintViolation,
            format!("uniqueId length {} exceeds {}", len, MAX_UNIQUE_ID_LEN),
        ));
    }
    Ok(())
}

// ── Positional-array encoding ───────────────────────────────────────

impl Serialize for Call {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(4)?;
        tup.serialize_element(&(MessageType::Call as u8))?;
        tup.serialize_element(&self.unique_id)?;
        tup.serialize_element(&self.action)?;
        tup.serialize_element(&self.payload)?;
        tup.end()
    }
}

impl Serialize for CallResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(3)?;
        tup.serialize_element(&(MessageType::CallResult as u8))?;
        tup.serialize_element(&self.unique_id)?;
        tup.serialize_element(&self.payload)?;
        tup.end()
    }
}

impl Serialize for CallError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(5)?;
        tup.serialize_element(&(MessageType::CallError as u8))?;
        tup.serialize_element(&self.unique_id)?;
        tup.serialize_element(&self.error_code)?;
        tup.serialize_element(&self.error_description)?;
        tup.serialize_element(&self.error_details)?;
        tup.end()
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Envelope::Call(c) => c.serialize(serializer),
            Envelope::CallResult(r) => r.serialize(serializer),
            Envelope::CallError(e) => e.serialize(serializer),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

//! Wire-visible error taxonomy and decode errors.
//!
//! `ErrorCode` is what travels in `CallError.errorCode`. The spellings are
//! fixed by OCPP-J 1.6, including `OccurenceConstraintViolation`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// OCPP-J 1.6 `CallError` error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Requested action is not known by the receiver.
    NotImplemented,
    /// Requested action is recognized but not supported.
    NotSupported,
    /// Receiver failed to process the action.
    InternalError,
    /// Payload for action is incomplete.
    ProtocolError,
    /// Security issue during processing.
    SecurityError,
    /// Payload is syntactically incorrect or the frame is malformed.
    FormationViolation,
    /// A field has an invalid value (length, range, enum member).
    PropertyConstraintViolation,
    /// A required field is missing.
    OccurenceConstraintViolation,
    /// A field has the wrong JSON type.
    TypeConstraintViolation,
    /// Any other error.
    GenericError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 10] = [
        ErrorCode::NotImplemented,
        ErrorCode::NotSupported,
        ErrorCode::InternalError,
        ErrorCode::ProtocolError,
        ErrorCode::SecurityError,
        ErrorCode::FormationViolation,
        ErrorCode::PropertyConstraintViolation,
        ErrorCode::OccurenceConstraintViolation,
        ErrorCode::TypeConstraintViolation,
        ErrorCode::GenericError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire spelling. Unknown codes return `None`.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|code| code.as_str() == s)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame or payload that could not be decoded.
///
/// Carries the uniqueId when one could be recovered from the frame so the
/// caller can answer with a correlated `CallError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {description}")]
pub struct DecodeError {
    pub unique_id: Option<String>,
    pub code: ErrorCode,
    pub description: String,
}

impl DecodeError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            unique_id: None,
            code,
            description: description.into(),
        }
    }

    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Map a serde payload error onto the OCPP taxonomy.
    pub fn from_payload(err: &serde_json::Error) -> Self {
        let msg = err.to_string();
        let code = if msg.starts_with("missing field") {
            ErrorCode::OccurenceConstraintViolation
        } else if msg.starts_with("invalid type") {
            ErrorCode::TypeConstraintViolation
        } else if err.is_data() {
            ErrorCode::PropertyConstraintViolation
        } else {
            ErrorCode::GenericError
        };
        Self::new(code, msg)
    }
}

// ============================================================================
// Tests
// ============================================================================

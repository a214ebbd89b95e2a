//! Semantic payload validation.
//!
//! Structural validation (JSON shape, types, required fields) happens while
//! serde decodes a payload. `Validate` covers what the type system cannot:
//! OCPP `CiStringN` length limits and numeric ranges.

use std::fmt;

use crate::error::{DecodeError, ErrorCode};

/// A payload field that failed a semantic constraint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: ErrorCode,
    pub field: &'static str,
    pub message: String,
}

impl Violation {
    pub fn property(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::PropertyConstraintViolation,
            field,
            message: message.into(),
        }
    }

    pub fn occurrence(field: &'static str) -> Self {
        Self {
            code: ErrorCode::OccurenceConstraintViolation,
            field,
            message: "required field is missing".into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field '{}': {}", self.field, self.message)
    }
}

impl std::error::Error for Violation {}

impl From<Violation> for DecodeError {
    fn from(v: Violation) -> Self {
        DecodeError::new(v.code, v.to_string())
    }
}

/// Semantic validation for a typed payload.
pub trait Validate {
    fn validate(&self) -> Result<(), Violation>;
}

/// Enforce an OCPP `CiStringN` limit (length counted in characters).
pub fn check_max_len(field: &'static str, value: &str, max: usize) -> Result<(), Violation> {
    let len = value.chars().count();
    if len > max {
        return Err(Violation::property(
            field,
            format!("length {} exceeds maximum {}", len, max),
        ));
    }
    Ok(())
}

/// Same as [`check_max_len`] for optional fields; `None` always passes.
pub fn check_opt_max_len(
    field: &'static str,
    value: Option<&str>,
    max: usize,
) -> Result<(), Violation> {
    match value {
        Some(v) => check_max_len(field, v, max),
        None => Ok(()),
    }
}

/// Inclusive range check.
pub fn check_range<T>(field: &'static str, value: T, min: T, max: T) -> Result<(), Violation>
where
    T: PartialOrd + fmt::Display,
{
    if value < min || value > max {
        return Err(Violation::property(
            field,
            format!("value {} outside [{}, {}]", value, min, max),
        ));
    }
    Ok(())
}

use serde::{Deserialize, Serialize};

use crate::registry::Action;
use crate::validate::{Validate, Violation};

pub struct Reset;

impl Action for Reset {
    const NAME: &'static str = "Reset";
    type Request = ResetRequest;
    type Response = ResetResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetType {
    Hard,
    Soft,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetRequest {
    #[serde(rename = "type")]
    pub kind: ResetType,
}

impl Validate for ResetRequest {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResetStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetResponse {
    pub status: ResetStatus,
}

impl Validate for ResetResponse {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::Action;
use crate::validate::{Validate, Violation};

pub struct Heartbeat;

impl Action for Heartbeat {
    const NAME: &'static str = "Heartbeat";
    type Request = HeartbeatRequest;
    type Response = HeartbeatResponse;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRequest {}

impl Validate for HeartbeatRequest {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: DateTime<Utc>,
}

impl Validate for HeartbeatResponse {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

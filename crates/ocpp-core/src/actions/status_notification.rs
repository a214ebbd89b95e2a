use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::Action;
use crate::validate::{check_max_len, check_opt_max_len, check_range, Validate, Violation};

pub struct StatusNotification;

impl Action for StatusNotification {
    const NAME: &'static str = "StatusNotification";
    type Request = StatusNotificationRequest;
    type Response = StatusNotificationResponse;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointErrorCode {
    ConnectorLockFailure,
    EVCommunicationError,
    GroundFailure,
    HighTemperature,
    InternalError,
    LocalListConflict,
    NoError,
    OtherError,
    OverCurrentFailure,
    PowerMeterFailure,
    PowerSwitchFailure,
    ReaderFailure,
    ResetFailure,
    UnderVoltage,
    OverVoltage,
    WeakSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargePointStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEVSE,
    SuspendedEV,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub connector_id: i32,
    pub error_code: ChargePointErrorCode,
    pub status: ChargePointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
}

impl Validate for StatusNotificationRequest {
    fn validate(&self) -> Result<(), Violation> {
        check_range("connectorId", self.connector_id, 0, i32::MAX)?;
        check_opt_max_len("info", self.info.as_deref(), 50)?;
        if let Some(vendor_id) = &self.vendor_id {
            check_max_len("vendorId", vendor_id, 255)?;
        }
        check_opt_max_len("vendorErrorCode", self.vendor_error_code.as_deref(), 50)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationResponse {}

impl Validate for StatusNotificationResponse {
    fn validate(&self) -> Result<(), Violation> {
        Ok(())
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::Action;
use crate::validate::{check_max_len, check_opt_max_len, check_range, Validate, Violation};

pub struct BootNotification;

impl Action for BootNotification {
    const NAME: &'static str = "BootNotification";
    type Request = BootNotificationRequest;
    type Response = BootNotificationResponse;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iccid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imsi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
}

impl Validate for BootNotificationRequest {
    fn validate(&self) -> Result<(), Violation> {
        check_max_len("chargePointVendor", &self.charge_point_vendor, 20)?;
        check_max_len("chargePointModel", &self.charge_point_model, 20)?;
        check_opt_max_len(
            "chargePointSerialNumber",
            self.charge_point_serial_number.as_deref(),
            25,
        )?;
        check_opt_max_len(
            "chargeBoxSerialNumber",
            self.charge_box_serial_number.as_deref(),
            25,
        )?;
        check_opt_max_len("firmwareVersion", self.firmware_version.as_deref(), 50)?;
        check_opt_max_len("iccid", self.iccid.as_deref(), 20)?;
        check_opt_max_len("imsi", self.imsi.as_deref(), 20)?;
        check_opt_max_len("meterType", self.meter_type.as_deref(), 25)?;
        check_opt_max_len("meterSerialNumber", self.meter_serial_number.as_deref(), 25)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: DateTime<Utc>,
    /// Heartbeat interval in seconds.
    pub interval: i32,
    pub status: RegistrationStatus,
}

impl Validate for BootNotificationResponse {
    fn validate(&self) -> Result<(), Violation> {
        check_range("interval", self.interval, 0, i32::MAX)
    }
}

//! Representative OCPP 1.6 actions.
//!
//! | Action             | Initiator     |
//! |--------------------|---------------|
//! | BootNotification   | charge point  |
//! | Heartbeat          | charge point  |
//! | StatusNotification | charge point  |
//! | Reset              | central system|
//!
//! Payload shapes are plain data; adding an action means adding a module
//! with its request/response types and one line in [`register_all`].

mod boot_notification;
mod heartbeat;
mod reset;
mod status_notification;

pub use boot_notification::{
    BootNotification, BootNotificationRequest, BootNotificationResponse, RegistrationStatus,
};
pub use heartbeat::{Heartbeat, HeartbeatRequest, HeartbeatResponse};
pub use reset::{Reset, ResetRequest, ResetResponse, ResetStatus, ResetType};
pub use status_notification::{
    ChargePointErrorCode, ChargePointStatus, StatusNotification, StatusNotificationRequest,
    StatusNotificationResponse,
};

use crate::registry::TraitRegistry;

pub fn register_all(registry: &mut TraitRegistry) {
    registry
        .register_action::<BootNotification>()
        .register_action::<Heartbeat>()
        .register_action::<StatusNotification>()
        .register_action::<Reset>();
}

//! Remote vending devices: registry lookups, direct-method commands and liveness.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::RemoteError;
use crate::inventory::SlotLabel;

/// Liveness heuristic
pub mod liveness;

/// IoT hub REST adapter
pub mod hub;

/// In-process device hub
pub mod simulated;

pub use hub::IotHubClient;
pub use liveness::{DeviceLivenessChecker, LivenessReport};
pub use simulated::{SimulatedHub, SimulatedReply};

pub const DISPENSE_METHOD: &str = "dispenseMedicine";
pub const DISPENSE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const SLOT_TEST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_FOUND: u16 = 404;

/// What the registry reports about a device.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeviceTwin {
    pub device_id: String,
    pub last_activity_time: Option<DateTime<Utc>>,
}

/// A direct method addressed to one device.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceMethod {
    pub name: String,
    pub response_timeout: Duration,
    pub payload: Value,
    /// Dispense transaction this call belongs to. Logged, never sent to the device.
    pub correlation_id: Option<String>,
}

impl DeviceMethod {
    pub fn dispense(slot: SlotLabel, quantity: u32) -> Self {
        Self {
            name: DISPENSE_METHOD.to_string(),
            response_timeout: DISPENSE_RESPONSE_TIMEOUT,
            payload: json!({ "slot": slot.to_string(), "quantity": quantity }),
            correlation_id: None,
        }
    }

    pub fn for_transaction(mut self, transaction_id: &str) -> Self {
        self.correlation_id = Some(transaction_id.to_string());
        self
    }

    /// Motor exercise used by technicians; same wire command, shorter timeout.
    pub fn slot_test(slot: SlotLabel, quantity: u32) -> Self {
        Self {
            response_timeout: SLOT_TEST_RESPONSE_TIMEOUT,
            ..Self::dispense(slot, quantity)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MethodResponse {
    pub status: u16,
    #[serde(default)]
    pub payload: Option<Value>,
}

impl MethodResponse {
    pub fn is_success(&self) -> bool {
        self.status == STATUS_OK
    }
}

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// `Ok(None)` when the device is not registered.
    async fn get_twin(&self, device_id: &str) -> Result<Option<DeviceTwin>, RemoteError>;
}

#[async_trait]
pub trait DeviceCommandChannel: Send + Sync {
    /// A device the hub does not know surfaces as [`RemoteError::NotFound`].
    async fn invoke(&self, device_id: &str, method: &DeviceMethod) -> Result<MethodResponse, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispense_payload_addresses_slot_and_quantity() {
        let method = DeviceMethod::dispense(SlotLabel::new(3).unwrap(), 2);

        assert_eq!(method.name, "dispenseMedicine");
        assert_eq!(method.response_timeout, Duration::from_secs(30));
        assert_eq!(method.payload, json!({ "slot": "3", "quantity": 2 }));
        assert_eq!(
            DeviceMethod::slot_test(SlotLabel::new(3).unwrap(), 2).response_timeout,
            Duration::from_secs(10)
        );
    }
}

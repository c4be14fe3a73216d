use serde::{Deserialize, Serialize};

use crate::errors::Error;

pub const MAX_DISPENSE_QUANTITY: u32 = 10;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispenseRequest {
    #[serde(default)]
    pub device_id: String,
    pub medicine_id: i32,
    pub quantity: u32,
}

impl DispenseRequest {
    pub fn validate(&self) -> Result<(), Error> {
        if self.device_id.trim().is_empty() {
            return Err(Error::Validation {
                message: "Device ID is required".to_string(),
            });
        }
        if !(1..=MAX_DISPENSE_QUANTITY).contains(&self.quantity) {
            return Err(Error::Validation {
                message: format!("Quantity must be between 1 and {}", MAX_DISPENSE_QUANTITY),
            });
        }
        Ok(())
    }
}

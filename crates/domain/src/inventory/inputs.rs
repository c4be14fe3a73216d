use serde::{Deserialize, Serialize};

use super::SlotLabel;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignToSlotInput {
    pub machine_id: i32,
    pub medicine_id: i32,
    pub slot: SlotLabel,
    pub quantity: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuantityInput {
    pub quantity: u32,
}

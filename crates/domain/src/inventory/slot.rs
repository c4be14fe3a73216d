use std::fmt;

use chrono::{DateTime, Utc};
use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Physical capacity of a single slot.
pub const SLOT_CAPACITY: u8 = 6;

/// Physical number of dispensing positions in a machine.
pub const SLOTS_PER_MACHINE: u8 = 6;

/// A dispensing position, "1" through "6".
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotLabel(u8);

impl SlotLabel {
    pub fn new(position: u8) -> Result<Self, Error> {
        if (1..=SLOTS_PER_MACHINE).contains(&position) {
            Ok(Self(position))
        } else {
            Err(Error::Validation {
                message: format!("Slot must be between 1 and {}", SLOTS_PER_MACHINE),
            })
        }
    }

    pub fn position(&self) -> u8 {
        self.0
    }

    /// Every label a machine has, in order.
    pub fn all() -> impl Iterator<Item = SlotLabel> {
        (1..=SLOTS_PER_MACHINE).map(SlotLabel)
    }
}

impl fmt::Display for SlotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<&str> for SlotLabel {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let position = value.trim().parse::<u8>().map_err(|_| Error::Validation {
            message: format!("Slot must be between 1 and {}", SLOTS_PER_MACHINE),
        })?;
        Self::new(position)
    }
}

impl TryFrom<String> for SlotLabel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<SlotLabel> for String {
    fn from(label: SlotLabel) -> Self {
        label.to_string()
    }
}

/// One medicine loaded into one slot of one machine.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct MachineSlot {
    pub machine_id: i32,
    pub medicine_id: i32,
    pub slot: SlotLabel,
    pub quantity: u8,
    pub last_restocked: DateTime<Utc>,

    /// Bumped on every write; used for compare-and-swap.
    #[serde(default)]
    pub version: u64,
    /// Id of the mutation that produced this version.
    #[serde(default)]
    pub last_mutation: Option<String>,
}

impl MachineSlot {
    pub fn new(machine_id: i32, medicine_id: i32, slot: SlotLabel, quantity: u8) -> Self {
        Self {
            machine_id,
            medicine_id,
            slot,
            quantity,
            last_restocked: Utc::now(),
            version: 0,
            last_mutation: None,
        }
    }

    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.machine_id, self.medicine_id)
    }

    pub fn free_space(&self) -> u8 {
        SLOT_CAPACITY.saturating_sub(self.quantity)
    }
}

#[derive(new, Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct SlotKey {
    pub machine_id: i32,
    pub medicine_id: i32,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "machine {} / medicine {}", self.machine_id, self.medicine_id)
    }
}

/// Read-only answer to "can this machine hand out that many?".
#[derive(new, Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    pub current_quantity: u8,
    pub slot: SlotLabel,
}

/// One machine carrying a medicine, for "where can I get it?" lookups.
#[derive(new, Clone, Debug, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStock {
    pub machine_id: i32,
    pub location: String,
    pub slot: SlotLabel,
    pub quantity: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_limited_to_six_positions() {
        assert_eq!(SlotLabel::try_from("3").unwrap().position(), 3);
        assert!(SlotLabel::try_from("0").is_err());
        assert!(SlotLabel::try_from("7").is_err());
        assert!(SlotLabel::try_from("A").is_err());
        assert_eq!(SlotLabel::all().count(), SLOTS_PER_MACHINE as usize);
    }

    #[test]
    fn labels_travel_as_strings() {
        let label = SlotLabel::new(2).unwrap();
        assert_eq!(serde_json::to_value(label).unwrap(), serde_json::json!("2"));
        let parsed: SlotLabel = serde_json::from_value(serde_json::json!("5")).unwrap();
        assert_eq!(parsed.position(), 5);
        assert!(serde_json::from_value::<SlotLabel>(serde_json::json!("9")).is_err());
    }
}

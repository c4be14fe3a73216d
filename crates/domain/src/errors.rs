use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::inventory::SlotLabel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Entity not found: {entity}")]
    NotFound { entity: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("{}", .0.message())]
    Capacity(CapacityViolation),

    #[error("Insufficient stock. Available: {available}, Requested: {requested}")]
    OutOfStock { available: u8, requested: u32 },

    #[error("Concurrent update conflict on {key}")]
    Conflict { key: String },

    #[error("Device unreachable: {reason}")]
    DeviceUnreachable { reason: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Failure of a call that crossed a process boundary (registry, device hub, persistence).
///
/// Adapters translate their transport errors into this closed set; the retry policy only
/// ever looks at [`RemoteError::is_transient`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("Connection failure: {message}")]
    Connection { message: String },

    #[error("Server error ({status:?}): {message}")]
    Server { status: Option<u16>, message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Version conflict: {message}")]
    Conflict { message: String },

    #[error("Request rejected: {message}")]
    Rejected { message: String },
}

impl RemoteError {
    /// Timeouts, socket failures and hub/server errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Timeout { .. } | RemoteError::Connection { .. } | RemoteError::Server { .. }
        )
    }
}

/// What currently sits in a slot, reported when an assignment collides with it.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SlotContents {
    pub slot: SlotLabel,
    pub medicine_id: i32,
    pub quantity: u8,
}

/// Structured rejection of a slot assignment. Serialized as-is for the calling UI.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CapacityViolation {
    SlotCapacityExceeded {
        message: String,
        attempted_quantity: u32,
        max_allowed: u8,
    },
    MedicineAlreadyInMachine {
        message: String,
        existing_slot: SlotLabel,
        current_quantity: u8,
    },
    SlotOccupied {
        message: String,
        available_slots: Vec<SlotLabel>,
        current_slot_contents: SlotContents,
    },
    SlotOverfill {
        message: String,
        current_quantity: u8,
        attempted_quantity: u32,
        available_space: u8,
    },
}

impl CapacityViolation {
    pub fn message(&self) -> &str {
        match self {
            CapacityViolation::SlotCapacityExceeded { message, .. }
            | CapacityViolation::MedicineAlreadyInMachine { message, .. }
            | CapacityViolation::SlotOccupied { message, .. }
            | CapacityViolation::SlotOverfill { message, .. } => message,
        }
    }
}

impl From<CapacityViolation> for Error {
    fn from(violation: CapacityViolation) -> Self {
        Error::Capacity(violation)
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::errors::Error;

use super::inputs::DispenseRequest;

/// Outcome of a dispense attempt
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
pub enum DispenseStatus {
    /// Request received, checks still running
    #[default]
    Pending,
    /// Device accepted the command; physical delivery is not confirmed
    InProgress,
    /// Delivery confirmed
    Completed,
    Failed,
    OutOfStock,
    DeviceOffline,
}

impl DispenseStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DispenseStatus::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, DispenseStatus::InProgress | DispenseStatus::Completed)
    }
}

/// Where a pending transaction currently is.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DispenseStage {
    #[default]
    Received,
    ValidatingDevice,
    ValidatingStock,
    ReservingStock,
    InvokingDevice,
}

/// One dispense attempt, owned by a single orchestrator invocation.
///
/// Moves through stages while `Pending`, then settles on exactly one terminal status.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct DispenseTransaction {
    pub transaction_id: String,
    pub device_id: String,
    pub medicine_id: i32,
    pub requested_quantity: u32,
    pub status: DispenseStatus,
    pub stage: DispenseStage,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl DispenseTransaction {
    pub fn start(request: &DispenseRequest) -> Self {
        Self {
            transaction_id: Ulid::new().to_string(),
            device_id: request.device_id.clone(),
            medicine_id: request.medicine_id,
            requested_quantity: request.quantity,
            status: DispenseStatus::Pending,
            stage: DispenseStage::Received,
            message: String::new(),
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn advance(&mut self, stage: DispenseStage) -> Result<(), Error> {
        self.validate_open(format!("{:?}", stage))?;
        tracing::info!("Dispense {} entering {:?}", self.transaction_id, stage);
        self.stage = stage;
        Ok(())
    }

    pub fn finish(&mut self, status: DispenseStatus, message: impl Into<String>) -> Result<(), Error> {
        self.validate_open(format!("{:?}", status))?;
        if !status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", status),
            });
        }

        self.status = status;
        self.message = message.into();
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn validate_open(&self, to: String) -> Result<(), Error> {
        if self.status.is_terminal() {
            return Err(Error::InvalidStateTransition {
                from: format!("{:?}", self.status),
                to,
            });
        }
        Ok(())
    }
}

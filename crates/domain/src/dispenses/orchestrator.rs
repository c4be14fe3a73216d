use std::sync::Arc;

use crate::devices::{
    DeviceCommandChannel, DeviceLivenessChecker, DeviceMethod, DeviceRegistry, MethodResponse, STATUS_NOT_FOUND,
};
use crate::errors::{Error, RemoteError};
use crate::inventory::{SlotInventoryManager, SlotLabel};
use crate::retry::RetryExecutor;

use super::inputs::DispenseRequest;
use super::response::DispenseResponse;
use super::transaction::{DispenseStage, DispenseStatus, DispenseTransaction};

const UNEXPECTED_ERROR_MESSAGE: &str = "An unexpected error occurred. Please try again later.";

struct Outcome {
    status: DispenseStatus,
    message: String,
}

impl Outcome {
    fn new(status: DispenseStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Turns a dispense request into liveness check → stock check → stock reservation →
/// device command, and always answers with a well-formed [`DispenseResponse`].
///
/// Stock is reserved with a compare-and-swap decrement before the device is commanded,
/// so two requests racing for the last units (in one process or several) never both
/// reach the motor. No inventory lock is held while the device is being called.
pub struct DispenseOrchestrator {
    liveness: DeviceLivenessChecker,
    channel: Arc<dyn DeviceCommandChannel>,
    inventory: Arc<SlotInventoryManager>,
    retry: RetryExecutor,
}

impl DispenseOrchestrator {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        channel: Arc<dyn DeviceCommandChannel>,
        inventory: Arc<SlotInventoryManager>,
    ) -> Self {
        Self::with_retry(registry, channel, inventory, RetryExecutor::default())
    }

    pub fn with_retry(
        registry: Arc<dyn DeviceRegistry>,
        channel: Arc<dyn DeviceCommandChannel>,
        inventory: Arc<SlotInventoryManager>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            liveness: DeviceLivenessChecker::new(registry, retry),
            channel,
            inventory,
            retry,
        }
    }

    pub async fn dispense_medicine(&self, request: DispenseRequest) -> DispenseResponse {
        let mut transaction = DispenseTransaction::start(&request);

        let outcome = match self.run(&mut transaction, &request).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(
                    "Unexpected error in dispense {}: {}",
                    transaction.transaction_id,
                    err
                );
                Outcome::new(DispenseStatus::Failed, UNEXPECTED_ERROR_MESSAGE)
            }
        };

        if let Err(err) = transaction.finish(outcome.status, outcome.message) {
            tracing::error!("Dispense {} settled twice: {}", transaction.transaction_id, err);
        }

        tracing::info!(
            "Dispense {} for device {} medicine {} x{} finished as {:?}",
            transaction.transaction_id,
            transaction.device_id,
            transaction.medicine_id,
            transaction.requested_quantity,
            transaction.status
        );

        DispenseResponse::from(&transaction)
    }

    /// Single, unretried motor exercise with the short slot-test timeout.
    pub async fn exercise_slot(
        &self,
        device_id: &str,
        slot: SlotLabel,
        quantity: u32,
    ) -> Result<MethodResponse, Error> {
        if quantity == 0 {
            return Err(Error::Validation {
                message: "Quantity must be greater than 0".to_string(),
            });
        }
        let method = DeviceMethod::slot_test(slot, quantity);

        let result = match tokio::time::timeout(method.response_timeout, self.channel.invoke(device_id, &method)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                operation: "SlotTest".to_string(),
            }),
        };

        match result {
            Ok(response) => {
                tracing::info!(
                    "Slot test on device {} slot {} answered with status {}",
                    device_id,
                    slot,
                    response.status
                );
                Ok(response)
            }
            Err(RemoteError::NotFound { .. }) => Err(Error::DeviceUnreachable {
                reason: format!("Device {} not found or not connected to IoT Hub", device_id),
            }),
            Err(RemoteError::Timeout { .. }) => Err(Error::DeviceUnreachable {
                reason: format!(
                    "Device {} did not answer within {}s",
                    device_id,
                    method.response_timeout.as_secs()
                ),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn run(
        &self,
        transaction: &mut DispenseTransaction,
        request: &DispenseRequest,
    ) -> Result<Outcome, Error> {
        match request.validate() {
            Ok(()) => {}
            Err(Error::Validation { message }) => return Ok(Outcome::new(DispenseStatus::Failed, message)),
            Err(err) => return Ok(Outcome::new(DispenseStatus::Failed, err.to_string())),
        }
        let device_id = request.device_id.trim();
        let Some(machine_id) = machine_for_device(device_id) else {
            return Ok(Outcome::new(
                DispenseStatus::Failed,
                "Device is not linked to a vending machine",
            ));
        };

        transaction.advance(DispenseStage::ValidatingDevice)?;
        let liveness = self.liveness.is_reachable(device_id).await;
        if !liveness.reachable {
            return Ok(Outcome::new(DispenseStatus::DeviceOffline, liveness.reason));
        }

        transaction.advance(DispenseStage::ValidatingStock)?;
        let availability = match self
            .inventory
            .check_availability(machine_id, request.medicine_id, request.quantity)
            .await
        {
            Ok(availability) => availability,
            Err(Error::NotFound { .. }) => {
                return Ok(Outcome::new(DispenseStatus::Failed, "Medicine not found in stock"));
            }
            Err(err) => return Err(err),
        };
        if !availability.available {
            return Ok(Outcome::new(
                DispenseStatus::OutOfStock,
                format!(
                    "Insufficient stock. Available: {}, Requested: {}",
                    availability.current_quantity, request.quantity
                ),
            ));
        }

        // Units are taken before the motor turns; a failed command gives them back.
        transaction.advance(DispenseStage::ReservingStock)?;
        let reserved = match self
            .inventory
            .decrement(machine_id, request.medicine_id, request.quantity)
            .await
        {
            Ok(slot) => slot,
            Err(err @ Error::OutOfStock { .. }) => {
                return Ok(Outcome::new(DispenseStatus::OutOfStock, err.to_string()));
            }
            Err(Error::NotFound { .. }) => {
                return Ok(Outcome::new(DispenseStatus::Failed, "Medicine not found in stock"));
            }
            Err(Error::Conflict { key }) => {
                tracing::warn!("Dispense {} lost the race for {}", transaction.transaction_id, key);
                return Ok(Outcome::new(
                    DispenseStatus::Failed,
                    "Stock is being updated by another request. Please try again.",
                ));
            }
            Err(err) => return Err(err),
        };

        transaction.advance(DispenseStage::InvokingDevice)?;
        let method =
            DeviceMethod::dispense(reserved.slot, request.quantity).for_transaction(&transaction.transaction_id);
        let response = self
            .retry
            .execute_with_timeout("InvokeDeviceMethod", method.response_timeout, || {
                self.channel.invoke(device_id, &method)
            })
            .await;

        let outcome = match response {
            Ok(response) if response.is_success() => {
                Outcome::new(DispenseStatus::InProgress, "Medicine dispensing in progress")
            }
            Ok(response) if response.status == STATUS_NOT_FOUND => Outcome::new(
                DispenseStatus::DeviceOffline,
                "Device not found or not connected to IoT Hub",
            ),
            Ok(response) => {
                tracing::warn!(
                    "Device {} rejected dispense {} with status {}: {:?}",
                    device_id,
                    transaction.transaction_id,
                    response.status,
                    response.payload
                );
                Outcome::new(
                    DispenseStatus::Failed,
                    format!("Device responded with error status {}", response.status),
                )
            }
            Err(RemoteError::NotFound { .. }) => {
                Outcome::new(DispenseStatus::DeviceOffline, "Device not found in IoT Hub")
            }
            Err(err) => {
                tracing::error!(
                    "Error sending dispense {} to device {} after retries: {}",
                    transaction.transaction_id,
                    device_id,
                    err
                );
                Outcome::new(
                    DispenseStatus::Failed,
                    "Failed to send command to device after multiple attempts. Please check device connectivity.",
                )
            }
        };

        if !outcome.status.is_success() {
            self.release(transaction, machine_id, request).await;
        }

        Ok(outcome)
    }

    async fn release(&self, transaction: &DispenseTransaction, machine_id: i32, request: &DispenseRequest) {
        if let Err(err) = self
            .inventory
            .release(machine_id, request.medicine_id, request.quantity)
            .await
        {
            tracing::error!(
                "Dispense {} could not return {} units of medicine {} to machine {}: {}",
                transaction.transaction_id,
                request.quantity,
                request.medicine_id,
                machine_id,
                err
            );
        }
    }
}

/// Devices are provisioned under their machine's numeric id.
fn machine_for_device(device_id: &str) -> Option<i32> {
    device_id.parse().ok()
}

/// Transaction state machine
pub mod transaction;

/// Input DTOs
pub mod inputs;

/// Response DTOs
pub mod response;

/// Dispense orchestration
pub mod orchestrator;

pub use inputs::{DispenseRequest, MAX_DISPENSE_QUANTITY};
pub use orchestrator::DispenseOrchestrator;
pub use response::DispenseResponse;
pub use transaction::{DispenseStage, DispenseStatus, DispenseTransaction};

use serde::{Deserialize, Serialize};

use super::transaction::{DispenseStatus, DispenseTransaction};

/// What callers of the dispense entry point get back, whatever happened.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispenseResponse {
    pub success: bool,
    pub message: String,
    pub transaction_id: String,
    pub status: DispenseStatus,
}

impl From<&DispenseTransaction> for DispenseResponse {
    fn from(transaction: &DispenseTransaction) -> Self {
        Self {
            success: transaction.status.is_success(),
            message: transaction.message.clone(),
            transaction_id: transaction.transaction_id.clone(),
            status: transaction.status,
        }
    }
}

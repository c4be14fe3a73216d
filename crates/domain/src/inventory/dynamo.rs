use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::{BuildError, DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{AttributeValue, Delete, Put, TransactWriteItem},
    Client,
};
use serde::de::DeserializeOwned;

use crate::errors::RemoteError;

use super::repository::{Medicine, MedicineCatalog, SlotRepository, VendingMachine};
use super::slot::MachineSlot;

pub fn init_repo(client: Client) -> Arc<dyn SlotRepository> {
    let table = env::var("DYNAMODB_MACHINE_SLOTS_TABLE").unwrap_or("vending-machine-slots".to_string());
    let labels_table = env::var("DYNAMODB_SLOT_LABELS_TABLE").unwrap_or("vending-slot-labels".to_string());

    Arc::new(DynamoSlotRepository::new(client, table, labels_table))
}

pub fn init_catalog(client: Client) -> Arc<dyn MedicineCatalog> {
    let machines_table = env::var("DYNAMODB_MACHINES_TABLE").unwrap_or("vending-machines".to_string());
    let medicines_table = env::var("DYNAMODB_MEDICINES_TABLE").unwrap_or("vending-medicines".to_string());

    Arc::new(DynamoCatalog::new(client, machines_table, medicines_table))
}

/// Slot records in a table keyed by `machine_id` (partition) and `medicine_id` (sort).
///
/// A second table keyed by `machine_id` and `slot` holds one guard item per occupied
/// label. Guard and record are created and deleted in one transaction, so two writers
/// can never put different medicines behind the same label.
pub struct DynamoSlotRepository {
    client: Client,
    table: String,
    labels_table: String,
}

impl DynamoSlotRepository {
    pub fn new(client: Client, table: String, labels_table: String) -> Self {
        Self {
            client,
            table,
            labels_table,
        }
    }

    async fn create(&self, slot: MachineSlot) -> Result<(), RemoteError> {
        let item = serde_dynamo::to_item(&slot).map_err(|err| RemoteError::Rejected {
            message: format!("Could not encode slot record: {}", err),
        })?;

        let record = Put::builder()
            .table_name(&self.table)
            .set_item(Some(item))
            .condition_expression("attribute_not_exists(machine_id)")
            .build()
            .map_err(invalid_request)?;

        let guard = Put::builder()
            .table_name(&self.labels_table)
            .item("machine_id", number(slot.machine_id))
            .item("slot", AttributeValue::S(slot.slot.to_string()))
            .item("medicine_id", number(slot.medicine_id))
            .condition_expression("attribute_not_exists(machine_id)")
            .build()
            .map_err(invalid_request)?;

        self.client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(record).build())
            .transact_items(TransactWriteItem::builder().put(guard).build())
            .send()
            .await
            .map_err(|err| classify("CreateSlot", err))?;

        Ok(())
    }

    async fn collect_query(&self, machine_id: i32) -> Result<Vec<MachineSlot>, RemoteError> {
        let mut slots = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table)
                .key_condition_expression("machine_id = :machine_id")
                .expression_attribute_values(":machine_id", number(machine_id))
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|err| classify("QuerySlots", err))?;

            for item in output.items() {
                slots.push(from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => break,
            }
        }

        Ok(slots)
    }
}

#[async_trait]
impl SlotRepository for DynamoSlotRepository {
    async fn get(&self, machine_id: i32, medicine_id: i32) -> Result<Option<MachineSlot>, RemoteError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key("machine_id", number(machine_id))
            .key("medicine_id", number(medicine_id))
            .consistent_read(true)
            .send()
            .await
            .map_err(|err| classify("GetSlot", err))?;

        output.item().map(from_item).transpose()
    }

    async fn list_by_machine(&self, machine_id: i32) -> Result<Vec<MachineSlot>, RemoteError> {
        let mut slots = self.collect_query(machine_id).await?;
        slots.sort_by_key(|slot| slot.slot);
        Ok(slots)
    }

    async fn list_low_stock(&self, threshold: u8) -> Result<Vec<MachineSlot>, RemoteError> {
        let mut slots = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression("quantity <= :threshold")
                .expression_attribute_values(":threshold", number(threshold))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|err| classify("ScanLowStock", err))?;

            for item in output.items() {
                slots.push(from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => break,
            }
        }

        slots.sort_by_key(|slot: &MachineSlot| (slot.machine_id, slot.slot));
        Ok(slots)
    }

    async fn list_by_medicine(&self, medicine_id: i32) -> Result<Vec<MachineSlot>, RemoteError> {
        let mut slots = Vec::new();
        let mut start_key: Option<HashMap<String, AttributeValue>> = None;

        loop {
            let output = self
                .client
                .scan()
                .table_name(&self.table)
                .filter_expression("medicine_id = :medicine_id")
                .expression_attribute_values(":medicine_id", number(medicine_id))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|err| classify("ScanMedicineSlots", err))?;

            for item in output.items() {
                slots.push(from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(key) => start_key = Some(key.clone()),
                None => break,
            }
        }

        slots.sort_by_key(|slot: &MachineSlot| slot.machine_id);
        Ok(slots)
    }

    async fn put(&self, slot: MachineSlot, expected_version: Option<u64>) -> Result<(), RemoteError> {
        let Some(version) = expected_version else {
            return self.create(slot).await;
        };

        // the label is fixed for the life of a record, so its guard is left alone
        let item = serde_dynamo::to_item(&slot).map_err(|err| RemoteError::Rejected {
            message: format!("Could not encode slot record: {}", err),
        })?;

        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(item))
            .condition_expression("version = :expected")
            .expression_attribute_values(":expected", number(version))
            .send()
            .await
            .map_err(|err| classify("PutSlot", err))?;
        Ok(())
    }

    async fn delete(&self, machine_id: i32, medicine_id: i32) -> Result<bool, RemoteError> {
        let Some(current) = self.get(machine_id, medicine_id).await? else {
            return Ok(false);
        };

        let record = Delete::builder()
            .table_name(&self.table)
            .key("machine_id", number(machine_id))
            .key("medicine_id", number(medicine_id))
            .condition_expression("attribute_exists(machine_id)")
            .build()
            .map_err(invalid_request)?;

        let guard = Delete::builder()
            .table_name(&self.labels_table)
            .key("machine_id", number(machine_id))
            .key("slot", AttributeValue::S(current.slot.to_string()))
            .condition_expression("medicine_id = :medicine_id")
            .expression_attribute_values(":medicine_id", number(medicine_id))
            .build()
            .map_err(invalid_request)?;

        match self
            .client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().delete(record).build())
            .transact_items(TransactWriteItem::builder().delete(guard).build())
            .send()
            .await
            .map_err(|err| classify("DeleteSlot", err))
        {
            Ok(_) => Ok(true),
            // removed by someone else in between
            Err(RemoteError::Conflict { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

pub struct DynamoCatalog {
    client: Client,
    machines_table: String,
    medicines_table: String,
}

impl DynamoCatalog {
    pub fn new(client: Client, machines_table: String, medicines_table: String) -> Self {
        Self {
            client,
            machines_table,
            medicines_table,
        }
    }
}

#[async_trait]
impl MedicineCatalog for DynamoCatalog {
    async fn machine(&self, machine_id: i32) -> Result<Option<VendingMachine>, RemoteError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.machines_table)
            .key("machine_id", number(machine_id))
            .projection_expression("machine_id, #location")
            .expression_attribute_names("#location", "location")
            .send()
            .await
            .map_err(|err| classify("GetMachine", err))?;

        output.item().map(from_item).transpose()
    }

    async fn medicine(&self, medicine_id: i32) -> Result<Option<Medicine>, RemoteError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.medicines_table)
            .key("medicine_id", number(medicine_id))
            .send()
            .await
            .map_err(|err| classify("GetMedicine", err))?;

        output.item().map(from_item).transpose()
    }

    async fn adjust_stock(&self, medicine_id: i32, delta: i32) -> Result<(), RemoteError> {
        self.client
            .update_item()
            .table_name(&self.medicines_table)
            .key("medicine_id", number(medicine_id))
            .update_expression("ADD stock :delta")
            .condition_expression("attribute_exists(medicine_id)")
            .expression_attribute_values(":delta", number(delta))
            .send()
            .await
            .map_err(|err| match classify("UpdateMedicineStock", err) {
                RemoteError::Conflict { .. } => RemoteError::NotFound {
                    message: format!("medicine {}", medicine_id),
                },
                other => other,
            })?;

        Ok(())
    }
}

fn number(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

fn invalid_request(err: BuildError) -> RemoteError {
    RemoteError::Rejected {
        message: format!("Could not build request: {}", err),
    }
}

fn from_item<T: DeserializeOwned>(item: &HashMap<String, AttributeValue>) -> Result<T, RemoteError> {
    serde_dynamo::from_item(item.clone()).map_err(|err| RemoteError::Rejected {
        message: format!("Could not decode item: {}", err),
    })
}

const TRANSIENT_CODES: &[&str] = &[
    "InternalServerError",
    "ServiceUnavailable",
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "LimitExceededException",
];

/// Maps an SDK failure onto the transient/fatal taxonomy.
fn classify<E, R>(operation: &str, err: SdkError<E, R>) -> RemoteError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = format!("{}: {}", operation, DisplayErrorContext(&err));

    match &err {
        SdkError::TimeoutError(_) => RemoteError::Timeout {
            operation: operation.to_string(),
        },
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => RemoteError::Connection { message },
        SdkError::ServiceError(context) => match context.err().code() {
            Some("ConditionalCheckFailedException")
            | Some("TransactionCanceledException")
            | Some("TransactionConflictException") => RemoteError::Conflict { message },
            Some("ResourceNotFoundException") => RemoteError::NotFound { message },
            Some(code) if TRANSIENT_CODES.contains(&code) => RemoteError::Server { status: None, message },
            _ => RemoteError::Rejected { message },
        },
        _ => RemoteError::Rejected { message },
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::RemoteError;

use super::slot::{MachineSlot, SlotKey};

/// Storage for slot records, keyed by (machine, medicine).
///
/// A slot label belongs to at most one record per machine; creating a record for a label
/// that is already taken is a [`RemoteError::Conflict`], even when the caller raced
/// another process for it.
#[async_trait]
pub trait SlotRepository: Send + Sync {
    async fn get(&self, machine_id: i32, medicine_id: i32) -> Result<Option<MachineSlot>, RemoteError>;

    async fn list_by_machine(&self, machine_id: i32) -> Result<Vec<MachineSlot>, RemoteError>;

    async fn list_low_stock(&self, threshold: u8) -> Result<Vec<MachineSlot>, RemoteError>;

    async fn list_by_medicine(&self, medicine_id: i32) -> Result<Vec<MachineSlot>, RemoteError>;

    /// Writes `slot` if the stored version still equals `expected_version`.
    ///
    /// `None` means the record must not exist yet and its label must be free. A mismatch
    /// yields [`RemoteError::Conflict`].
    async fn put(&self, slot: MachineSlot, expected_version: Option<u64>) -> Result<(), RemoteError>;

    /// Returns whether a record was removed.
    async fn delete(&self, machine_id: i32, medicine_id: i32) -> Result<bool, RemoteError>;
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Medicine {
    pub medicine_id: i32,
    pub name: String,
    /// Advisory, machine-independent stock. May go negative.
    pub stock: i32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct VendingMachine {
    pub machine_id: i32,
    #[serde(default)]
    pub location: String,
}

/// Machines and medicines as seen by the inventory subsystem.
#[async_trait]
pub trait MedicineCatalog: Send + Sync {
    async fn machine(&self, machine_id: i32) -> Result<Option<VendingMachine>, RemoteError>;

    async fn machine_exists(&self, machine_id: i32) -> Result<bool, RemoteError> {
        Ok(self.machine(machine_id).await?.is_some())
    }

    async fn medicine(&self, medicine_id: i32) -> Result<Option<Medicine>, RemoteError>;

    async fn adjust_stock(&self, medicine_id: i32, delta: i32) -> Result<(), RemoteError>;
}

#[derive(Default)]
pub struct InMemorySlotRepository {
    slots: RwLock<HashMap<SlotKey, MachineSlot>>,
}

impl InMemorySlotRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SlotRepository for InMemorySlotRepository {
    async fn get(&self, machine_id: i32, medicine_id: i32) -> Result<Option<MachineSlot>, RemoteError> {
        let slots = self.slots.read().await;
        Ok(slots.get(&SlotKey::new(machine_id, medicine_id)).cloned())
    }

    async fn list_by_machine(&self, machine_id: i32) -> Result<Vec<MachineSlot>, RemoteError> {
        let slots = self.slots.read().await;
        let mut found: Vec<MachineSlot> = slots
            .values()
            .filter(|slot| slot.machine_id == machine_id)
            .cloned()
            .collect();
        found.sort_by_key(|slot| slot.slot);
        Ok(found)
    }

    async fn list_low_stock(&self, threshold: u8) -> Result<Vec<MachineSlot>, RemoteError> {
        let slots = self.slots.read().await;
        let mut found: Vec<MachineSlot> = slots
            .values()
            .filter(|slot| slot.quantity <= threshold)
            .cloned()
            .collect();
        found.sort_by_key(|slot| (slot.machine_id, slot.slot));
        Ok(found)
    }

    async fn list_by_medicine(&self, medicine_id: i32) -> Result<Vec<MachineSlot>, RemoteError> {
        let slots = self.slots.read().await;
        let mut found: Vec<MachineSlot> = slots
            .values()
            .filter(|slot| slot.medicine_id == medicine_id)
            .cloned()
            .collect();
        found.sort_by_key(|slot| slot.machine_id);
        Ok(found)
    }

    async fn put(&self, slot: MachineSlot, expected_version: Option<u64>) -> Result<(), RemoteError> {
        let mut slots = self.slots.write().await;
        let key = slot.key();
        let stored = slots.get(&key).map(|current| current.version);

        if stored != expected_version {
            return Err(RemoteError::Conflict {
                message: format!(
                    "{} is at version {:?}, expected {:?}",
                    key, stored, expected_version
                ),
            });
        }

        if expected_version.is_none() {
            if let Some(holder) = slots
                .values()
                .find(|other| other.machine_id == slot.machine_id && other.slot == slot.slot)
            {
                return Err(RemoteError::Conflict {
                    message: format!(
                        "slot {} of machine {} is held by medicine {}",
                        slot.slot, slot.machine_id, holder.medicine_id
                    ),
                });
            }
        }

        slots.insert(key, slot);
        Ok(())
    }

    async fn delete(&self, machine_id: i32, medicine_id: i32) -> Result<bool, RemoteError> {
        let mut slots = self.slots.write().await;
        Ok(slots.remove(&SlotKey::new(machine_id, medicine_id)).is_some())
    }
}

#[derive(Default)]
pub struct InMemoryCatalog {
    machines: RwLock<HashMap<i32, VendingMachine>>,
    medicines: RwLock<HashMap<i32, Medicine>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_machine(&self, machine_id: i32) {
        self.add_machine_at(machine_id, "").await;
    }

    pub async fn add_machine_at(&self, machine_id: i32, location: &str) {
        self.machines.write().await.insert(
            machine_id,
            VendingMachine {
                machine_id,
                location: location.to_string(),
            },
        );
    }

    pub async fn add_medicine(&self, medicine: Medicine) {
        self.medicines.write().await.insert(medicine.medicine_id, medicine);
    }
}

#[async_trait]
impl MedicineCatalog for InMemoryCatalog {
    async fn machine(&self, machine_id: i32) -> Result<Option<VendingMachine>, RemoteError> {
        Ok(self.machines.read().await.get(&machine_id).cloned())
    }

    async fn medicine(&self, medicine_id: i32) -> Result<Option<Medicine>, RemoteError> {
        Ok(self.medicines.read().await.get(&medicine_id).cloned())
    }

    async fn adjust_stock(&self, medicine_id: i32, delta: i32) -> Result<(), RemoteError> {
        let mut medicines = self.medicines.write().await;
        let medicine = medicines.get_mut(&medicine_id).ok_or_else(|| RemoteError::NotFound {
            message: format!("medicine {}", medicine_id),
        })?;
        medicine.stock += delta;
        Ok(())
    }
}

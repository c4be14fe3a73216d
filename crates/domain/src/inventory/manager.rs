use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use ulid::Ulid;

use crate::errors::{CapacityViolation, Error, RemoteError, SlotContents};
use crate::retry::RetryExecutor;

use super::inputs::AssignToSlotInput;
use super::locks::{MachineLease, MachineLocks};
use super::repository::{MedicineCatalog, SlotRepository};
use super::slot::{Availability, MachineSlot, MachineStock, SlotKey, SlotLabel, SLOT_CAPACITY};

/// Compare-and-swap rounds before a write gives up with [`Error::Conflict`].
const MAX_WRITE_ROUNDS: usize = 5;

enum Write {
    Applied(MachineSlot),
    Conflicted,
}

/// Owns the machine → slot → medicine → quantity mapping.
///
/// Every mutation runs under the machine's lease and is committed with a version check,
/// so concurrent writers (in this process or another one sharing the store) can never
/// push a slot outside `0..=SLOT_CAPACITY`.
pub struct SlotInventoryManager {
    slots: Arc<dyn SlotRepository>,
    catalog: Arc<dyn MedicineCatalog>,
    retry: RetryExecutor,
    locks: MachineLocks,
}

impl SlotInventoryManager {
    pub fn new(slots: Arc<dyn SlotRepository>, catalog: Arc<dyn MedicineCatalog>) -> Self {
        Self::with_retry(slots, catalog, RetryExecutor::default())
    }

    pub fn with_retry(
        slots: Arc<dyn SlotRepository>,
        catalog: Arc<dyn MedicineCatalog>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            slots,
            catalog,
            retry,
            locks: MachineLocks::default(),
        }
    }

    /// Exclusive write access to one machine until the lease is dropped.
    async fn lease(&self, machine_id: i32) -> MachineLease {
        self.locks.acquire(machine_id).await
    }

    pub async fn get_slot(&self, machine_id: i32, medicine_id: i32) -> Result<MachineSlot, Error> {
        self.find(machine_id, medicine_id)
            .await?
            .ok_or_else(|| slot_not_found(machine_id, medicine_id))
    }

    /// Read-only; nothing is reserved.
    pub async fn check_availability(
        &self,
        machine_id: i32,
        medicine_id: i32,
        quantity: u32,
    ) -> Result<Availability, Error> {
        let slot = self.get_slot(machine_id, medicine_id).await?;
        Ok(Availability::new(
            u32::from(slot.quantity) >= quantity,
            slot.quantity,
            slot.slot,
        ))
    }

    pub async fn machine_slots(&self, machine_id: i32) -> Result<Vec<MachineSlot>, Error> {
        Ok(self
            .retry
            .execute("GetMachineSlots", move || self.slots.list_by_machine(machine_id))
            .await?)
    }

    pub async fn low_stock(&self, threshold: u8) -> Result<Vec<MachineSlot>, Error> {
        Ok(self
            .retry
            .execute("GetLowStock", move || self.slots.list_low_stock(threshold))
            .await?)
    }

    pub async fn assign_to_slot(&self, input: AssignToSlotInput) -> Result<MachineSlot, Error> {
        let AssignToSlotInput {
            machine_id,
            medicine_id,
            slot: label,
            quantity,
        } = input;

        if quantity == 0 {
            return Err(Error::Validation {
                message: "Quantity must be greater than 0".to_string(),
            });
        }
        if quantity > u32::from(SLOT_CAPACITY) {
            return Err(CapacityViolation::SlotCapacityExceeded {
                message: format!(
                    "Initial quantity cannot exceed the maximum slot capacity of {} units",
                    SLOT_CAPACITY
                ),
                attempted_quantity: quantity,
                max_allowed: SLOT_CAPACITY,
            }
            .into());
        }

        let machine_exists = self
            .retry
            .execute("GetMachine", move || self.catalog.machine_exists(machine_id))
            .await?;
        if !machine_exists {
            return Err(Error::NotFound {
                entity: format!("Vending machine with ID {}", machine_id),
            });
        }

        let medicine = self
            .retry
            .execute("GetMedicine", move || self.catalog.medicine(medicine_id))
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: format!("Medicine with ID {}", medicine_id),
            })?;

        let lease = self.lease(machine_id).await;
        let mutation_id = Ulid::new().to_string();

        let mut committed = None;
        for _ in 0..MAX_WRITE_ROUNDS {
            let machine_slots = self.machine_slots(lease.machine_id()).await?;

            if let Some(applied) = machine_slots
                .iter()
                .find(|slot| slot.last_mutation.as_deref() == Some(mutation_id.as_str()))
            {
                committed = Some(applied.clone());
                break;
            }

            if let Some(existing) = machine_slots
                .iter()
                .find(|slot| slot.medicine_id == medicine_id && slot.slot != label)
            {
                return Err(CapacityViolation::MedicineAlreadyInMachine {
                    message: format!(
                        "Medicine {} is already in the machine in slot {}",
                        medicine.name, existing.slot
                    ),
                    existing_slot: existing.slot,
                    current_quantity: existing.quantity,
                }
                .into());
            }

            let (next, expected_version) = match machine_slots.iter().find(|slot| slot.slot == label) {
                Some(occupant) if occupant.medicine_id != medicine_id => {
                    let taken: BTreeSet<SlotLabel> = machine_slots.iter().map(|slot| slot.slot).collect();
                    return Err(CapacityViolation::SlotOccupied {
                        message: format!("Slot {} already contains a different medicine", label),
                        available_slots: SlotLabel::all().filter(|l| !taken.contains(l)).collect(),
                        current_slot_contents: SlotContents {
                            slot: occupant.slot,
                            medicine_id: occupant.medicine_id,
                            quantity: occupant.quantity,
                        },
                    }
                    .into());
                }
                Some(occupant) => {
                    if u32::from(occupant.quantity) + quantity > u32::from(SLOT_CAPACITY) {
                        return Err(CapacityViolation::SlotOverfill {
                            message: format!(
                                "Adding this quantity would exceed the maximum slot capacity of {} units",
                                SLOT_CAPACITY
                            ),
                            current_quantity: occupant.quantity,
                            attempted_quantity: quantity,
                            available_space: occupant.free_space(),
                        }
                        .into());
                    }
                    let mut next = occupant.clone();
                    next.quantity += quantity as u8;
                    next.last_restocked = Utc::now();
                    (next, Some(occupant.version))
                }
                None => (
                    MachineSlot::new(machine_id, medicine_id, label, quantity as u8),
                    None,
                ),
            };

            if let Write::Applied(slot) = self.write(next, expected_version, &mutation_id).await? {
                committed = Some(slot);
                break;
            }
        }

        let slot = committed.ok_or_else(|| Error::Conflict {
            key: SlotKey::new(machine_id, medicine_id).to_string(),
        })?;
        drop(lease);

        tracing::info!(
            "Assigned medicine {} to slot {} of machine {} (quantity {})",
            medicine_id,
            slot.slot,
            machine_id,
            slot.quantity
        );

        // The global counter is advisory; the slot is already committed.
        let delta = -(quantity as i32);
        if let Err(err) = self
            .retry
            .execute("UpdateMedicineStock", move || self.catalog.adjust_stock(medicine_id, delta))
            .await
        {
            tracing::error!(
                "Slot {} of machine {} stocked but medicine {} stock counter was not updated: {}",
                slot.slot,
                machine_id,
                medicine_id,
                err
            );
        }

        Ok(slot)
    }

    /// Takes `quantity` units out of the slot, or fails with [`Error::OutOfStock`].
    ///
    /// The check and the write are one compare-and-swap, so the units are reserved for
    /// the caller even when another process works on the same slot.
    pub async fn decrement(&self, machine_id: i32, medicine_id: i32, quantity: u32) -> Result<MachineSlot, Error> {
        if quantity == 0 {
            return Err(Error::Validation {
                message: "Quantity must be greater than 0".to_string(),
            });
        }

        let _lease = self.lease(machine_id).await;
        let mutation_id = Ulid::new().to_string();

        for _ in 0..MAX_WRITE_ROUNDS {
            let current = self.get_slot(machine_id, medicine_id).await?;
            if current.last_mutation.as_deref() == Some(mutation_id.as_str()) {
                return Ok(current);
            }

            if quantity > u32::from(current.quantity) {
                return Err(Error::OutOfStock {
                    available: current.quantity,
                    requested: quantity,
                });
            }

            let mut next = current.clone();
            next.quantity -= quantity as u8;

            if let Write::Applied(slot) = self.write(next, Some(current.version), &mutation_id).await? {
                tracing::info!(
                    "Slot {} of machine {} decremented by {} to {}",
                    slot.slot,
                    machine_id,
                    quantity,
                    slot.quantity
                );
                return Ok(slot);
            }
        }

        Err(Error::Conflict {
            key: SlotKey::new(machine_id, medicine_id).to_string(),
        })
    }

    /// Puts back units taken by [`SlotInventoryManager::decrement`] that were never handed out.
    pub async fn release(&self, machine_id: i32, medicine_id: i32, quantity: u32) -> Result<MachineSlot, Error> {
        let _lease = self.lease(machine_id).await;
        let mutation_id = Ulid::new().to_string();

        for _ in 0..MAX_WRITE_ROUNDS {
            let current = self.get_slot(machine_id, medicine_id).await?;
            if current.last_mutation.as_deref() == Some(mutation_id.as_str()) {
                return Ok(current);
            }

            // restocked to the brim in the meantime
            if u32::from(current.quantity) + quantity > u32::from(SLOT_CAPACITY) {
                return Err(CapacityViolation::SlotOverfill {
                    message: format!(
                        "Returning {} units would exceed the maximum slot capacity of {} units",
                        quantity, SLOT_CAPACITY
                    ),
                    current_quantity: current.quantity,
                    attempted_quantity: quantity,
                    available_space: current.free_space(),
                }
                .into());
            }

            let mut next = current.clone();
            next.quantity += quantity as u8;

            if let Write::Applied(slot) = self.write(next, Some(current.version), &mutation_id).await? {
                tracing::info!(
                    "Slot {} of machine {} got {} units back, now {}",
                    slot.slot,
                    machine_id,
                    quantity,
                    slot.quantity
                );
                return Ok(slot);
            }
        }

        Err(Error::Conflict {
            key: SlotKey::new(machine_id, medicine_id).to_string(),
        })
    }

    /// Machines carrying the medicine. Slots whose machine record is gone are skipped.
    pub async fn machines_for_medicine(&self, medicine_id: i32) -> Result<Vec<MachineStock>, Error> {
        let slots = self
            .retry
            .execute("GetMedicineSlots", move || self.slots.list_by_medicine(medicine_id))
            .await?;

        let mut found = Vec::with_capacity(slots.len());
        for slot in slots {
            let machine_id = slot.machine_id;
            let machine = self
                .retry
                .execute("GetMachine", move || self.catalog.machine(machine_id))
                .await?;

            match machine {
                Some(machine) => found.push(MachineStock::new(machine_id, machine.location, slot.slot, slot.quantity)),
                None => tracing::warn!("Slot {} references missing machine {}", slot.key(), machine_id),
            }
        }

        Ok(found)
    }

    /// Admin correction of a slot's quantity.
    pub async fn update_quantity(
        &self,
        machine_id: i32,
        medicine_id: i32,
        quantity: u32,
    ) -> Result<MachineSlot, Error> {
        if quantity > u32::from(SLOT_CAPACITY) {
            return Err(CapacityViolation::SlotCapacityExceeded {
                message: format!("Quantity cannot exceed the maximum slot capacity of {} units", SLOT_CAPACITY),
                attempted_quantity: quantity,
                max_allowed: SLOT_CAPACITY,
            }
            .into());
        }

        let _lease = self.lease(machine_id).await;
        let mutation_id = Ulid::new().to_string();

        for _ in 0..MAX_WRITE_ROUNDS {
            let current = self.get_slot(machine_id, medicine_id).await?;
            if current.last_mutation.as_deref() == Some(mutation_id.as_str()) {
                return Ok(current);
            }

            let mut next = current.clone();
            next.quantity = quantity as u8;
            next.last_restocked = Utc::now();

            if let Write::Applied(slot) = self.write(next, Some(current.version), &mutation_id).await? {
                return Ok(slot);
            }
        }

        Err(Error::Conflict {
            key: SlotKey::new(machine_id, medicine_id).to_string(),
        })
    }

    /// Clears the slot so its label can be reused.
    pub async fn remove(&self, machine_id: i32, medicine_id: i32) -> Result<(), Error> {
        let _lease = self.lease(machine_id).await;

        let removed = self
            .retry
            .execute("DeleteStock", move || self.slots.delete(machine_id, medicine_id))
            .await?;
        if !removed {
            return Err(slot_not_found(machine_id, medicine_id));
        }

        tracing::info!("Removed medicine {} from machine {}", medicine_id, machine_id);
        Ok(())
    }

    async fn find(&self, machine_id: i32, medicine_id: i32) -> Result<Option<MachineSlot>, Error> {
        Ok(self
            .retry
            .execute("GetStock", move || self.slots.get(machine_id, medicine_id))
            .await?)
    }

    async fn write(
        &self,
        mut next: MachineSlot,
        expected_version: Option<u64>,
        mutation_id: &str,
    ) -> Result<Write, Error> {
        next.version = expected_version.map_or(1, |version| version + 1);
        next.last_mutation = Some(mutation_id.to_string());

        match self
            .retry
            .execute("UpdateStock", || self.slots.put(next.clone(), expected_version))
            .await
        {
            Ok(()) => Ok(Write::Applied(next)),
            Err(RemoteError::Conflict { message }) => {
                tracing::debug!("Write conflict on {}: {}", next.key(), message);
                Ok(Write::Conflicted)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn slot_not_found(machine_id: i32, medicine_id: i32) -> Error {
    Error::NotFound {
        entity: format!("Stock entry for machine {} and medicine {}", machine_id, medicine_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::repository::{InMemoryCatalog, InMemorySlotRepository, Medicine};

    async fn manager() -> (SlotInventoryManager, Arc<InMemoryCatalog>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_machine(1).await;
        for (medicine_id, name) in [(7, "Ibuprofen"), (42, "Aspirin"), (99, "Paracetamol")] {
            catalog
                .add_medicine(Medicine {
                    medicine_id,
                    name: name.to_string(),
                    stock: 100,
                })
                .await;
        }
        let manager = SlotInventoryManager::new(Arc::new(InMemorySlotRepository::new()), catalog.clone());
        (manager, catalog)
    }

    fn assign(medicine_id: i32, slot: u8, quantity: u32) -> AssignToSlotInput {
        AssignToSlotInput {
            machine_id: 1,
            medicine_id,
            slot: SlotLabel::new(slot).unwrap(),
            quantity,
        }
    }

    #[tokio::test]
    async fn assign_creates_slot_and_draws_global_stock() {
        let (manager, catalog) = manager().await;

        let slot = manager.assign_to_slot(assign(42, 3, 5)).await.unwrap();

        assert_eq!(slot.quantity, 5);
        assert_eq!(slot.slot.to_string(), "3");
        assert_eq!(manager.get_slot(1, 42).await.unwrap().quantity, 5);
        assert_eq!(catalog.medicine(42).await.unwrap().unwrap().stock, 95);
    }

    #[tokio::test]
    async fn assign_rejects_more_than_slot_capacity() {
        let (manager, catalog) = manager().await;

        let err = manager.assign_to_slot(assign(7, 2, 7)).await.unwrap_err();

        assert_eq!(
            err,
            Error::Capacity(CapacityViolation::SlotCapacityExceeded {
                message: "Initial quantity cannot exceed the maximum slot capacity of 6 units".into(),
                attempted_quantity: 7,
                max_allowed: 6,
            })
        );
        assert!(manager.machine_slots(1).await.unwrap().is_empty());
        assert_eq!(catalog.medicine(7).await.unwrap().unwrap().stock, 100);
    }

    #[tokio::test]
    async fn assign_tops_up_same_medicine_in_same_slot() {
        let (manager, catalog) = manager().await;
        manager.assign_to_slot(assign(42, 3, 2)).await.unwrap();

        let slot = manager.assign_to_slot(assign(42, 3, 3)).await.unwrap();

        assert_eq!(slot.quantity, 5);
        assert_eq!(catalog.medicine(42).await.unwrap().unwrap().stock, 95);

        let err = manager.assign_to_slot(assign(42, 3, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Capacity(CapacityViolation::SlotOverfill {
                current_quantity: 5,
                attempted_quantity: 2,
                available_space: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn one_slot_per_medicine_per_machine() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 2)).await.unwrap();

        let err = manager.assign_to_slot(assign(42, 4, 1)).await.unwrap_err();

        match err {
            Error::Capacity(CapacityViolation::MedicineAlreadyInMachine {
                message,
                existing_slot,
                current_quantity,
            }) => {
                assert_eq!(message, "Medicine Aspirin is already in the machine in slot 3");
                assert_eq!(existing_slot.position(), 3);
                assert_eq!(current_quantity, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn occupied_slot_reports_free_labels() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 2)).await.unwrap();
        manager.assign_to_slot(assign(99, 1, 4)).await.unwrap();

        let err = manager.assign_to_slot(assign(7, 3, 1)).await.unwrap_err();

        match err {
            Error::Capacity(CapacityViolation::SlotOccupied {
                available_slots,
                current_slot_contents,
                ..
            }) => {
                let free: Vec<String> = available_slots.iter().map(|l| l.to_string()).collect();
                assert_eq!(free, vec!["2", "4", "5", "6"]);
                assert_eq!(current_slot_contents.medicine_id, 42);
                assert_eq!(current_slot_contents.quantity, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn assign_requires_known_machine_and_medicine() {
        let (manager, _) = manager().await;

        let mut input = assign(42, 1, 1);
        input.machine_id = 5;
        assert!(matches!(manager.assign_to_slot(input).await, Err(Error::NotFound { .. })));
        assert!(matches!(
            manager.assign_to_slot(assign(1234, 1, 1)).await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            manager.assign_to_slot(assign(42, 1, 0)).await,
            Err(Error::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn availability_check_never_mutates() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 5)).await.unwrap();
        let before = manager.get_slot(1, 42).await.unwrap();

        let ok = manager.check_availability(1, 42, 5).await.unwrap();
        let short = manager.check_availability(1, 42, 6).await.unwrap();

        assert!(ok.available);
        assert!(!short.available);
        assert_eq!(short.current_quantity, 5);
        assert_eq!(manager.get_slot(1, 42).await.unwrap(), before);
        assert!(matches!(
            manager.check_availability(1, 7, 1).await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn decrement_refuses_to_go_below_zero() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 5)).await.unwrap();

        assert_eq!(manager.decrement(1, 42, 2).await.unwrap().quantity, 3);
        assert_eq!(
            manager.decrement(1, 42, 4).await.unwrap_err(),
            Error::OutOfStock { available: 3, requested: 4 }
        );
        assert_eq!(manager.get_slot(1, 42).await.unwrap().quantity, 3);
        assert!(matches!(manager.decrement(1, 7, 1).await, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn update_quantity_is_bounded_by_capacity() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 1)).await.unwrap();

        assert_eq!(manager.update_quantity(1, 42, 6).await.unwrap().quantity, 6);
        assert!(matches!(
            manager.update_quantity(1, 42, 9).await,
            Err(Error::Capacity(CapacityViolation::SlotCapacityExceeded { .. }))
        ));
    }

    #[tokio::test]
    async fn remove_frees_the_label() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 1)).await.unwrap();

        manager.remove(1, 42).await.unwrap();

        assert!(matches!(manager.get_slot(1, 42).await, Err(Error::NotFound { .. })));
        assert!(matches!(manager.remove(1, 42).await, Err(Error::NotFound { .. })));
        manager.assign_to_slot(assign(7, 3, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn low_stock_lists_slots_at_or_below_threshold() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 1)).await.unwrap();
        manager.assign_to_slot(assign(7, 4, 5)).await.unwrap();

        let low = manager.low_stock(2).await.unwrap();

        assert_eq!(low.len(), 1);
        assert_eq!(low[0].medicine_id, 42);
    }

    #[tokio::test]
    async fn released_units_go_back_into_the_slot() {
        let (manager, _) = manager().await;
        manager.assign_to_slot(assign(42, 3, 5)).await.unwrap();
        manager.decrement(1, 42, 2).await.unwrap();

        assert_eq!(manager.release(1, 42, 2).await.unwrap().quantity, 5);

        // topped up to capacity in between
        manager.update_quantity(1, 42, 6).await.unwrap();
        assert!(matches!(
            manager.release(1, 42, 1).await,
            Err(Error::Capacity(CapacityViolation::SlotOverfill { .. }))
        ));
        assert_eq!(manager.get_slot(1, 42).await.unwrap().quantity, 6);
    }

    #[tokio::test]
    async fn finds_machines_carrying_a_medicine() {
        let (manager, catalog) = manager().await;
        catalog.add_machine_at(1, "Ward 3 lobby").await;
        catalog.add_machine_at(2, "Pharmacy entrance").await;
        manager.assign_to_slot(assign(42, 3, 5)).await.unwrap();
        let mut elsewhere = assign(42, 1, 2);
        elsewhere.machine_id = 2;
        manager.assign_to_slot(elsewhere).await.unwrap();
        manager.assign_to_slot(assign(7, 4, 1)).await.unwrap();

        let found = manager.machines_for_medicine(42).await.unwrap();

        assert_eq!(
            found,
            vec![
                MachineStock::new(1, "Ward 3 lobby".into(), SlotLabel::new(3).unwrap(), 5),
                MachineStock::new(2, "Pharmacy entrance".into(), SlotLabel::new(1).unwrap(), 2),
            ]
        );
        assert!(manager.machines_for_medicine(1234).await.unwrap().is_empty());
    }
}

/// Slot model and physical limits
pub mod slot;

/// Input DTOs
pub mod inputs;

/// Storage traits and in-memory stores
pub mod repository;

/// DynamoDB-backed stores
pub mod dynamo;

/// Per-machine write leases
pub mod locks;

/// Slot inventory manager
pub mod manager;

pub use inputs::{AssignToSlotInput, UpdateQuantityInput};
pub use manager::SlotInventoryManager;
pub use repository::{
    InMemoryCatalog, InMemorySlotRepository, Medicine, MedicineCatalog, SlotRepository, VendingMachine,
};
pub use slot::{Availability, MachineSlot, MachineStock, SlotKey, SlotLabel, SLOTS_PER_MACHINE, SLOT_CAPACITY};

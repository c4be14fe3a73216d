//! Medicine Vending Domain

/// Remote vending devices
pub mod devices;

/// Dispense transactions
pub mod dispenses;

/// Domain errors
pub mod errors;

/// Slot inventory
pub mod inventory;

/// Retry policy for remote calls
pub mod retry;

pub use errors::{CapacityViolation, Error, RemoteError};

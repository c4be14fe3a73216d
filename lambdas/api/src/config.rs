use std::env;

use anyhow::{bail, Context};
use tracing::Level;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotStore {
    Dynamo,
    Memory,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceHub {
    IotHub,
    Simulated,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub slot_store: SlotStore,
    pub device_hub: DeviceHub,
    /// Set when running as a plain listener instead of inside Lambda.
    pub bind_address: Option<String>,
    pub log_level: Level,
}

pub fn init() -> anyhow::Result<Settings> {
    let slot_store = match env::var("SLOT_STORE").unwrap_or("dynamodb".to_string()).as_str() {
        "dynamodb" => SlotStore::Dynamo,
        "memory" => SlotStore::Memory,
        other => bail!("Unknown SLOT_STORE {:?}, expected dynamodb or memory", other),
    };

    let device_hub = match env::var("DEVICE_HUB").unwrap_or("iothub".to_string()).as_str() {
        "iothub" => DeviceHub::IotHub,
        "simulated" => DeviceHub::Simulated,
        other => bail!("Unknown DEVICE_HUB {:?}, expected iothub or simulated", other),
    };

    let log_level = env::var("LOG_LEVEL")
        .unwrap_or("info".to_string())
        .parse::<Level>()
        .context("LOG_LEVEL must be one of trace, debug, info, warn, error")?;

    // Lambda always sets the function name; anywhere else we listen on a socket.
    let bind_address = match env::var("AWS_LAMBDA_FUNCTION_NAME") {
        Ok(_) => None,
        Err(_) => Some(env::var("BIND_ADDRESS").unwrap_or("127.0.0.1:3000".to_string())),
    };

    Ok(Settings {
        slot_store,
        device_hub,
        bind_address,
        log_level,
    })
}

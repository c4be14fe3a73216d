use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, RwLock};

use crate::errors::RemoteError;

use super::{DeviceCommandChannel, DeviceMethod, DeviceRegistry, DeviceTwin, MethodResponse, STATUS_OK};

/// A scripted answer for the next registry lookup or command.
#[derive(Clone, Debug)]
pub enum SimulatedReply {
    /// Device answers with this status code.
    Status(u16),
    /// Call fails before reaching the device.
    Fail(RemoteError),
    /// Call never completes.
    Hang,
}

/// Device registry and command channel living in process memory.
///
/// Used for local runs without a hub and in tests. Unscripted commands to a registered
/// device succeed with status 200; unregistered devices are not found.
#[derive(Default)]
pub struct SimulatedHub {
    devices: RwLock<HashMap<String, Option<DateTime<Utc>>>>,
    registry_script: Mutex<VecDeque<SimulatedReply>>,
    command_script: Mutex<VecDeque<SimulatedReply>>,
    invocations: Mutex<Vec<(String, DeviceMethod)>>,
    lookups: Mutex<usize>,
}

impl SimulatedHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, device_id: &str, last_activity: Option<DateTime<Utc>>) {
        self.devices.write().await.insert(device_id.to_string(), last_activity);
    }

    /// Marks the device as active now.
    pub async fn touch(&self, device_id: &str) {
        self.register(device_id, Some(Utc::now())).await;
    }

    pub async fn push_registry_reply(&self, reply: SimulatedReply) {
        self.registry_script.lock().await.push_back(reply);
    }

    pub async fn push_command_reply(&self, reply: SimulatedReply) {
        self.command_script.lock().await.push_back(reply);
    }

    pub async fn invocations(&self) -> Vec<(String, DeviceMethod)> {
        self.invocations.lock().await.clone()
    }

    pub async fn registry_lookups(&self) -> usize {
        *self.lookups.lock().await
    }
}

#[async_trait]
impl DeviceRegistry for SimulatedHub {
    async fn get_twin(&self, device_id: &str) -> Result<Option<DeviceTwin>, RemoteError> {
        *self.lookups.lock().await += 1;

        let scripted = self.registry_script.lock().await.pop_front();
        match scripted {
            Some(SimulatedReply::Fail(err)) => return Err(err),
            Some(SimulatedReply::Hang) => return std::future::pending().await,
            Some(SimulatedReply::Status(_)) | None => {}
        }

        let devices = self.devices.read().await;
        Ok(devices.get(device_id).map(|last_activity| DeviceTwin {
            device_id: device_id.to_string(),
            last_activity_time: *last_activity,
        }))
    }
}

#[async_trait]
impl DeviceCommandChannel for SimulatedHub {
    async fn invoke(&self, device_id: &str, method: &DeviceMethod) -> Result<MethodResponse, RemoteError> {
        self.invocations
            .lock()
            .await
            .push((device_id.to_string(), method.clone()));

        let scripted = self.command_script.lock().await.pop_front();
        match scripted {
            Some(SimulatedReply::Status(status)) => Ok(MethodResponse { status, payload: None }),
            Some(SimulatedReply::Fail(err)) => Err(err),
            Some(SimulatedReply::Hang) => std::future::pending().await,
            None => {
                if !self.devices.read().await.contains_key(device_id) {
                    return Err(RemoteError::NotFound {
                        message: format!("Device {} not found", device_id),
                    });
                }
                tracing::info!("Simulated device {} accepted {}", device_id, method.name);
                Ok(MethodResponse {
                    status: STATUS_OK,
                    payload: Some(json!({ "accepted": true })),
                })
            }
        }
    }
}

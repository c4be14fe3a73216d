use std::sync::Arc;

use chrono::{Duration, Utc};
use derive_new::new;
use serde::Serialize;

use crate::retry::RetryExecutor;

use super::DeviceRegistry;

/// Devices silent for longer than this are treated as offline.
pub const ACTIVITY_WINDOW_MINUTES: i64 = 5;

#[derive(new, Clone, Debug, Serialize, Eq, PartialEq)]
pub struct LivenessReport {
    pub reachable: bool,
    pub reason: String,
}

/// Freshness check against the registry's last reported activity.
///
/// This is not a live ping: a device that is alive but has not reported recently looks
/// offline, and one that reported just before dropping off still looks reachable.
/// Registry failures fail closed.
pub struct DeviceLivenessChecker {
    registry: Arc<dyn DeviceRegistry>,
    retry: RetryExecutor,
    window: Duration,
}

impl DeviceLivenessChecker {
    pub fn new(registry: Arc<dyn DeviceRegistry>, retry: RetryExecutor) -> Self {
        Self {
            registry,
            retry,
            window: Duration::minutes(ACTIVITY_WINDOW_MINUTES),
        }
    }

    pub async fn is_reachable(&self, device_id: &str) -> LivenessReport {
        let twin = match self
            .retry
            .execute("GetDeviceTwin", || self.registry.get_twin(device_id))
            .await
        {
            Ok(twin) => twin,
            Err(err) => {
                tracing::error!("Error checking device {} status after retries: {}", device_id, err);
                return LivenessReport::new(
                    false,
                    "Could not verify device status after multiple attempts. Please check device connectivity."
                        .to_string(),
                );
            }
        };

        let Some(twin) = twin else {
            return LivenessReport::new(false, "Device not registered in IoT Hub".to_string());
        };

        match twin.last_activity_time {
            Some(seen) if Utc::now().signed_duration_since(seen) <= self.window => {
                LivenessReport::new(true, "Device reported activity recently".to_string())
            }
            _ => LivenessReport::new(
                false,
                format!(
                    "Device appears to be offline (no activity in last {} minutes)",
                    ACTIVITY_WINDOW_MINUTES
                ),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{SimulatedHub, SimulatedReply};
    use crate::errors::RemoteError;

    #[tokio::test]
    async fn recent_activity_is_reachable() {
        let hub = Arc::new(SimulatedHub::new());
        hub.register("1", Some(Utc::now() - Duration::minutes(1))).await;

        let report = DeviceLivenessChecker::new(hub, RetryExecutor::default())
            .is_reachable("1")
            .await;

        assert!(report.reachable);
    }

    #[tokio::test]
    async fn stale_or_missing_activity_is_offline() {
        let hub = Arc::new(SimulatedHub::new());
        hub.register("stale", Some(Utc::now() - Duration::minutes(6))).await;
        hub.register("silent", None).await;
        let checker = DeviceLivenessChecker::new(hub, RetryExecutor::default());

        let stale = checker.is_reachable("stale").await;
        assert!(!stale.reachable);
        assert_eq!(stale.reason, "Device appears to be offline (no activity in last 5 minutes)");
        assert!(!checker.is_reachable("silent").await.reachable);
    }

    #[tokio::test]
    async fn unknown_device_is_offline() {
        let checker = DeviceLivenessChecker::new(Arc::new(SimulatedHub::new()), RetryExecutor::default());

        let report = checker.is_reachable("ghost").await;

        assert!(!report.reachable);
        assert_eq!(report.reason, "Device not registered in IoT Hub");
    }

    #[tokio::test(start_paused = true)]
    async fn registry_outage_fails_closed_after_retries() {
        let hub = Arc::new(SimulatedHub::new());
        hub.register("1", Some(Utc::now())).await;
        for _ in 0..3 {
            hub.push_registry_reply(SimulatedReply::Fail(RemoteError::Connection {
                message: "socket closed".into(),
            }))
            .await;
        }

        let report = DeviceLivenessChecker::new(hub.clone(), RetryExecutor::default())
            .is_reachable("1")
            .await;

        assert!(!report.reachable);
        assert_eq!(hub.registry_lookups().await, 3);
    }
}

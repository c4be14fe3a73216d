use std::env;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header::AUTHORIZATION, Response, StatusCode, Url};
use serde::Serialize;
use serde_json::Value;

use crate::errors::{Error, RemoteError};

use super::{DeviceCommandChannel, DeviceMethod, DeviceRegistry, DeviceTwin, MethodResponse};

const DEFAULT_API_VERSION: &str = "2021-04-12";

/// Slack on top of the device's own response timeout before the HTTP call is abandoned.
const TRANSPORT_MARGIN: Duration = Duration::from_secs(5);
const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

pub fn init() -> Result<IotHubClient, Error> {
    let host_name = env::var("IOT_HUB_HOST_NAME").map_err(|_| Error::Validation {
        message: "IOT_HUB_HOST_NAME is not set".to_string(),
    })?;
    let sas_token = env::var("IOT_HUB_SAS_TOKEN").map_err(|_| Error::Validation {
        message: "IOT_HUB_SAS_TOKEN is not set".to_string(),
    })?;
    let api_version = env::var("IOT_HUB_API_VERSION").unwrap_or(DEFAULT_API_VERSION.to_string());

    Ok(IotHubClient::new(host_name, sas_token).with_api_version(api_version))
}

/// Device registry and direct-method channel over the IoT hub's service REST API.
///
/// Authenticates with a pre-issued shared access signature; issuing it is not this
/// client's concern.
#[derive(Clone)]
pub struct IotHubClient {
    http: reqwest::Client,
    base_url: String,
    sas_token: String,
    api_version: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MethodInvocation<'a> {
    method_name: &'a str,
    response_timeout_in_seconds: u64,
    payload: &'a Value,
}

impl IotHubClient {
    pub fn new(host_name: String, sas_token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: format!("https://{}", host_name),
            sas_token,
            api_version: DEFAULT_API_VERSION.to_string(),
        }
    }

    pub fn with_api_version(mut self, api_version: String) -> Self {
        self.api_version = api_version;
        self
    }

    /// Points the client at another endpoint, e.g. a local hub emulator.
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    /// `/twins/{device_id}[/tail]`, with the device id encoded as a single path segment.
    fn device_url(&self, device_id: &str, tail: Option<&str>) -> Result<Url, RemoteError> {
        let mut url = Url::parse(&self.base_url).map_err(|err| RemoteError::Rejected {
            message: format!("Invalid hub URL {}: {}", self.base_url, err),
        })?;

        url.path_segments_mut()
            .map_err(|_| RemoteError::Rejected {
                message: format!("Hub URL {} cannot take a path", self.base_url),
            })?
            .pop_if_empty()
            .push("twins")
            .push(device_id)
            .extend(tail);
        url.query_pairs_mut().append_pair("api-version", &self.api_version);

        Ok(url)
    }
}

#[async_trait]
impl DeviceRegistry for IotHubClient {
    async fn get_twin(&self, device_id: &str) -> Result<Option<DeviceTwin>, RemoteError> {
        let response = self
            .http
            .get(self.device_url(device_id, None)?)
            .header(AUTHORIZATION, &self.sas_token)
            .timeout(REGISTRY_TIMEOUT)
            .send()
            .await
            .map_err(|err| transport_error("GetDeviceTwin", err))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let twin: Value = check_status("GetDeviceTwin", response)
            .await?
            .json()
            .await
            .map_err(|err| transport_error("GetDeviceTwin", err))?;

        Ok(Some(DeviceTwin {
            device_id: device_id.to_string(),
            last_activity_time: last_activity(&twin),
        }))
    }
}

#[async_trait]
impl DeviceCommandChannel for IotHubClient {
    async fn invoke(&self, device_id: &str, method: &DeviceMethod) -> Result<MethodResponse, RemoteError> {
        let body = MethodInvocation {
            method_name: &method.name,
            response_timeout_in_seconds: method.response_timeout.as_secs(),
            payload: &method.payload,
        };

        tracing::info!(
            "Invoking {} on device {} for transaction {}",
            method.name,
            device_id,
            method.correlation_id.as_deref().unwrap_or("-")
        );

        let response = self
            .http
            .post(self.device_url(device_id, Some("methods"))?)
            .header(AUTHORIZATION, &self.sas_token)
            .timeout(method.response_timeout + TRANSPORT_MARGIN)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error("InvokeDeviceMethod", err))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound {
                message: format!("Device {} not found or not connected", device_id),
            });
        }

        check_status("InvokeDeviceMethod", response)
            .await?
            .json::<MethodResponse>()
            .await
            .map_err(|err| transport_error("InvokeDeviceMethod", err))
    }
}

/// Reported `lastActivityTime`, falling back to the hub's own connection bookkeeping.
fn last_activity(twin: &Value) -> Option<DateTime<Utc>> {
    twin.pointer("/properties/reported/lastActivityTime")
        .or_else(|| twin.get("lastActivityTime"))
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}

async fn check_status(operation: &str, response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = format!(
        "{} returned {}: {}",
        operation,
        status,
        response.text().await.unwrap_or_default()
    );

    Err(match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => RemoteError::Timeout {
            operation: operation.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => RemoteError::Server {
            status: Some(status.as_u16()),
            message,
        },
        status if status.is_server_error() => RemoteError::Server {
            status: Some(status.as_u16()),
            message,
        },
        _ => RemoteError::Rejected { message },
    })
}

fn transport_error(operation: &str, err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout {
            operation: operation.to_string(),
        }
    } else if err.is_connect() || err.is_request() {
        RemoteError::Connection {
            message: format!("{}: {}", operation, err),
        }
    } else {
        RemoteError::Rejected {
            message: format!("{}: {}", operation, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_reported_activity_first() {
        let twin = json!({
            "deviceId": "1",
            "lastActivityTime": "2024-01-01T00:00:00Z",
            "properties": { "reported": { "lastActivityTime": "2024-05-05T10:00:00Z" } }
        });

        let seen = last_activity(&twin).unwrap();
        assert_eq!(seen.to_rfc3339(), "2024-05-05T10:00:00+00:00");
    }

    #[test]
    fn missing_or_garbled_activity_is_none() {
        assert_eq!(last_activity(&json!({ "deviceId": "1" })), None);
        assert_eq!(
            last_activity(&json!({ "properties": { "reported": { "lastActivityTime": "yesterday" } } })),
            None
        );
    }

    #[test]
    fn device_ids_stay_inside_their_path_segment() {
        let client = IotHubClient::new("hub.example.net".into(), "sas".into());

        let twin = client.device_url("esp32/../x?y", None).unwrap();
        assert_eq!(
            twin.as_str(),
            "https://hub.example.net/twins/esp32%2F..%2Fx%3Fy?api-version=2021-04-12"
        );

        let methods = client.device_url("7", Some("methods")).unwrap();
        assert_eq!(
            methods.as_str(),
            "https://hub.example.net/twins/7/methods?api-version=2021-04-12"
        );
    }

    #[test]
    fn method_invocation_matches_hub_contract() {
        let method = DeviceMethod::dispense(crate::inventory::SlotLabel::new(3).unwrap(), 2);
        let body = MethodInvocation {
            method_name: &method.name,
            response_timeout_in_seconds: method.response_timeout.as_secs(),
            payload: &method.payload,
        };

        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            json!({
                "methodName": "dispenseMedicine",
                "responseTimeoutInSeconds": 30,
                "payload": { "slot": "3", "quantity": 2 }
            })
        );
    }
}

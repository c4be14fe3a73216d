use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use domain::devices::STATUS_OK;
use domain::dispenses::{DispenseOrchestrator, DispenseRequest, DispenseStatus};
use domain::inventory::{AssignToSlotInput, SlotInventoryManager, SlotLabel, UpdateQuantityInput};
use domain::Error;
use serde::Deserialize;
use serde_json::json;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<DispenseOrchestrator>,
    pub inventory: Arc<SlotInventoryManager>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/dispense", post(dispense))
        .route("/machines/:machine_id/slots", get(list_slots).post(assign_slot))
        .route(
            "/machines/:machine_id/slots/:medicine_id",
            get(get_slot).put(update_slot).delete(remove_slot),
        )
        .route("/slots/low-stock/:threshold", get(low_stock))
        .route("/medicines/:medicine_id/machines", get(machines_for_medicine))
        .route("/devices/:device_id/test-motor", post(test_motor))
        .with_state(state)
}

/// Domain errors as HTTP responses. Unexpected failures never leak their text.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Capacity(violation) => {
                return (StatusCode::BAD_REQUEST, Json(violation)).into_response();
            }
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Validation { .. } => StatusCode::BAD_REQUEST,
            Error::OutOfStock { .. } | Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::DeviceUnreachable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidStateTransition { .. } | Error::Remote(_) => {
                tracing::error!("Request failed: {}", self.0);
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "success": false,
                        "message": "An unexpected error occurred. Please try again later."
                    })),
                )
                    .into_response();
            }
        };

        (status, Json(json!({ "success": false, "message": self.0.to_string() }))).into_response()
    }
}

// Dispense medicine
async fn dispense(State(state): State<AppState>, Json(request): Json<DispenseRequest>) -> impl IntoResponse {
    let response = state.orchestrator.dispense_medicine(request).await;

    let status = match response.status {
        DispenseStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };

    (status, Json(response))
}

// List machine slots
async fn list_slots(
    Path(machine_id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let slots = state.inventory.machine_slots(machine_id).await?;
    Ok(Json(slots))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlotAssignment {
    medicine_id: i32,
    slot: SlotLabel,
    quantity: u32,
}

// Assign medicine to slot
async fn assign_slot(
    Path(machine_id): Path<i32>,
    State(state): State<AppState>,
    Json(input): Json<SlotAssignment>,
) -> Result<impl IntoResponse, ApiError> {
    let slot = state
        .inventory
        .assign_to_slot(AssignToSlotInput {
            machine_id,
            medicine_id: input.medicine_id,
            slot: input.slot,
            quantity: input.quantity,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(slot)))
}

// Get slot
async fn get_slot(
    Path((machine_id, medicine_id)): Path<(i32, i32)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let slot = state.inventory.get_slot(machine_id, medicine_id).await?;
    Ok(Json(slot))
}

// Correct slot quantity
async fn update_slot(
    Path((machine_id, medicine_id)): Path<(i32, i32)>,
    State(state): State<AppState>,
    Json(input): Json<UpdateQuantityInput>,
) -> Result<impl IntoResponse, ApiError> {
    let slot = state
        .inventory
        .update_quantity(machine_id, medicine_id, input.quantity)
        .await?;
    Ok(Json(slot))
}

// Remove medicine from machine
async fn remove_slot(
    Path((machine_id, medicine_id)): Path<(i32, i32)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    state.inventory.remove(machine_id, medicine_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// Low stock across all machines
async fn low_stock(
    Path(threshold): Path<u8>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let slots = state.inventory.low_stock(threshold).await?;
    Ok(Json(slots))
}

// Machines carrying a medicine
async fn machines_for_medicine(
    Path(medicine_id): Path<i32>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let machines = state.inventory.machines_for_medicine(medicine_id).await?;
    Ok(Json(machines))
}

#[derive(Deserialize)]
struct MotorTest {
    slot: SlotLabel,
    #[serde(default = "one")]
    quantity: u32,
}

fn one() -> u32 {
    1
}

// Exercise a slot motor
async fn test_motor(
    Path(device_id): Path<String>,
    State(state): State<AppState>,
    Query(test): Query<MotorTest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .orchestrator
        .exercise_slot(&device_id, test.slot, test.quantity)
        .await?;

    if response.status == STATUS_OK {
        return Ok((
            StatusCode::OK,
            Json(json!({ "success": true, "message": "Slot test command sent successfully." })),
        ));
    }

    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((
        status,
        Json(json!({
            "success": false,
            "message": "Device responded with error.",
            "status": response.status
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use domain::devices::{SimulatedHub, SimulatedReply};
    use domain::inventory::{InMemoryCatalog, InMemorySlotRepository, Medicine};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app() -> (Router, Arc<SimulatedHub>) {
        let hub = Arc::new(SimulatedHub::new());
        hub.touch("1").await;

        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.add_machine_at(1, "Ward 3 lobby").await;
        for (medicine_id, name) in [(42, "Paracetamol"), (7, "Amoxicillin")] {
            catalog
                .add_medicine(Medicine {
                    medicine_id,
                    name: name.into(),
                    stock: 20,
                })
                .await;
        }

        let inventory = Arc::new(SlotInventoryManager::new(
            Arc::new(InMemorySlotRepository::new()),
            catalog,
        ));
        inventory
            .assign_to_slot(AssignToSlotInput {
                machine_id: 1,
                medicine_id: 42,
                slot: SlotLabel::new(3).unwrap(),
                quantity: 5,
            })
            .await
            .unwrap();

        let orchestrator = Arc::new(DispenseOrchestrator::new(hub.clone(), hub.clone(), inventory.clone()));
        (router(AppState { orchestrator, inventory }), hub)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder().method(method).uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn dispense_returns_transaction() {
        let (app, _) = app().await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/dispense",
                json!({ "deviceId": "1", "medicineId": 42, "quantity": 2 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "InProgress");
        assert!(body["transactionId"].as_str().is_some_and(|id| !id.is_empty()));
    }

    #[tokio::test]
    async fn out_of_stock_dispense_is_not_a_server_error() {
        let (app, _) = app().await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/dispense",
                json!({ "deviceId": "1", "medicineId": 42, "quantity": 6 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "OutOfStock");
        assert_eq!(body["message"], "Insufficient stock. Available: 5, Requested: 6");
    }

    #[tokio::test]
    async fn failed_dispense_is_500() {
        let (app, hub) = app().await;
        hub.push_command_reply(SimulatedReply::Status(500)).await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/dispense",
                json!({ "deviceId": "1", "medicineId": 42, "quantity": 1 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["status"], "Failed");
    }

    #[tokio::test]
    async fn capacity_violation_is_returned_as_structured_detail() {
        let (app, _) = app().await;

        let response = app
            .oneshot(json_request(
                "POST",
                "/machines/1/slots",
                json!({ "medicineId": 7, "slot": "3", "quantity": 2 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["kind"], "slotOccupied");
        assert_eq!(body["currentSlotContents"]["medicineId"], 42);
        assert_eq!(body["availableSlots"], json!(["1", "2", "4", "5", "6"]));
    }

    #[tokio::test]
    async fn assign_then_list_slots() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/machines/1/slots",
                json!({ "medicineId": 7, "slot": "1", "quantity": 4 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app.oneshot(empty_request("GET", "/machines/1/slots")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn unknown_slot_is_404() {
        let (app, _) = app().await;

        let response = app.oneshot(empty_request("GET", "/machines/1/slots/7")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["success"], false);
    }

    #[tokio::test]
    async fn quantity_correction_and_removal() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/machines/1/slots/42", json!({ "quantity": 1 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["quantity"], 1);

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/slots/low-stock/2"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().map(Vec::len), Some(1));

        let response = app
            .clone()
            .oneshot(empty_request("DELETE", "/machines/1/slots/42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(empty_request("DELETE", "/machines/1/slots/42"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn machines_carrying_a_medicine() {
        let (app, _) = app().await;

        let response = app
            .clone()
            .oneshot(empty_request("GET", "/medicines/42/machines"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!([{ "machineId": 1, "location": "Ward 3 lobby", "slot": "3", "quantity": 5 }])
        );

        let response = app.oneshot(empty_request("GET", "/medicines/7/machines")).await.unwrap();
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn motor_test_reports_device_answer() {
        let (app, hub) = app().await;

        let response = app
            .clone()
            .oneshot(empty_request("POST", "/devices/1/test-motor?slot=2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);

        hub.push_command_reply(SimulatedReply::Status(500)).await;
        let response = app
            .oneshot(empty_request("POST", "/devices/1/test-motor?slot=2&quantity=1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["status"], 500);
    }

    #[tokio::test]
    async fn motor_test_on_unknown_device_is_unavailable() {
        let (app, _) = app().await;

        let response = app
            .oneshot(empty_request("POST", "/devices/99/test-motor?slot=2"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}

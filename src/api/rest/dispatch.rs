use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::api::rest::ApiJson;
use crate::error::AppError;
use crate::models::assignment::OrderAssignment;
use crate::models::driver::{Driver, DriverStatus};
use crate::models::order::{Order, OrderStatusUpdate};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/dispatch/orders", get(list_pending_orders).post(submit_order))
        .route("/api/dispatch/orders/:id/assign", post(assign_order))
        .route("/api/dispatch/orders/:id/status", post(update_order_status))
        .route("/api/dispatch/assignments", get(list_assignments))
        .route("/api/dispatch/drivers", get(list_drivers).post(register_driver))
        .route("/api/dispatch/drivers/:id/location", post(update_driver_location))
        .route("/api/dispatch/drivers/:id/status", patch(update_driver_status))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub driver_id: String,
}

#[derive(Deserialize)]
pub struct OrderStatusRequest {
    pub status: String,
}

#[derive(Deserialize)]
pub struct DriverLocationRequest {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Deserialize)]
pub struct DriverStatusRequest {
    pub status: DriverStatus,
}

async fn list_pending_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Order>>, AppError> {
    Ok(Json(state.dispatcher.pending_orders().await?))
}

async fn submit_order(
    State(state): State<Arc<AppState>>,
    ApiJson(mut order): ApiJson<Order>,
) -> Result<Json<Order>, AppError> {
    if order.id.trim().is_empty() {
        order.id = Uuid::new_v4().to_string();
    }
    if order.status.is_empty() {
        order.status = "pending".to_string();
    }

    Ok(Json(state.dispatcher.submit_order(order).await?))
}

async fn assign_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<AssignRequest>,
) -> Result<Json<OrderAssignment>, AppError> {
    let assignment = state.dispatcher.assign(&id, &payload.driver_id).await?;
    Ok(Json(assignment))
}

async fn update_order_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<OrderStatusRequest>,
) -> Result<Json<OrderStatusUpdate>, AppError> {
    let update = state.dispatcher.publish_status(&id, &payload.status).await?;
    Ok(Json(update))
}

async fn list_assignments(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderAssignment>>, AppError> {
    Ok(Json(state.dispatcher.assignments().await?))
}

async fn list_drivers(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Driver>>, AppError> {
    Ok(Json(state.dispatcher.drivers().await?))
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    ApiJson(driver): ApiJson<Driver>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.dispatcher.register_driver(driver).await?))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<DriverLocationRequest>,
) -> Result<Json<Value>, AppError> {
    state
        .dispatcher
        .update_driver_location(&id, payload.latitude, payload.longitude)
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn update_driver_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ApiJson(payload): ApiJson<DriverStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(
        state.dispatcher.set_driver_status(&id, payload.status).await?,
    ))
}

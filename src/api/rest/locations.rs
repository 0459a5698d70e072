use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde_json::{json, Value};

use crate::api::rest::ApiJson;
use crate::error::AppError;
use crate::models::location::{Location, LocationUpdate, SubjectType};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/location/update", post(update_location))
        .route("/api/location/user/:id", get(get_customer_location))
        .route("/api/location/driver/:id", get(get_driver_location))
        .route("/api/location/order/:id", get(get_order_location))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    ApiJson(update): ApiJson<LocationUpdate>,
) -> Result<Json<Value>, AppError> {
    if update.subject_id.trim().is_empty() {
        return Err(AppError::BadRequest("subjectId cannot be empty".to_string()));
    }

    state.ingest_location(update).await?;
    Ok(Json(json!({ "status": "ok" })))
}

async fn get_customer_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Location>, AppError> {
    let location = state
        .locations
        .get_location(SubjectType::Customer, &id)
        .await?;
    Ok(Json(location))
}

async fn get_driver_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Location>, AppError> {
    let location = state.locations.get_location(SubjectType::Driver, &id).await?;
    Ok(Json(location))
}

async fn get_order_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Location>, AppError> {
    let location = state.locations.get_order_location(&id).await?;
    Ok(Json(location))
}

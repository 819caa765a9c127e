use std::sync::Arc;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use shared::types::{normalize_mac, Device, DeviceDetectedEvent};
use crate::dedup::EventDeduplicator;
use crate::health::use_case::DeviceHealthUseCase;
use crate::repository::DeviceRepository;

#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn DeviceRepository>,
    pub dedup: Arc<EventDeduplicator>,
    pub health: Arc<DeviceHealthUseCase>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub tracked_events: usize,
    pub in_flight_checks: usize,
    pub max_concurrent: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/devices", get(get_devices))
        .route("/v1/devices/:mac", get(get_device))
        .route("/v1/devices/:mac/detection", get(get_latest_detection))
        .route("/v1/status", get(get_status))
        .with_state(state)
}

async fn get_devices(State(state): State<AppState>) -> Result<Json<Vec<Device>>, StatusCode> {
    state
        .repository
        .list()
        .await
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to query devices: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_device(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<Device>, StatusCode> {
    let mac = normalize_mac(&mac).map_err(|_| StatusCode::BAD_REQUEST)?;

    state
        .repository
        .find_by_mac_address(&mac)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query device: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Most recent detection accepted by the deduplicator for a device
async fn get_latest_detection(
    State(state): State<AppState>,
    Path(mac): Path<String>,
) -> Result<Json<DeviceDetectedEvent>, StatusCode> {
    let mac = normalize_mac(&mac).map_err(|_| StatusCode::BAD_REQUEST)?;

    state
        .dedup
        .latest_event(&mac)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        tracked_events: state.dedup.event_count(),
        in_flight_checks: state.health.in_flight(),
        max_concurrent: state.health.max_concurrent(),
    })
}

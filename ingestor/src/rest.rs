use crate::hub::FanoutHub;
use crate::liveness::DeviceRegistry;
use crate::model::{Device, ReadingsResponse};
use crate::storage::Storage;
use crate::ws;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::error;

const DEFAULT_LIMIT: u32 = 20;
const MAX_LIMIT: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DeviceRegistry>,
    pub storage: Arc<dyn Storage>,
    pub hub: Arc<FanoutHub>,
}

#[derive(Debug, Deserialize)]
pub struct ReadingsQuery {
    limit: Option<u32>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:id", get(get_device))
        .route("/api/devices/:id/readings", get(get_readings))
        .route("/ws", get(ws::ws_handler))
        .with_state(state)
}

async fn list_devices(State(state): State<AppState>) -> Json<Vec<Device>> {
    Json(state.registry.snapshot().await)
}

async fn get_device(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Device>, StatusCode> {
    state
        .registry
        .get(&id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_readings(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ReadingsQuery>,
) -> std::result::Result<Json<ReadingsResponse>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);

    let data = state.storage.recent_readings(&id, limit).await.map_err(|e| {
        error!("Database error: {}", e);
        AppError(anyhow::anyhow!("Reading query failed: {}", e))
    })?;

    Ok(Json(ReadingsResponse {
        total: data.len(),
        limit,
        data,
    }))
}

#[derive(Debug)]
struct AppError(anyhow::Error);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("API error: {}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Internal server error: {}", self.0),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::{ApiError, AppJson, JSend};
use crate::gate::ServiceState;
use crate::service::SecretInfo;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub state: ServiceState,
}

#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    pub state: ServiceState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetStateResponse {
    pub previous: ServiceState,
    pub state: ServiceState,
}

#[derive(Debug, Serialize)]
pub struct DeleteSecretResponse {
    pub key_id: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<StatusResponse>>, ApiError> {
    state.service.status()?;
    Ok(JSend::success(StatusResponse {
        state: ServiceState::Available,
    }))
}

pub async fn set_state(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<SetStateRequest>,
) -> Json<JSend<SetStateResponse>> {
    let previous = state.service.set_state(req.state);
    JSend::success(SetStateResponse {
        previous,
        state: req.state,
    })
}

pub async fn rotate_secret(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JSend<SecretInfo>>, ApiError> {
    let secret = state.service.rotate_secret().await?;
    Ok(JSend::success(secret))
}

pub async fn delete_secret(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<String>,
) -> Result<Json<JSend<DeleteSecretResponse>>, ApiError> {
    state.service.delete_secret(&key_id).await?;
    Ok(JSend::success(DeleteSecretResponse { key_id }))
}

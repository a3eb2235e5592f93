use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

use crate::api::response::{ApiError, AppJson, JSend};
use crate::service::{Credentials, NewUser, UserProfile, UserUpdate};
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DeleteUserResponse {
    pub identity: String,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<NewUser>,
) -> Result<(StatusCode, Json<JSend<UserProfile>>), ApiError> {
    let user = state.service.create_user(req).await?;
    Ok((StatusCode::CREATED, JSend::success(user)))
}

pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<UserProfile>>, ApiError> {
    let user = state.service.get_user(&id).await?;
    Ok(JSend::success(user))
}

pub async fn update_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(req): AppJson<UserUpdate>,
) -> Result<Json<JSend<UserProfile>>, ApiError> {
    let user = state.service.update_user(&id, req).await?;
    Ok(JSend::success(user))
}

pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JSend<DeleteUserResponse>>, ApiError> {
    state.service.delete_user(&id).await?;
    Ok(JSend::success(DeleteUserResponse { identity: id }))
}

pub async fn authenticate_user(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AppJson(req): AppJson<Credentials>,
) -> Result<Json<JSend<UserProfile>>, ApiError> {
    let user = state.service.authenticate(&id, req).await?;
    Ok(JSend::success(user))
}

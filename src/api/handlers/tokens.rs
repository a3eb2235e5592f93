use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::response::{ApiError, AppJson, JSend};
use crate::service::{Credentials, IssuedToken};
use crate::storage::models::Permission;
use crate::AppState;

// ============================================================================
// Types
// ============================================================================

#[derive(Deserialize)]
pub struct IssueTokenRequest {
    pub email: String,
    pub identity: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTokenRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyTokenResponse {
    pub expires_at: DateTime<Utc>,
    pub identity: String,
    pub key_id: String,
    pub permission: Permission,
}

// ============================================================================
// Handlers
// ============================================================================

pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<IssueTokenRequest>,
) -> Result<Json<JSend<IssuedToken>>, ApiError> {
    let credentials = Credentials {
        email: req.email,
        password: req.password,
    };
    let issued = state.service.issue_token(&req.identity, credentials).await?;
    Ok(JSend::success(issued))
}

pub async fn verify_token(
    State(state): State<Arc<AppState>>,
    AppJson(req): AppJson<VerifyTokenRequest>,
) -> Result<Json<JSend<VerifyTokenResponse>>, ApiError> {
    if req.token.trim().is_empty() {
        return Err(ApiError::bad_request("token is required"));
    }

    let claims = state.service.verify_token(req.token.trim()).await?;
    Ok(JSend::success(VerifyTokenResponse {
        expires_at: claims.expires_at,
        identity: claims.identity.to_string(),
        key_id: claims.key_id,
        permission: claims.permission,
    }))
}

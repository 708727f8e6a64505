//! Second-factor self-service.

use crate::gateway::error::{ok, ApiResult};
use crate::gateway::extract::AuthUser;
use crate::gateway::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub password: String,
}

pub async fn setup(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let setup = state.auth.twofactor_setup(user.principal_id()).await?;
    Ok(ok(setup))
}

pub async fn confirm(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<ConfirmRequest>,
) -> ApiResult<Json<Value>> {
    state
        .auth
        .twofactor_confirm(user.principal_id(), &body.code)
        .await?;
    Ok(ok(json!({ "enrolled": true })))
}

pub async fn disable(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<DisableRequest>,
) -> ApiResult<Json<Value>> {
    state
        .auth
        .twofactor_disable(user.principal_id(), &body.password)
        .await?;
    Ok(ok(json!({ "disabled": true })))
}

pub async fn backup_codes(State(state): State<AppState>, user: AuthUser) -> ApiResult<Json<Value>> {
    let codes = state
        .auth
        .regenerate_backup_codes(user.principal_id())
        .await?;
    Ok(ok(json!({ "backupCodes": codes })))
}

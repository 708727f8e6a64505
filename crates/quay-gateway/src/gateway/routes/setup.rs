//! First-boot setup wizard. Only usable while no principal exists; after
//! that every route here answers 403.

use crate::gateway::error::{created, ok, ApiError, ApiResult};
use crate::gateway::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use quay_auth::Role;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct SetupAdminRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
}

pub async fn status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(ok(json!({ "complete": state.setup_complete().await })))
}

pub async fn create_admin(
    State(state): State<AppState>,
    Json(body): Json<SetupAdminRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if state.setup_complete().await {
        return Err(ApiError::forbidden("Setup is already complete"));
    }
    let principal = state
        .auth
        .create_principal(
            &body.username,
            &body.email,
            &body.password,
            Role::Admin,
            Some("setup"),
        )
        .await?;
    Ok(created(principal))
}

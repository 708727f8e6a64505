//! Failed-login telemetry and IP-block administration.

use crate::gateway::error::{ok, ApiResult};
use crate::gateway::extract::AdminUser;
use crate::gateway::routes::users::PageQuery;
use crate::gateway::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct BlockQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    /// Include retired blocks as well.
    #[serde(default)]
    pub all: bool,
}

fn default_limit() -> i64 {
    50
}

pub async fn attempts(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Value>> {
    let attempts = state
        .security
        .list_attempts(page.offset, page.limit.clamp(1, 500))
        .await?;
    Ok(ok(attempts))
}

pub async fn blocks(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<BlockQuery>,
) -> ApiResult<Json<Value>> {
    let blocks = state
        .security
        .list_blocks(!query.all, query.offset, query.limit.clamp(1, 500))
        .await?;
    Ok(ok(blocks))
}

pub async fn unblock(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(ip): Path<String>,
) -> ApiResult<Json<Value>> {
    state.security.unblock(&ip, Some(admin.username())).await?;
    Ok(ok(json!({ "unblocked": ip })))
}

pub async fn mark_permanent(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(ip): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .security
        .mark_permanent(&ip, Some(admin.username()))
        .await?;
    Ok(ok(json!({ "permanent": ip })))
}

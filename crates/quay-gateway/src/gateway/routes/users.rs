//! User and group administration. Admin-only throughout.

use crate::gateway::error::{created, ok, ApiError, ApiResult};
use crate::gateway::extract::AdminUser;
use crate::gateway::state::AppState;
use crate::gateway::stores::GroupEntry;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use quay_auth::Role;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: String,
    pub role: Role,
}

#[derive(Debug, Deserialize)]
pub struct UpdateUserRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SetPasswordRequest {
    pub password: String,
}

pub async fn list(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<Value>> {
    let principals = state
        .auth
        .principals()
        .list(page.offset, page.limit.clamp(1, 500))
        .await?;
    let infos: Vec<_> = principals.iter().map(|p| p.to_info()).collect();
    Ok(ok(infos))
}

pub async fn create(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(body): Json<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let principal = state
        .auth
        .create_principal(
            &body.username,
            &body.email,
            &body.password,
            body.role,
            Some(admin.username()),
        )
        .await?;
    Ok(created(principal))
}

pub async fn get_one(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let principal = state
        .auth
        .principals()
        .get_by_id(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("User {} not found", id)))?;
    Ok(ok(principal.to_info()))
}

pub async fn update(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateUserRequest>,
) -> ApiResult<Json<Value>> {
    let updated = state
        .auth
        .update_principal(
            id,
            body.email.as_deref(),
            body.role,
            body.enabled,
            Some(admin.username()),
        )
        .await?;
    Ok(ok(updated))
}

pub async fn set_password(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<i64>,
    Json(body): Json<SetPasswordRequest>,
) -> ApiResult<Json<Value>> {
    state
        .auth
        .set_principal_password(id, &body.password, Some(admin.username()))
        .await?;
    Ok(ok(json!({ "updated": true })))
}

pub async fn remove(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    if id == admin.principal_id() {
        return Err(ApiError::conflict("Refusing to delete the calling account"));
    }
    state
        .auth
        .delete_principal(id, Some(admin.username()))
        .await?;
    Ok(ok(json!({ "deleted": true })))
}

// ── Groups ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    pub name: String,
    #[serde(default)]
    pub member_ids: Vec<i64>,
}

pub async fn list_groups(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Json<Value>> {
    Ok(ok(state.groups.list().await?))
}

pub async fn create_group(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(body): Json<GroupRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.name.is_empty() || body.name.len() > 64 {
        return Err(ApiError::bad_request("Group name must be 1-64 characters"));
    }
    let group = GroupEntry {
        id: quay_core::new_id(),
        name: body.name,
        member_ids: body.member_ids,
        created_at: state.clock.now_millis(),
    };
    if !state.groups.insert(&group).await? {
        return Err(ApiError::conflict(format!(
            "Group '{}' already exists",
            group.name
        )));
    }
    Ok(created(group))
}

pub async fn update_group(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<GroupRequest>,
) -> ApiResult<Json<Value>> {
    if !state.groups.set_members(&id, &body.member_ids).await? {
        return Err(ApiError::not_found(format!("Group {} not found", id)));
    }
    let group = state
        .groups
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Group {} not found", id)))?;
    Ok(ok(group))
}

pub async fn delete_group(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.groups.delete(&id).await? {
        return Err(ApiError::not_found(format!("Group {} not found", id)));
    }
    Ok(ok(json!({ "deleted": true })))
}

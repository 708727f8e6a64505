//! Audit reads, alert rules, scheduled tasks, and the plugin registry.
//! Admin-only throughout.

use crate::gateway::error::{created, ok, ApiError, ApiResult};
use crate::gateway::extract::AdminUser;
use crate::gateway::state::AppState;
use crate::gateway::stores::{AlertRule, PluginEntry, TaskDef, TaskExecution, TASK_KINDS};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use quay_audit::{AuditFilter, AuditSeverity, AuditStatus};
use serde::Deserialize;
use serde_json::{json, Value};

// ── Audit ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub from: Option<i64>,
    #[serde(default)]
    pub to: Option<i64>,
}

fn default_limit() -> i64 {
    50
}

pub async fn audit_query(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Value>> {
    let status = match &query.status {
        Some(raw) => Some(
            AuditStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Unknown status '{}'", raw)))?,
        ),
        None => None,
    };
    let severity = match &query.severity {
        Some(raw) => Some(
            AuditSeverity::parse(raw)
                .ok_or_else(|| ApiError::bad_request(format!("Unknown severity '{}'", raw)))?,
        ),
        None => None,
    };
    let filter = AuditFilter {
        username: query.username,
        action_prefix: query.action,
        status,
        severity,
        from: query.from,
        to: query.to,
    };
    let page = state
        .audit_store
        .query(&filter, query.offset, query.limit.clamp(1, 500))
        .await?;
    Ok(ok(page))
}

pub async fn audit_stats(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    let stats = state.audit_store.stats(state.clock.now_millis()).await?;
    Ok(ok(stats))
}

// ── Alerts ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AlertRequest {
    pub name: String,
    pub metric: String,
    pub op: String,
    pub threshold: i64,
    pub severity: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn validate_alert(body: &AlertRequest) -> ApiResult<()> {
    if body.name.is_empty() {
        return Err(ApiError::bad_request("Alert name must not be empty"));
    }
    if !matches!(body.op.as_str(), "gt" | "lt") {
        return Err(ApiError::bad_request("op must be 'gt' or 'lt'"));
    }
    if AuditSeverity::parse(&body.severity).is_none() {
        return Err(ApiError::bad_request("severity must be info, warning, or critical"));
    }
    Ok(())
}

pub async fn alert_list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    Ok(ok(state.alerts.list().await?))
}

pub async fn alert_create(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(body): Json<AlertRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    validate_alert(&body)?;
    let rule = AlertRule {
        id: quay_core::new_id(),
        name: body.name,
        metric: body.metric,
        op: body.op,
        threshold: body.threshold,
        severity: body.severity,
        enabled: body.enabled,
        created_at: state.clock.now_millis(),
    };
    state.alerts.insert(&rule).await?;
    Ok(created(rule))
}

pub async fn alert_update(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<AlertRequest>,
) -> ApiResult<Json<Value>> {
    validate_alert(&body)?;
    let rule = AlertRule {
        id: id.clone(),
        name: body.name,
        metric: body.metric,
        op: body.op,
        threshold: body.threshold,
        severity: body.severity,
        enabled: body.enabled,
        created_at: 0,
    };
    if !state.alerts.update(&rule).await? {
        return Err(ApiError::not_found(format!("Alert {} not found", id)));
    }
    Ok(ok(rule))
}

pub async fn alert_delete(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.alerts.delete(&id).await? {
        return Err(ApiError::not_found(format!("Alert {} not found", id)));
    }
    Ok(ok(json!({ "deleted": true })))
}

// ── Tasks ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    pub name: String,
    pub kind: String,
    pub schedule_secs: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

pub async fn task_list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    Ok(ok(state.tasks.list().await?))
}

pub async fn task_create(
    State(state): State<AppState>,
    _admin: AdminUser,
    Json(body): Json<TaskRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if !TASK_KINDS.contains(&body.kind.as_str()) {
        return Err(ApiError::bad_request(format!(
            "kind must be one of {:?}",
            TASK_KINDS
        )));
    }
    if body.schedule_secs < 60 {
        return Err(ApiError::bad_request("scheduleSecs must be at least 60"));
    }
    let def = TaskDef {
        id: quay_core::new_id(),
        name: body.name,
        kind: body.kind,
        schedule_secs: body.schedule_secs,
        enabled: body.enabled,
        created_at: state.clock.now_millis(),
    };
    state.tasks.insert(&def).await?;
    Ok(created(def))
}

pub async fn task_update(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<TaskRequest>,
) -> ApiResult<Json<Value>> {
    if state.tasks.get(&id).await?.is_none() {
        return Err(ApiError::not_found(format!("Task {} not found", id)));
    }
    state.tasks.set_enabled(&id, body.enabled).await?;
    let def = state
        .tasks
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Task {} not found", id)))?;
    Ok(ok(def))
}

pub async fn task_delete(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.tasks.delete(&id).await? {
        return Err(ApiError::not_found(format!("Task {} not found", id)));
    }
    Ok(ok(json!({ "deleted": true })))
}

/// Run one task immediately; the runner owned by the composition root
/// picks the execution row up the same way scheduled runs do.
pub async fn task_run(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let def = state
        .tasks
        .get(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("Task {} not found", id)))?;
    let execution = TaskExecution {
        id: quay_core::new_id(),
        task_id: def.id.clone(),
        started_at: state.clock.now_millis(),
        finished_at: None,
        status: "requested".into(),
        output: format!("requested by {}", admin.username()),
    };
    state.tasks.record_execution(&execution).await?;
    Ok(ok(execution))
}

pub async fn task_executions(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(ok(state.tasks.list_executions(&id, 50).await?))
}

// ── Plugins ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PluginRequest {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct PluginUpdateRequest {
    pub enabled: bool,
}

pub async fn plugin_list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    Ok(ok(state.plugins.list().await?))
}

pub async fn plugin_register(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(body): Json<PluginRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if body.name.is_empty() {
        return Err(ApiError::bad_request("Plugin name must not be empty"));
    }
    let entry = PluginEntry {
        id: quay_core::new_id(),
        name: body.name,
        version: body.version,
        enabled: false,
        created_at: state.clock.now_millis(),
    };
    state.plugins.register(&entry).await?;
    state.audit.log(
        quay_audit::AuditRecord::new(
            "plugin.registered",
            format!("plugin:{}", entry.name),
            format!("Plugin {} {} registered", entry.name, entry.version),
        )
        .with_principal(admin.username()),
    );
    Ok(created(entry))
}

pub async fn plugin_update(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(id): Path<String>,
    Json(body): Json<PluginUpdateRequest>,
) -> ApiResult<Json<Value>> {
    if !state.plugins.set_enabled(&id, body.enabled).await? {
        return Err(ApiError::not_found(format!("Plugin {} not found", id)));
    }
    Ok(ok(json!({ "enabled": body.enabled })))
}

pub async fn plugin_remove(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.plugins.remove(&id).await? {
        return Err(ApiError::not_found(format!("Plugin {} not found", id)));
    }
    state.audit.log(
        quay_audit::AuditRecord::new(
            "plugin.removed",
            format!("plugin:{}", id),
            "Plugin removed",
        )
        .with_principal(admin.username()),
    );
    Ok(ok(json!({ "deleted": true })))
}

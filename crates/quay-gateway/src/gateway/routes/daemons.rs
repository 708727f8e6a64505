//! Supervisor lifecycle and command dispatch.
//!
//! Every mutation here is admin-only. Commands travel as the kind-tagged
//! `{action, params}` envelope; each supervisor parses its own typed set.

use crate::gateway::error::{accepted, ok, ApiError, ApiResult};
use crate::gateway::extract::AdminUser;
use crate::gateway::state::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use quay_audit::AuditRecord;
use quay_core::Metrics;
use quay_samba::ProvisionOptions;
use quay_supervisor::{CommandRequest, DaemonKind, Supervisor};
use serde_json::{json, Value};
use std::sync::Arc;

async fn lookup(state: &AppState, kind: DaemonKind) -> ApiResult<Arc<dyn Supervisor>> {
    state
        .registry
        .get(kind)
        .await
        .ok_or_else(|| ApiError::not_found(format!("Supervisor {} is not enabled", kind.as_str())))
}

fn parse_kind(kind: &str) -> ApiResult<DaemonKind> {
    DaemonKind::parse(kind)
        .ok_or_else(|| ApiError::bad_request(format!("Unknown daemon kind '{}'", kind)))
}

async fn dispatch(
    state: &AppState,
    admin: &AdminUser,
    kind: DaemonKind,
    request: CommandRequest,
) -> ApiResult<Json<Value>> {
    let supervisor = lookup(state, kind).await?;
    Metrics::incr(&state.metrics.supervisor_commands_total);
    let action = request.action.clone();
    let result = supervisor.execute(request).await;
    match result {
        Ok(output) => {
            state.audit.log(
                AuditRecord::new(
                    format!("{}.{}", audit_prefix(kind), action),
                    format!("daemon:{}", kind.as_str()),
                    output.message.clone(),
                )
                .with_principal(admin.username()),
            );
            Ok(ok(output))
        }
        Err(e) => {
            Metrics::incr(&state.metrics.supervisor_command_errors_total);
            state.audit.log(
                AuditRecord::new(
                    format!("{}.{}", audit_prefix(kind), action),
                    format!("daemon:{}", kind.as_str()),
                    e.to_string(),
                )
                .with_status(quay_audit::AuditStatus::Failure)
                .with_severity(quay_audit::AuditSeverity::Warning)
                .with_principal(admin.username()),
            );
            Err(e.into())
        }
    }
}

fn audit_prefix(kind: DaemonKind) -> &'static str {
    match kind {
        DaemonKind::SambaAd => "ad",
        DaemonKind::AsteriskAmi => "pbx",
        DaemonKind::WireGuard | DaemonKind::OpenVpn | DaemonKind::Pptp | DaemonKind::L2tp => "vpn",
    }
}

// ── Generic lifecycle ────────────────────────────────────────────────

pub async fn list(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    Ok(ok(state.registry.descriptors().await))
}

pub async fn start(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(kind): Path<String>,
) -> ApiResult<Json<Value>> {
    let kind = parse_kind(&kind)?;
    let supervisor = lookup(&state, kind).await?;
    supervisor.start().await?;
    state.audit.log(
        AuditRecord::new(
            "daemon.start",
            format!("daemon:{}", kind.as_str()),
            "Daemon started",
        )
        .with_principal(admin.username()),
    );
    Ok(ok(supervisor.status().await))
}

pub async fn stop(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(kind): Path<String>,
) -> ApiResult<Json<Value>> {
    let kind = parse_kind(&kind)?;
    let supervisor = lookup(&state, kind).await?;
    supervisor.stop().await?;
    state.audit.log(
        AuditRecord::new(
            "daemon.stop",
            format!("daemon:{}", kind.as_str()),
            "Daemon stopped",
        )
        .with_principal(admin.username()),
    );
    Ok(ok(supervisor.status().await))
}

pub async fn restart(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(kind): Path<String>,
) -> ApiResult<Json<Value>> {
    let kind = parse_kind(&kind)?;
    let supervisor = lookup(&state, kind).await?;
    supervisor.restart().await?;
    state.audit.log(
        AuditRecord::new(
            "daemon.restart",
            format!("daemon:{}", kind.as_str()),
            "Daemon restarted",
        )
        .with_principal(admin.username()),
    );
    Ok(ok(supervisor.status().await))
}

// ── Samba AD DC ──────────────────────────────────────────────────────

pub async fn ad_provision(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(options): Json<ProvisionOptions>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let samba = state
        .samba
        .clone()
        .ok_or_else(|| ApiError::not_found("Samba supervisor is not enabled"))?;
    // Validate synchronously so the caller gets a 400 before the 202.
    options.validate()?;
    if samba.status().await.state != quay_supervisor::DaemonState::Stopped
        && samba.status().await.state != quay_supervisor::DaemonState::Failed
    {
        return Err(ApiError::conflict("Domain provisioning requires a stopped daemon"));
    }

    let audit = state.audit.clone();
    let actor = admin.username().to_string();
    let realm = options.realm.clone();
    tokio::spawn(async move {
        match samba.provision(options).await {
            Ok(output) => {
                audit.log(
                    AuditRecord::new("ad.domain.provision", "daemon:samba_ad", output.message)
                        .with_principal(&actor),
                );
            }
            Err(e) => {
                audit.log(
                    AuditRecord::new(
                        "ad.domain.provision",
                        "daemon:samba_ad",
                        format!("Provisioning failed: {}", e),
                    )
                    .with_status(quay_audit::AuditStatus::Error)
                    .with_severity(quay_audit::AuditSeverity::Critical)
                    .with_principal(&actor),
                );
            }
        }
    });

    Ok(accepted(json!({ "provisioning": realm })))
}

pub async fn ad_demote(State(state): State<AppState>, admin: AdminUser) -> ApiResult<Json<Value>> {
    let samba = state
        .samba
        .clone()
        .ok_or_else(|| ApiError::not_found("Samba supervisor is not enabled"))?;
    let output = samba.demote().await?;
    state.audit.log(
        AuditRecord::new("ad.domain.demote", "daemon:samba_ad", output.message.clone())
            .with_severity(quay_audit::AuditSeverity::Warning)
            .with_principal(admin.username()),
    );
    Ok(ok(output))
}

pub async fn ad_status(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    let supervisor = lookup(&state, DaemonKind::SambaAd).await?;
    Ok(ok(supervisor.status().await))
}

pub async fn ad_command(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Json<Value>> {
    dispatch(&state, &admin, DaemonKind::SambaAd, request).await
}

// ── Asterisk PBX ─────────────────────────────────────────────────────

pub async fn pbx_status(State(state): State<AppState>, _admin: AdminUser) -> ApiResult<Json<Value>> {
    let supervisor = lookup(&state, DaemonKind::AsteriskAmi).await?;
    Ok(ok(supervisor.status().await))
}

pub async fn pbx_command(
    State(state): State<AppState>,
    admin: AdminUser,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Json<Value>> {
    dispatch(&state, &admin, DaemonKind::AsteriskAmi, request).await
}

// ── VPN stacks ───────────────────────────────────────────────────────

fn parse_vpn_kind(protocol: &str) -> ApiResult<DaemonKind> {
    match protocol {
        "wireguard" => Ok(DaemonKind::WireGuard),
        "openvpn" => Ok(DaemonKind::OpenVpn),
        "pptp" => Ok(DaemonKind::Pptp),
        "l2tp" => Ok(DaemonKind::L2tp),
        other => Err(ApiError::bad_request(format!(
            "Unknown VPN protocol '{}'",
            other
        ))),
    }
}

pub async fn vpn_status(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path(protocol): Path<String>,
) -> ApiResult<Json<Value>> {
    let supervisor = lookup(&state, parse_vpn_kind(&protocol)?).await?;
    Ok(ok(supervisor.status().await))
}

pub async fn vpn_command(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(protocol): Path<String>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<Json<Value>> {
    dispatch(&state, &admin, parse_vpn_kind(&protocol)?, request).await
}

pub async fn vpn_connections(
    State(state): State<AppState>,
    admin: AdminUser,
    Path(protocol): Path<String>,
) -> ApiResult<Json<Value>> {
    dispatch(
        &state,
        &admin,
        parse_vpn_kind(&protocol)?,
        CommandRequest::bare("connections"),
    )
    .await
}

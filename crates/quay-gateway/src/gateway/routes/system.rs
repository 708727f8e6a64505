//! Liveness, metrics exposition, and read-mostly telemetry.

use crate::gateway::error::{ok, ApiResult};
use crate::gateway::extract::AuthUser;
use crate::gateway::state::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use quay_supervisor::DaemonState;
use serde_json::{json, Value};

/// Unauthenticated liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "quaynas",
        "version": state.version,
    }))
}

/// Prometheus text exposition; intentionally unauthenticated.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

pub async fn info(State(state): State<AppState>, _user: AuthUser) -> ApiResult<Json<Value>> {
    let uptime_secs = (state.clock.now_millis() - state.started_at_ms) / 1000;
    let hostname = tokio::fs::read_to_string("/etc/hostname")
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    Ok(ok(json!({
        "hostname": hostname,
        "version": state.version,
        "uptimeSecs": uptime_secs,
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })))
}

pub async fn metrics_summary(
    State(state): State<AppState>,
    _user: AuthUser,
) -> ApiResult<Json<Value>> {
    Ok(ok(state.metrics.snapshot()))
}

/// Coarse 0-100 health score from supervisor states.
pub async fn health_score(State(state): State<AppState>, _user: AuthUser) -> ApiResult<Json<Value>> {
    let descriptors = state.registry.descriptors().await;
    let mut score: i64 = 100;
    let mut degraded = Vec::new();
    let mut failed = Vec::new();
    for descriptor in &descriptors {
        match descriptor.state {
            DaemonState::Degraded => {
                score -= 15;
                degraded.push(descriptor.kind.as_str());
            }
            DaemonState::Failed => {
                score -= 35;
                failed.push(descriptor.kind.as_str());
            }
            _ => {}
        }
    }
    Ok(ok(json!({
        "score": score.max(0),
        "degraded": degraded,
        "failed": failed,
        "daemons": descriptors,
    })))
}

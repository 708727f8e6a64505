//! Route table and pipeline assembly.
//!
//! Middleware order (outermost first): request-id, real-ip, trace,
//! panic catch, timeout, CORS. The IP-block gate wraps the two public
//! login routes only. Authentication and the admin gate are enforced by
//! the `AuthUser` / `AdminUser` extractors on each protected handler.

pub mod auth;
pub mod daemons;
pub mod directory;
pub mod misc;
pub mod security;
pub mod setup;
pub mod system;
pub mod twofactor;
pub mod users;

use crate::gateway::middleware;
use crate::gateway::state::AppState;
use crate::gateway::ws;
use axum::http::{header, HeaderValue, Method};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::Router;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;

pub fn build_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(system::health))
        .route("/metrics", get(system::metrics));

    let login = Router::new()
        .route("/api/v1/auth/login", post(auth::login))
        .route("/api/v1/auth/login/2fa", post(auth::login_2fa))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::ip_block_gate,
        ));

    let setup = Router::new()
        .route("/api/v1/setup/status", get(setup::status))
        .route("/api/v1/setup/admin", post(setup::create_admin));

    let api = Router::new()
        // Session management.
        .route("/api/v1/auth/logout", post(auth::logout))
        .route("/api/v1/auth/refresh", post(auth::refresh))
        .route("/api/v1/auth/me", get(auth::me))
        // Second factor (self-service).
        .route("/api/v1/2fa/setup", post(twofactor::setup))
        .route("/api/v1/2fa/confirm", post(twofactor::confirm))
        .route("/api/v1/2fa/disable", post(twofactor::disable))
        .route("/api/v1/2fa/backup-codes", post(twofactor::backup_codes))
        // Users and groups (admin).
        .route("/api/v1/users", get(users::list).post(users::create))
        .route(
            "/api/v1/users/:id",
            get(users::get_one).put(users::update).delete(users::remove),
        )
        .route("/api/v1/users/:id/password", put(users::set_password))
        .route("/api/v1/groups", get(users::list_groups).post(users::create_group))
        .route(
            "/api/v1/groups/:id",
            put(users::update_group).delete(users::delete_group),
        )
        // Telemetry.
        .route("/api/v1/system/info", get(system::info))
        .route("/api/v1/metrics/summary", get(system::metrics_summary))
        .route("/api/v1/health/score", get(system::health_score))
        // Audit (admin).
        .route("/api/v1/audit", get(misc::audit_query))
        .route("/api/v1/audit/stats", get(misc::audit_stats))
        // Failed logins and IP blocks (admin).
        .route("/api/v1/security/attempts", get(security::attempts))
        .route("/api/v1/security/blocks", get(security::blocks))
        .route("/api/v1/security/blocks/:ip", delete(security::unblock))
        .route(
            "/api/v1/security/blocks/:ip/permanent",
            post(security::mark_permanent),
        )
        // Directory service (admin).
        .route(
            "/api/v1/directory",
            get(directory::get_config).put(directory::put_config),
        )
        .route("/api/v1/directory/test", post(directory::test_bind))
        // Supervisors, generic lifecycle (admin).
        .route("/api/v1/supervisors", get(daemons::list))
        .route("/api/v1/supervisors/:kind/start", post(daemons::start))
        .route("/api/v1/supervisors/:kind/stop", post(daemons::stop))
        .route("/api/v1/supervisors/:kind/restart", post(daemons::restart))
        // Samba AD DC (admin).
        .route("/api/v1/ad/provision", post(daemons::ad_provision))
        .route("/api/v1/ad/demote", post(daemons::ad_demote))
        .route("/api/v1/ad/status", get(daemons::ad_status))
        .route("/api/v1/ad/command", post(daemons::ad_command))
        // Asterisk PBX (admin).
        .route("/api/v1/pbx/status", get(daemons::pbx_status))
        .route("/api/v1/pbx/command", post(daemons::pbx_command))
        // VPN stacks (admin).
        .route("/api/v1/vpn/:protocol/status", get(daemons::vpn_status))
        .route("/api/v1/vpn/:protocol/command", post(daemons::vpn_command))
        .route(
            "/api/v1/vpn/:protocol/connections",
            get(daemons::vpn_connections),
        )
        // Alerts, tasks, plugins (admin).
        .route("/api/v1/alerts", get(misc::alert_list).post(misc::alert_create))
        .route(
            "/api/v1/alerts/:id",
            put(misc::alert_update).delete(misc::alert_delete),
        )
        .route("/api/v1/tasks", get(misc::task_list).post(misc::task_create))
        .route(
            "/api/v1/tasks/:id",
            put(misc::task_update).delete(misc::task_delete),
        )
        .route("/api/v1/tasks/:id/run", post(misc::task_run))
        .route("/api/v1/tasks/:id/executions", get(misc::task_executions))
        .route("/api/v1/plugins", get(misc::plugin_list).post(misc::plugin_register))
        .route(
            "/api/v1/plugins/:id",
            put(misc::plugin_update).delete(misc::plugin_remove),
        )
        // Live streams.
        .route("/ws", get(ws::event_stream))
        .route("/api/v1/terminal/ws", get(ws::terminal));

    Router::new()
        .merge(public)
        .merge(login)
        .merge(setup)
        .merge(api)
        .fallback(not_found)
        .layer(cors_layer(&state))
        .layer(TimeoutLayer::new(Duration::from_secs(
            state.config.request_timeout_secs,
        )))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::trace_requests,
        ))
        .layer(axum::middleware::from_fn(middleware::real_ip))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state)
}

async fn not_found() -> impl IntoResponse {
    crate::gateway::error::ApiError::not_found("No such route")
}

fn handle_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    log::error!("[http] handler panicked: {}", message);
    crate::gateway::error::ApiError::internal().into_response()
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let mut layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);
    let origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    if !origins.is_empty() {
        layer = layer.allow_origin(origins).allow_credentials(true);
    }
    layer
}

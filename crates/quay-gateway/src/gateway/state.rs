//! Composition-root state shared across handlers.

use crate::gateway::middleware::LoginRateLimiter;
use crate::gateway::stores::{AlertStore, GroupStore, PluginStore, TaskStore};
use quay_audit::{AuditSink, AuditStore};
use quay_auth::AuthService;
use quay_core::{Clock, Metrics};
use quay_samba::SambaSupervisor;
use quay_security::FailedLoginService;
use quay_supervisor::SupervisorRegistry;
use std::sync::Arc;

/// Gateway knobs read from the boot config.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Hard per-request deadline.
    pub request_timeout_secs: u64,
    /// Allowed CORS origins; empty means same-origin only.
    pub cors_origins: Vec<String>,
    /// Login attempts allowed per ip per minute before 429.
    pub rate_limit_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            cors_origins: Vec::new(),
            rate_limit_per_minute: 30,
        }
    }
}

/// Everything the routes need, explicitly constructed in `main` (no
/// process-wide singletons).
#[derive(Clone)]
pub struct AppState {
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<Metrics>,
    pub audit: AuditSink,
    pub audit_store: AuditStore,
    pub security: Arc<FailedLoginService>,
    pub auth: Arc<AuthService>,
    pub registry: Arc<SupervisorRegistry>,
    /// Concrete handle for the provisioning/demotion surface, which is
    /// wider than the uniform supervisor contract.
    pub samba: Option<Arc<SambaSupervisor>>,
    pub alerts: AlertStore,
    pub tasks: TaskStore,
    pub plugins: PluginStore,
    pub groups: GroupStore,
    pub rate_limiter: Arc<LoginRateLimiter>,
    pub config: Arc<GatewayConfig>,
    /// Version string surfaced by /health and /api/v1/system/info.
    pub version: &'static str,
    /// Boot instant, for uptime reporting.
    pub started_at_ms: i64,
}

impl AppState {
    /// Setup stays open until the first principal exists.
    pub async fn setup_complete(&self) -> bool {
        self.auth
            .principals()
            .count()
            .await
            .map(|n| n > 0)
            .unwrap_or(true)
    }
}

//! End-to-end tests over the full router: setup wizard, login with
//! brute-force blocking, the second-factor flow, token rotation, role
//! gates, and supervisor lifecycle conflicts.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use quay_audit::{AuditSink, AuditStore, SinkConfig};
use quay_auth::{AuthConfig, AuthService, DirectoryService, PrincipalStore, RefreshStore, SecretBox};
use quay_core::{Clock, ManualClock, Metrics};
use quay_gateway::{
    build_router, AlertStore, AppState, GatewayConfig, GroupStore, PluginStore, TaskStore,
};
use quay_security::{FailedLoginService, SecurityConfig, SecurityStore};
use quay_supervisor::{
    CommandOutput, CommandRequest, DaemonDescriptor, DaemonKind, DaemonState, EventHub,
    EventStream, StateCell, Supervisor, SupervisorRegistry, SupervisorResult,
};
use quay_vpn::VpnStore;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const T0: i64 = 1_700_000_000_000;

struct Harness {
    router: Router,
    clock: Arc<ManualClock>,
    registry: Arc<SupervisorRegistry>,
    audit_store: AuditStore,
}

async fn harness() -> Harness {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();

    let audit_store = AuditStore::new(pool.clone());
    audit_store.ensure_schema().await.unwrap();
    let security_store = SecurityStore::new(pool.clone());
    security_store.ensure_schema().await.unwrap();
    let principal_store = PrincipalStore::new(pool.clone());
    principal_store.ensure_schema().await.unwrap();
    let refresh_store = RefreshStore::new(pool.clone());
    refresh_store.ensure_schema().await.unwrap();
    VpnStore::new(pool.clone()).ensure_schema().await.unwrap();
    let alerts = AlertStore::new(pool.clone());
    alerts.ensure_schema().await.unwrap();
    let tasks = TaskStore::new(pool.clone());
    tasks.ensure_schema().await.unwrap();
    let plugins = PluginStore::new(pool.clone());
    plugins.ensure_schema().await.unwrap();
    let groups = GroupStore::new(pool.clone());
    groups.ensure_schema().await.unwrap();

    let clock = Arc::new(ManualClock::at_millis(T0));
    let clock_dyn: Arc<dyn Clock> = clock.clone();
    let metrics = Arc::new(Metrics::new());
    let audit = AuditSink::spawn(
        audit_store.clone(),
        clock_dyn.clone(),
        metrics.clone(),
        SinkConfig::default(),
    );

    // Scenario configuration: three failures in five minutes block for
    // ten minutes.
    let security = Arc::new(FailedLoginService::new(
        security_store,
        clock_dyn.clone(),
        audit.clone(),
        metrics.clone(),
        SecurityConfig {
            max_attempts: 3,
            window_secs: 300,
            block_secs: 600,
            cleanup_secs: 3600,
            retention_days: 30,
        },
    ));

    let directory = Arc::new(
        DirectoryService::load(pool.clone(), SecretBox::new("integration-test-secret"))
            .await
            .unwrap(),
    );
    let auth = Arc::new(
        AuthService::new(
            principal_store,
            refresh_store,
            directory,
            security.clone(),
            audit.clone(),
            metrics.clone(),
            clock_dyn.clone(),
            AuthConfig {
                jwt_secret: "integration-test-secret".into(),
                min_verify_ms: 0,
                ..AuthConfig::default()
            },
        )
        .unwrap(),
    );

    let registry = Arc::new(SupervisorRegistry::new());

    let state = AppState {
        clock: clock_dyn.clone(),
        metrics,
        audit,
        audit_store: audit_store.clone(),
        security,
        auth,
        registry: registry.clone(),
        samba: None,
        alerts,
        tasks,
        plugins,
        groups,
        rate_limiter: Arc::new(Default::default()),
        config: Arc::new(GatewayConfig {
            rate_limit_per_minute: 1000,
            ..GatewayConfig::default()
        }),
        version: "test",
        started_at_ms: T0,
    };

    Harness {
        router: build_router(state),
        clock,
        registry,
        audit_store,
    }
}

async fn request(
    router: &Router,
    method: &str,
    path: &str,
    ip: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header("x-forwarded-for", ip);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, value)
}

async fn create_admin(h: &Harness, username: &str, password: &str) {
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/setup/admin",
        "192.0.2.1",
        None,
        Some(json!({ "username": username, "password": password, "email": "a@example.com" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

async fn login(h: &Harness, username: &str, password: &str, ip: &str) -> (StatusCode, Value) {
    request(
        &h.router,
        "POST",
        "/api/v1/auth/login",
        ip,
        None,
        Some(json!({ "username": username, "password": password })),
    )
    .await
}

async fn login_token(h: &Harness, username: &str, password: &str, ip: &str) -> String {
    let (status, body) = login(h, username, password, ip).await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["data"]["accessToken"].as_str().unwrap().to_string()
}

// ── Liveness & setup ─────────────────────────────────────────────────

#[tokio::test]
async fn health_and_metrics_are_public() {
    let h = harness().await;
    let (status, body) = request(&h.router, "GET", "/health", "192.0.2.1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = request(&h.router, "GET", "/metrics", "192.0.2.1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body
        .as_str()
        .unwrap()
        .contains("quaynas_http_requests_total"));
}

#[tokio::test]
async fn setup_wizard_opens_once() {
    let h = harness().await;
    let (status, body) =
        request(&h.router, "GET", "/api/v1/setup/status", "192.0.2.1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["complete"], false);

    create_admin(&h, "alice", "correct-horse-1").await;

    let (status, body) =
        request(&h.router, "GET", "/api/v1/setup/status", "192.0.2.1", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["complete"], true);

    // A second admin through the wizard is refused.
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/setup/admin",
        "192.0.2.1",
        None,
        Some(json!({ "username": "mallory", "password": "whatever-123" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

// ── Scenario: brute force triggers a block ───────────────────────────

#[tokio::test]
async fn brute_force_blocks_the_source_ip() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    let attacker = "203.0.113.7";

    for _ in 0..3 {
        let (status, _) = login(&h, "alice", "wrong-password", attacker).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // Correct credentials, blocked address.
    let (status, body) = login(&h, "alice", "correct-horse-1", attacker).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "blocked");
    assert!(body["error"]["retryAfterSecs"].as_i64().unwrap() > 0);

    // A different address is unaffected.
    let (status, _) = login(&h, "alice", "correct-horse-1", "198.51.100.9").await;
    assert_eq!(status, StatusCode::OK);

    // The block lapses after its ten minutes.
    h.clock.advance(chrono::Duration::seconds(601));
    let (status, _) = login(&h, "alice", "correct-horse-1", attacker).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn block_emits_critical_audit_record() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    for _ in 0..3 {
        login(&h, "alice", "nope-nope", "203.0.113.7").await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    let filter = quay_audit::AuditFilter {
        action_prefix: Some("security.ip_blocked".into()),
        ..Default::default()
    };
    let page = h.audit_store.query(&filter, 0, 10).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.records[0].severity, quay_audit::AuditSeverity::Critical);
}

// ── Scenario: second factor ──────────────────────────────────────────

async fn enroll_2fa(h: &Harness, token: &str) -> (String, Vec<String>) {
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/v1/2fa/setup",
        "192.0.2.1",
        Some(token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let secret = body["data"]["secret"].as_str().unwrap().to_string();
    let codes: Vec<String> = body["data"]["backup_codes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect();

    let unix = (h.clock.now_millis() / 1000) as u64;
    let code = quay_auth::auth::totp::generate_at(&secret, unix).unwrap();
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/2fa/confirm",
        "192.0.2.1",
        Some(token),
        Some(json!({ "code": code })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    (secret, codes)
}

#[tokio::test]
async fn two_factor_happy_path_and_backup_consumption() {
    let h = harness().await;
    create_admin(&h, "bob", "correct-horse-1").await;
    let token = login_token(&h, "bob", "correct-horse-1", "192.0.2.1").await;
    let (secret, codes) = enroll_2fa(&h, &token).await;

    // Password alone now yields a challenge, not tokens.
    let (status, body) = login(&h, "bob", "correct-horse-1", "192.0.2.2").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["requires2FA"], true);
    assert!(body["data"]["userId"].as_i64().is_some());
    let pending = body["data"]["pendingToken"].as_str().unwrap().to_string();
    assert!(body["data"]["refreshToken"].is_null());

    // TOTP completes the login.
    let unix = (h.clock.now_millis() / 1000) as u64;
    let code = quay_auth::auth::totp::generate_at(&secret, unix).unwrap();
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/v1/auth/login/2fa",
        "192.0.2.2",
        None,
        Some(json!({ "pendingToken": pending, "code": code, "isBackupCode": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["accessToken"].as_str().is_some());
    assert!(body["data"]["refreshToken"].as_str().is_some());

    // Backup code path, single-use.
    let (_, body) = login(&h, "bob", "correct-horse-1", "192.0.2.2").await;
    let pending = body["data"]["pendingToken"].as_str().unwrap().to_string();
    let backup = codes[0].clone();
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/auth/login/2fa",
        "192.0.2.2",
        None,
        Some(json!({ "pendingToken": pending, "code": backup, "isBackupCode": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = login(&h, "bob", "correct-horse-1", "192.0.2.2").await;
    let pending = body["data"]["pendingToken"].as_str().unwrap().to_string();
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/auth/login/2fa",
        "192.0.2.2",
        None,
        Some(json!({ "pendingToken": pending, "code": backup, "isBackupCode": true })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ── Token rotation ───────────────────────────────────────────────────

#[tokio::test]
async fn refresh_rotation_is_single_use() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    let (_, body) = login(&h, "alice", "correct-horse-1", "192.0.2.1").await;
    let refresh = body["data"]["refreshToken"].as_str().unwrap().to_string();

    let (status, body) = request(
        &h.router,
        "POST",
        "/api/v1/auth/refresh",
        "192.0.2.1",
        None,
        Some(json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let rotated = body["data"]["refreshToken"].as_str().unwrap().to_string();
    assert_ne!(rotated, refresh);

    // The spent token is dead.
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/auth/refresh",
        "192.0.2.1",
        None,
        Some(json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The rotated one works.
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/auth/refresh",
        "192.0.2.1",
        None,
        Some(json!({ "refreshToken": rotated })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

// ── Role enforcement ─────────────────────────────────────────────────

#[tokio::test]
async fn admin_gate_on_mutations_and_audit_reads() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    let admin_token = login_token(&h, "alice", "correct-horse-1", "192.0.2.1").await;

    // Admin creates a plain user.
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/users",
        "192.0.2.1",
        Some(&admin_token),
        Some(json!({ "username": "dave", "password": "plain-user-pw1", "role": "user" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let user_token = login_token(&h, "dave", "plain-user-pw1", "192.0.2.1").await;

    // The plain user can read itself but not the admin surfaces.
    let (status, body) = request(
        &h.router,
        "GET",
        "/api/v1/auth/me",
        "192.0.2.1",
        Some(&user_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["username"], "dave");

    for path in [
        "/api/v1/audit",
        "/api/v1/users",
        "/api/v1/security/blocks",
        "/api/v1/supervisors",
        "/api/v1/alerts",
    ] {
        let (status, _) = request(&h.router, "GET", path, "192.0.2.1", Some(&user_token), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN, "expected 403 on {}", path);
    }

    // No token at all is 401.
    let (status, _) = request(&h.router, "GET", "/api/v1/audit", "192.0.2.1", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // The admin reads the audit log (give the sink a beat to flush).
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (status, body) = request(
        &h.router,
        "GET",
        "/api/v1/audit?action=auth.",
        "192.0.2.1",
        Some(&admin_token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"]["total"].as_i64().unwrap() >= 1);
}

#[tokio::test]
async fn disabled_user_is_cut_off_at_refresh() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    let admin_token = login_token(&h, "alice", "correct-horse-1", "192.0.2.1").await;
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/v1/users",
        "192.0.2.1",
        Some(&admin_token),
        Some(json!({ "username": "eve", "password": "plain-user-pw1", "role": "user" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let user_id = body["data"]["id"].as_i64().unwrap();

    let (_, body) = login(&h, "eve", "plain-user-pw1", "192.0.2.1").await;
    let refresh = body["data"]["refreshToken"].as_str().unwrap().to_string();

    let (status, _) = request(
        &h.router,
        "PUT",
        &format!("/api/v1/users/{}", user_id),
        "192.0.2.1",
        Some(&admin_token),
        Some(json!({ "enabled": false })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Login and refresh are both dead now.
    let (status, _) = login(&h, "eve", "plain-user-pw1", "192.0.2.1").await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/auth/refresh",
        "192.0.2.1",
        None,
        Some(json!({ "refreshToken": refresh })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

// ── Supervisor lifecycle over HTTP ───────────────────────────────────

struct SlowStartStub {
    cell: Arc<StateCell>,
    hub: Arc<EventHub>,
}

#[async_trait::async_trait]
impl Supervisor for SlowStartStub {
    fn kind(&self) -> DaemonKind {
        DaemonKind::OpenVpn
    }
    async fn start(&self) -> SupervisorResult<()> {
        match self.cell.begin_start()? {
            quay_supervisor::StartDisposition::AlreadyRunning => return Ok(()),
            quay_supervisor::StartDisposition::Proceed => {}
        }
        tokio::time::sleep(Duration::from_millis(400)).await;
        self.cell.transition(DaemonState::Running)?;
        Ok(())
    }
    async fn stop(&self) -> SupervisorResult<()> {
        self.cell.transition(DaemonState::Stopping)?;
        self.cell.transition(DaemonState::Stopped)?;
        Ok(())
    }
    async fn restart(&self) -> SupervisorResult<()> {
        self.start().await
    }
    async fn status(&self) -> DaemonDescriptor {
        self.cell.descriptor()
    }
    async fn execute(&self, _request: CommandRequest) -> SupervisorResult<CommandOutput> {
        Ok(CommandOutput::ok("noop"))
    }
    fn events(&self) -> EventStream {
        self.hub.subscribe(true)
    }
}

#[tokio::test]
async fn concurrent_start_yields_exactly_one_conflict() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    let admin_token = login_token(&h, "alice", "correct-horse-1", "192.0.2.1").await;

    // Register a stub supervisor whose start takes a while.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = AuditStore::new(pool);
    store.ensure_schema().await.unwrap();
    let clock: Arc<dyn Clock> = Arc::new(quay_core::SystemClock);
    let metrics = Arc::new(Metrics::new());
    let sink = AuditSink::spawn(store, clock.clone(), metrics.clone(), SinkConfig::default());
    let hub = Arc::new(EventHub::new(DaemonKind::OpenVpn, clock.clone(), metrics));
    let cell = Arc::new(StateCell::new(
        DaemonKind::OpenVpn,
        "openvpn",
        "stub",
        hub.clone(),
        sink,
        clock,
    ));
    h.registry
        .register(Arc::new(SlowStartStub { cell, hub }))
        .await;

    let first = request(
        &h.router,
        "POST",
        "/api/v1/supervisors/openvpn/start",
        "192.0.2.1",
        Some(&admin_token),
        Some(json!({})),
    );
    let second = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        request(
            &h.router,
            "POST",
            "/api/v1/supervisors/openvpn/start",
            "192.0.2.1",
            Some(&admin_token),
            Some(json!({})),
        )
        .await
    };
    let ((status_a, body_a), (status_b, body_b)) = tokio::join!(first, second);

    // The overlapping start conflicts; the winner reports running.
    let statuses = [status_a, status_b];
    assert!(statuses.contains(&StatusCode::OK), "{:?} {:?}", body_a, body_b);
    assert!(statuses.contains(&StatusCode::CONFLICT));

    // Idempotent once running.
    let (status, body) = request(
        &h.router,
        "POST",
        "/api/v1/supervisors/openvpn/start",
        "192.0.2.1",
        Some(&admin_token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "running");
}

#[tokio::test]
async fn unknown_daemon_kind_is_rejected() {
    let h = harness().await;
    create_admin(&h, "alice", "correct-horse-1").await;
    let admin_token = login_token(&h, "alice", "correct-horse-1", "192.0.2.1").await;
    let (status, _) = request(
        &h.router,
        "POST",
        "/api/v1/supervisors/ftp/start",
        "192.0.2.1",
        Some(&admin_token),
        Some(json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = request(
        &h.router,
        "GET",
        "/api/v1/vpn/wireguard/status",
        "192.0.2.1",
        Some(&admin_token),
        None,
    )
    .await;
    // Not registered in this harness.
    assert_eq!(status, StatusCode::NOT_FOUND);
}

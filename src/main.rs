//! quaynas, the QuayNAS control-plane daemon.
//!
//! Composition root: loads configuration, connects the database, builds
//! every service explicitly (no init-once globals), wires the enabled
//! supervisors, and serves the HTTP/WebSocket API until a shutdown
//! signal arrives.
//!
//! Exit codes: 0 clean shutdown, 1 configuration error, 2 database
//! unreachable, 3 mandatory supervisor failed to start.

mod config;
mod db;
mod runtime;

use config::AppConfig;
use quay_asterisk::{AmiConfig, AsteriskSupervisor};
use quay_audit::{AuditSink, AuditStore, SinkConfig};
use quay_auth::{
    AuthConfig, AuthService, DirectoryService, PrincipalStore, RefreshStore, SecretBox,
};
use quay_core::{Clock, Metrics, SystemClock};
use quay_gateway::{
    build_router, AlertStore, AppState, GatewayConfig, GroupStore, PluginStore, TaskStore,
};
use quay_samba::{SambaSupervisor, SambaConfig};
use quay_security::{spawn_sweeper, FailedLoginService, SecurityConfig, SecurityStore};
use quay_supervisor::{
    spawn_health_loop, DaemonKind, EventHub, HealthConfig, StateCell, Supervisor,
    SupervisorRegistry,
};
use quay_vpn::{
    ChapSupervisor, ChapSupervisorConfig, OpenVpnConfig, OpenVpnSupervisor, VpnStore,
    WireGuardConfig, WireGuardSupervisor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ────────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("QUAYNAS_CONFIG").ok());
    let config = match AppConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            return 1;
        }
    };
    tracing::info!(
        "quaynas {} starting on {}:{} ({})",
        VERSION,
        config.server.host,
        config.server.port,
        config.server.mode
    );

    // ── Database ─────────────────────────────────────────────────────
    let pool = match db::connect(&config.database.path).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("{}", e);
            return 2;
        }
    };
    if let Err(e) = db::bootstrap_schema(&pool).await {
        tracing::error!("{}", e);
        return 2;
    }

    // ── Core services ────────────────────────────────────────────────
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let audit_store = AuditStore::new(pool.clone());
    let audit = AuditSink::spawn(
        audit_store.clone(),
        clock.clone(),
        metrics.clone(),
        SinkConfig {
            capacity: config.audit.buffer,
            ..SinkConfig::default()
        },
    );

    let security = Arc::new(FailedLoginService::new(
        SecurityStore::new(pool.clone()),
        clock.clone(),
        audit.clone(),
        metrics.clone(),
        SecurityConfig {
            max_attempts: config.security.max_attempts,
            window_secs: config.security.window_mins * 60,
            block_secs: config.security.block_mins * 60,
            cleanup_secs: config.security.cleanup_mins * 60,
            retention_days: config.security.retention_days,
        },
    ));

    let directory = match DirectoryService::load(
        pool.clone(),
        SecretBox::new(&config.auth.jwt_secret),
    )
    .await
    {
        Ok(directory) => Arc::new(directory),
        Err(e) => {
            tracing::error!("directory service init failed: {}", e);
            return 2;
        }
    };

    let auth = match AuthService::new(
        PrincipalStore::new(pool.clone()),
        RefreshStore::new(pool.clone()),
        directory,
        security.clone(),
        audit.clone(),
        metrics.clone(),
        clock.clone(),
        AuthConfig {
            jwt_secret: config.auth.jwt_secret.clone(),
            access_ttl_secs: config.auth.access_ttl_mins * 60,
            refresh_ttl_secs: config.auth.refresh_ttl_days * 24 * 3600,
            min_verify_ms: config.auth.min_verify_ms,
            pending_ttl_secs: config.auth.pending_ttl_mins * 60,
            backup_code_count: 10,
        },
    ) {
        Ok(auth) => Arc::new(auth),
        Err(e) => {
            tracing::error!("auth service init failed: {}", e);
            return 1;
        }
    };

    // ── Supervisors ──────────────────────────────────────────────────
    let registry = Arc::new(SupervisorRegistry::new());
    let vpn_store = VpnStore::new(pool.clone());
    let mut mandatory: Vec<DaemonKind> = Vec::new();
    let mut samba_handle: Option<Arc<SambaSupervisor>> = None;
    // Every background loop is joined at shutdown so in-flight work (and
    // its audit records) lands before the process exits.
    let mut background: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    let cell_and_hub = |kind: DaemonKind, name: &str, control: String| {
        let hub = Arc::new(EventHub::new(kind, clock.clone(), metrics.clone()));
        let cell = Arc::new(StateCell::new(
            kind,
            name,
            control,
            hub.clone(),
            audit.clone(),
            clock.clone(),
        ));
        (cell, hub)
    };

    if config.supervisors.samba.enabled {
        let section = &config.supervisors.samba;
        let (cell, hub) = cell_and_hub(DaemonKind::SambaAd, "samba", "/var/run/samba".into());
        let supervisor = Arc::new(SambaSupervisor::new(
            SambaConfig {
                manage_process: section.manage_process,
                program: section.program.clone(),
                tool_program: section.tool_program.clone(),
                ..SambaConfig::default()
            },
            cell.clone(),
            hub,
        ));
        samba_handle = Some(supervisor.clone());
        registry.register(supervisor.clone()).await;
        background.push(spawn_health_loop(
            supervisor,
            cell,
            HealthConfig::default(),
            shutdown_rx.clone(),
        ));
        if section.mandatory {
            mandatory.push(DaemonKind::SambaAd);
        }
    }

    if config.supervisors.asterisk.enabled {
        let section = &config.supervisors.asterisk;
        let (cell, hub) = cell_and_hub(
            DaemonKind::AsteriskAmi,
            "asterisk",
            format!("{}:{}", section.host, section.port),
        );
        let supervisor = Arc::new(AsteriskSupervisor::new(
            AmiConfig {
                host: section.host.clone(),
                port: section.port,
                username: section.username.clone(),
                secret: section.secret.clone(),
                manage_process: section.manage_process,
                ..AmiConfig::default()
            },
            cell.clone(),
            hub,
        ));
        background.push(supervisor.spawn_monitor(shutdown_rx.clone()));
        registry.register(supervisor.clone()).await;
        background.push(spawn_health_loop(
            supervisor,
            cell,
            HealthConfig::default(),
            shutdown_rx.clone(),
        ));
        if section.mandatory {
            mandatory.push(DaemonKind::AsteriskAmi);
        }
    }

    if config.supervisors.wireguard.enabled {
        let section = &config.supervisors.wireguard;
        let (cell, hub) = cell_and_hub(
            DaemonKind::WireGuard,
            "wireguard",
            section.interface.clone(),
        );
        let supervisor = Arc::new(WireGuardSupervisor::new(
            WireGuardConfig {
                interface: section.interface.clone(),
                listen_port: section.listen_port,
                address: section.address.clone(),
                endpoint: section.endpoint.clone(),
                dns: section.dns.clone(),
                config_path: section.config_path.clone(),
                private_key_path: section.private_key_path.clone(),
                ..WireGuardConfig::default()
            },
            vpn_store.clone(),
            cell.clone(),
            hub,
            clock.clone(),
        ));
        registry.register(supervisor.clone()).await;
        background.push(spawn_health_loop(
            supervisor,
            cell,
            HealthConfig::default(),
            shutdown_rx.clone(),
        ));
        if section.mandatory {
            mandatory.push(DaemonKind::WireGuard);
        }
    }

    if config.supervisors.openvpn.enabled {
        let section = &config.supervisors.openvpn;
        let (cell, hub) = cell_and_hub(
            DaemonKind::OpenVpn,
            "openvpn",
            format!("{}:{}", section.mgmt_host, section.mgmt_port),
        );
        let supervisor = Arc::new(OpenVpnSupervisor::new(
            OpenVpnConfig {
                manage_process: section.manage_process,
                mgmt_host: section.mgmt_host.clone(),
                mgmt_port: section.mgmt_port,
                ca_program: section.ca_program.clone(),
                ..OpenVpnConfig::default()
            },
            vpn_store.clone(),
            cell.clone(),
            hub,
            clock.clone(),
        ));
        registry.register(supervisor.clone()).await;
        background.push(spawn_health_loop(
            supervisor,
            cell,
            HealthConfig::default(),
            shutdown_rx.clone(),
        ));
        if section.mandatory {
            mandatory.push(DaemonKind::OpenVpn);
        }
    }

    if config.supervisors.pptp.enabled {
        let section = &config.supervisors.pptp;
        let (cell, hub) = cell_and_hub(DaemonKind::Pptp, "pptp", section.secrets_path.clone());
        let supervisor = Arc::new(ChapSupervisor::new(
            ChapSupervisorConfig {
                manage_process: section.manage_process,
                secrets_path: section.secrets_path.clone(),
                ..ChapSupervisorConfig::pptp()
            },
            vpn_store.clone(),
            cell.clone(),
            hub,
            clock.clone(),
        ));
        registry.register(supervisor.clone()).await;
        background.push(spawn_health_loop(
            supervisor,
            cell,
            HealthConfig::default(),
            shutdown_rx.clone(),
        ));
        if section.mandatory {
            mandatory.push(DaemonKind::Pptp);
        }
    }

    if config.supervisors.l2tp.enabled {
        let section = &config.supervisors.l2tp;
        let (cell, hub) = cell_and_hub(DaemonKind::L2tp, "l2tp", section.secrets_path.clone());
        let supervisor = Arc::new(ChapSupervisor::new(
            ChapSupervisorConfig {
                manage_process: section.manage_process,
                secrets_path: section.secrets_path.clone(),
                psk: Some(section.psk.clone()),
                ..ChapSupervisorConfig::l2tp()
            },
            vpn_store.clone(),
            cell.clone(),
            hub,
            clock.clone(),
        ));
        registry.register(supervisor.clone()).await;
        background.push(spawn_health_loop(
            supervisor,
            cell,
            HealthConfig::default(),
            shutdown_rx.clone(),
        ));
        if section.mandatory {
            mandatory.push(DaemonKind::L2tp);
        }
    }

    // Boot-start every enabled supervisor; mandatory failures abort.
    for supervisor in registry.all().await {
        let kind = supervisor.kind();
        match supervisor.start().await {
            Ok(()) => tracing::info!("supervisor {} started", kind.as_str()),
            Err(e) if mandatory.contains(&kind) => {
                tracing::error!("mandatory supervisor {} failed to start: {}", kind.as_str(), e);
                audit.shutdown(std::time::Duration::from_secs(5)).await;
                return 3;
            }
            Err(e) => {
                tracing::warn!("supervisor {} failed to start: {}", kind.as_str(), e);
            }
        }
    }

    // ── Background loops ─────────────────────────────────────────────
    background.push(spawn_sweeper(security.clone(), shutdown_rx.clone()));
    background.push(runtime::spawn_maintenance(
        security.clone(),
        auth.clone(),
        audit_store.clone(),
        config.audit.retention_days,
        clock.clone(),
        config.security.cleanup_mins * 60,
        shutdown_rx.clone(),
    ));
    let tasks = TaskStore::new(pool.clone());
    background.push(runtime::spawn_task_runner(
        tasks.clone(),
        security.clone(),
        auth.clone(),
        audit_store.clone(),
        config.audit.retention_days,
        registry.clone(),
        clock.clone(),
        shutdown_rx.clone(),
    ));
    let alerts = AlertStore::new(pool.clone());
    background.push(runtime::spawn_alert_evaluator(
        alerts.clone(),
        metrics.clone(),
        audit.clone(),
        shutdown_rx.clone(),
    ));

    // ── HTTP surface ─────────────────────────────────────────────────
    let state = AppState {
        clock: clock.clone(),
        metrics: metrics.clone(),
        audit: audit.clone(),
        audit_store,
        security,
        auth,
        registry: registry.clone(),
        samba: samba_handle,
        alerts,
        tasks,
        plugins: PluginStore::new(pool.clone()),
        groups: GroupStore::new(pool.clone()),
        rate_limiter: Arc::new(Default::default()),
        config: Arc::new(GatewayConfig {
            request_timeout_secs: config.gateway.request_timeout_secs,
            cors_origins: config.gateway.cors_origins.clone(),
            rate_limit_per_minute: config.gateway.rate_limit_per_minute,
        }),
        version: VERSION,
        started_at_ms: clock.now_millis(),
    };
    let router = build_router(state);

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("cannot bind {}: {}", bind_addr, e);
            return 1;
        }
    };
    tracing::info!("listening on {}", bind_addr);

    let serve = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    if let Err(e) = serve.await {
        tracing::error!("server error: {}", e);
    }

    // ── Shutdown ─────────────────────────────────────────────────────
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    for supervisor in registry.all().await {
        if let Err(e) = supervisor.stop().await {
            tracing::warn!("supervisor {} stop failed: {}", supervisor.kind().as_str(), e);
        }
    }
    // Join every background loop so an in-flight sweep or task tick
    // finishes (and its audit records are queued) before the sink drains
    // and the process exits.
    for mut task in background {
        if tokio::time::timeout(std::time::Duration::from_secs(5), &mut task)
            .await
            .is_err()
        {
            tracing::warn!("background task ignored the shutdown signal, aborting it");
            task.abort();
        }
    }
    audit.shutdown(std::time::Duration::from_secs(10)).await;
    tracing::info!("bye");
    0
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

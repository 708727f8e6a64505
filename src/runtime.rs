//! Background loops owned by the composition root: the maintenance
//! sweep, the scheduled-task runner, and the alert evaluator. All of
//! them stop cleanly on the shutdown signal.

use quay_audit::{AuditRecord, AuditSeverity, AuditSink, AuditStatus, AuditStore};
use quay_auth::AuthService;
use quay_core::{Clock, Metrics, MetricsSnapshot};
use quay_gateway::{AlertStore, TaskStore};
use quay_gateway::gateway::stores::TaskExecution;
use quay_security::FailedLoginService;
use quay_supervisor::{CommandRequest, Supervisor, SupervisorRegistry};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Periodic housekeeping: IP-block expiry, attempt retention, audit
/// retention, token expiry, pending-login expiry.
#[allow(clippy::too_many_arguments)]
pub fn spawn_maintenance(
    security: Arc<FailedLoginService>,
    auth: Arc<AuthService>,
    audit_store: AuditStore,
    audit_retention_days: u32,
    clock: Arc<dyn Clock>,
    cleanup_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(cleanup_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = security.sweep().await {
                log::error!("[maintenance] security sweep failed: {}", e);
            }
            if let Err(e) = auth.expire_housekeeping().await {
                log::error!("[maintenance] token housekeeping failed: {}", e);
            }
            let cutoff = clock.now_millis() - (audit_retention_days as i64) * 24 * 3600 * 1000;
            match audit_store.purge_older_than(cutoff).await {
                Ok(purged) if purged > 0 => {
                    log::info!("[maintenance] purged {} audit records", purged);
                }
                Ok(_) => {}
                Err(e) => log::error!("[maintenance] audit purge failed: {}", e),
            }
        }
    })
}

/// Run scheduled task definitions and immediate run requests.
#[allow(clippy::too_many_arguments)]
pub fn spawn_task_runner(
    tasks: TaskStore,
    security: Arc<FailedLoginService>,
    auth: Arc<AuthService>,
    audit_store: AuditStore,
    audit_retention_days: u32,
    registry: Arc<SupervisorRegistry>,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_run: HashMap<String, i64> = HashMap::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(30));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let defs = match tasks.list().await {
                Ok(defs) => defs,
                Err(e) => {
                    log::error!("[tasks] listing failed: {}", e);
                    continue;
                }
            };
            let now = clock.now_millis();
            for def in defs {
                if !def.enabled {
                    continue;
                }
                let due = last_run
                    .get(&def.id)
                    .map(|last| now - last >= def.schedule_secs * 1000)
                    .unwrap_or(true);
                let requested = matches!(
                    tasks.list_executions(&def.id, 1).await.as_deref(),
                    Ok([execution]) if execution.status == "requested"
                );
                if !due && !requested {
                    continue;
                }
                last_run.insert(def.id.clone(), now);

                let execution_id = if requested {
                    tasks
                        .list_executions(&def.id, 1)
                        .await
                        .ok()
                        .and_then(|mut v| v.pop())
                        .map(|e| e.id)
                        .unwrap_or_else(quay_core::new_id)
                } else {
                    quay_core::new_id()
                };
                let started_at = clock.now_millis();
                let output = run_task_kind(
                    &def.kind,
                    &security,
                    &auth,
                    &audit_store,
                    audit_retention_days,
                    &registry,
                    &clock,
                )
                .await;
                let (status, output) = match output {
                    Ok(output) => ("success".to_string(), output),
                    Err(output) => ("error".to_string(), output),
                };
                let record = TaskExecution {
                    id: execution_id,
                    task_id: def.id.clone(),
                    started_at,
                    finished_at: Some(clock.now_millis()),
                    status,
                    output,
                };
                if let Err(e) = tasks.record_execution(&record).await {
                    log::error!("[tasks] recording execution failed: {}", e);
                }
            }
        }
    })
}

async fn run_task_kind(
    kind: &str,
    security: &FailedLoginService,
    auth: &AuthService,
    audit_store: &AuditStore,
    audit_retention_days: u32,
    registry: &SupervisorRegistry,
    clock: &Arc<dyn Clock>,
) -> Result<String, String> {
    match kind {
        "security_sweep" => {
            let (expired, purged) = security.sweep().await.map_err(|e| e.to_string())?;
            let tokens = auth.expire_housekeeping().await.map_err(|e| e.to_string())?;
            Ok(format!(
                "retired {} blocks, purged {} attempts, purged {} tokens",
                expired, purged, tokens
            ))
        }
        "audit_purge" => {
            let cutoff = clock.now_millis() - (audit_retention_days as i64) * 24 * 3600 * 1000;
            let purged = audit_store
                .purge_older_than(cutoff)
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!("purged {} audit records", purged))
        }
        "vpn_sync" => {
            let mut synced = 0usize;
            for supervisor in registry.all().await {
                // Only the VPN kinds understand this action; others are
                // skipped by their own Unsupported error.
                match supervisor
                    .execute(CommandRequest::bare("connections"))
                    .await
                {
                    Ok(_) => synced += 1,
                    Err(e) => log::debug!(
                        "[tasks] vpn_sync skipped {}: {}",
                        supervisor.kind().as_str(),
                        e
                    ),
                }
            }
            Ok(format!("synced {} daemons", synced))
        }
        other => Err(format!("unknown task kind '{}'", other)),
    }
}

/// Compare alert rules to the metrics snapshot; audit on every breach
/// transition.
pub fn spawn_alert_evaluator(
    alerts: AlertStore,
    metrics: Arc<Metrics>,
    audit: AuditSink,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut breached: HashSet<String> = HashSet::new();
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let rules = match alerts.list().await {
                Ok(rules) => rules,
                Err(e) => {
                    log::error!("[alerts] listing failed: {}", e);
                    continue;
                }
            };
            let snapshot = metrics.snapshot();
            for rule in rules.iter().filter(|r| r.enabled) {
                let Some(value) = metric_value(&snapshot, &rule.metric) else {
                    continue;
                };
                let breach = match rule.op.as_str() {
                    "gt" => value > rule.threshold,
                    "lt" => value < rule.threshold,
                    _ => false,
                };
                let was_breached = breached.contains(&rule.id);
                if breach && !was_breached {
                    breached.insert(rule.id.clone());
                    let severity = AuditSeverity::parse(&rule.severity)
                        .unwrap_or(AuditSeverity::Warning);
                    log::warn!(
                        "[alerts] '{}' triggered: {} = {} (threshold {})",
                        rule.name,
                        rule.metric,
                        value,
                        rule.threshold
                    );
                    audit.log(
                        AuditRecord::new(
                            "alert.triggered",
                            format!("alert:{}", rule.id),
                            format!("Alert '{}' triggered", rule.name),
                        )
                        .with_status(AuditStatus::Failure)
                        .with_severity(severity)
                        .with_details(json!({
                            "metric": rule.metric,
                            "value": value,
                            "threshold": rule.threshold,
                            "op": rule.op,
                        })),
                    );
                } else if !breach && was_breached {
                    breached.remove(&rule.id);
                    audit.log(AuditRecord::new(
                        "alert.resolved",
                        format!("alert:{}", rule.id),
                        format!("Alert '{}' resolved", rule.name),
                    ));
                }
            }
        }
    })
}

fn metric_value(snapshot: &MetricsSnapshot, metric: &str) -> Option<i64> {
    let value = match metric {
        "http_requests_total" => snapshot.http_requests_total,
        "http_errors_total" => snapshot.http_errors_total,
        "login_success_total" => snapshot.login_success_total,
        "login_failure_total" => snapshot.login_failure_total,
        "ip_blocks_created_total" => snapshot.ip_blocks_created_total,
        "audit_dropped_total" => snapshot.audit_dropped_total,
        "events_dropped_total" => snapshot.events_dropped_total,
        "ws_connections_total" => snapshot.ws_connections_total,
        "supervisor_command_errors_total" => snapshot.supervisor_command_errors_total,
        _ => return None,
    };
    Some(value as i64)
}

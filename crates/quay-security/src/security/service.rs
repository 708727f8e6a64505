//! Failed-login service. The transitions live here.
//!
//! ```text
//! (no block) --count >= threshold in window--> active
//! active --expiry observed / admin unblock--> (no block)
//! active --admin mark-permanent--> active-permanent
//! active-permanent --admin unblock--> (no block)
//! ```

use crate::security::error::{SecurityError, SecurityResult};
use crate::security::store::SecurityStore;
use crate::security::types::*;
use quay_audit::{AuditRecord, AuditSeverity, AuditSink, AuditStatus};
use quay_core::{Clock, Metrics};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct FailedLoginService {
    store: SecurityStore,
    clock: Arc<dyn Clock>,
    audit: AuditSink,
    metrics: Arc<Metrics>,
    config: SecurityConfig,
}

impl FailedLoginService {
    pub fn new(
        store: SecurityStore,
        clock: Arc<dyn Clock>,
        audit: AuditSink,
        metrics: Arc<Metrics>,
        config: SecurityConfig,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            metrics,
            config,
        }
    }

    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Persist a failure, recount the window, and create a block on the
    /// threshold transition. Returns the block when this call created it.
    pub async fn record_failure(
        &self,
        username: &str,
        ip: &str,
        user_agent: Option<&str>,
        reason: &str,
    ) -> SecurityResult<Option<IpBlock>> {
        let now = self.clock.now_millis();
        Metrics::incr(&self.metrics.login_failure_total);

        self.store
            .insert_attempt(&FailedAttempt {
                id: quay_core::new_id(),
                username: username.to_string(),
                ip: ip.to_string(),
                user_agent: user_agent.map(str::to_string),
                reason: reason.to_string(),
                created_at: now,
                blocked: false,
                blocked_at: None,
            })
            .await?;

        let window_start = now - (self.config.window_secs as i64) * 1000;
        let count = self.store.count_attempts_since(ip, window_start).await?;
        if count < self.config.max_attempts as i64 {
            return Ok(None);
        }

        // Threshold crossed. The partial unique index makes this a
        // create-if-absent; losing the race means another request already
        // blocked the ip.
        let candidate = IpBlock {
            id: quay_core::new_id(),
            ip: ip.to_string(),
            reason: format!("{} failed attempts within window", count),
            attempt_count: count,
            created_at: now,
            expires_at: now + (self.config.block_secs as i64) * 1000,
            active: true,
            permanent: false,
        };
        let created = self.store.create_block_if_absent(&candidate).await?;
        let Some(block) = created else {
            return Ok(None);
        };

        self.store.mark_attempts_blocked(ip, now).await?;
        Metrics::incr(&self.metrics.ip_blocks_created_total);
        log::warn!(
            "[security] blocked ip {} after {} failures (expires in {}s)",
            ip,
            count,
            self.config.block_secs
        );
        self.audit.log(
            AuditRecord::new("security.ip_blocked", format!("ip:{}", ip), "IP blocked")
                .with_status(AuditStatus::Failure)
                .with_severity(AuditSeverity::Critical)
                .with_ip(ip)
                .with_details(json!({
                    "attempts": count,
                    "window_secs": self.config.window_secs,
                    "block_secs": self.config.block_secs,
                    "username": username,
                })),
        );
        Ok(Some(block))
    }

    /// Active block for `ip`, deactivating a lapsed one on observation.
    pub async fn is_blocked(&self, ip: &str) -> SecurityResult<Option<IpBlock>> {
        let Some(block) = self.store.active_block(ip).await? else {
            return Ok(None);
        };
        if block.permanent || block.expires_at > self.clock.now_millis() {
            return Ok(Some(block));
        }
        // Lapsed: the conditional update decides which observer retires it.
        self.store.deactivate_block(&block.id).await?;
        Ok(None)
    }

    /// Admin unblock; also lifts permanent blocks.
    pub async fn unblock(&self, ip: &str, actor: Option<&str>) -> SecurityResult<()> {
        let n = self.store.deactivate_blocks_for_ip(ip).await?;
        if n == 0 {
            return Err(SecurityError::not_found(format!("No active block for {}", ip)));
        }
        let mut record = AuditRecord::new(
            "security.ip_unblocked",
            format!("ip:{}", ip),
            "IP unblocked by administrator",
        )
        .with_ip(ip);
        if let Some(actor) = actor {
            record = record.with_principal(actor);
        }
        self.audit.log(record);
        Ok(())
    }

    /// Escalate the active block for `ip` to permanent.
    pub async fn mark_permanent(&self, ip: &str, actor: Option<&str>) -> SecurityResult<()> {
        if !self.store.mark_block_permanent(ip).await? {
            return Err(SecurityError::not_found(format!("No active block for {}", ip)));
        }
        let mut record = AuditRecord::new(
            "security.ip_block_permanent",
            format!("ip:{}", ip),
            "IP block made permanent",
        )
        .with_severity(AuditSeverity::Warning)
        .with_ip(ip);
        if let Some(actor) = actor {
            record = record.with_principal(actor);
        }
        self.audit.log(record);
        Ok(())
    }

    pub async fn list_attempts(&self, offset: i64, limit: i64) -> SecurityResult<Vec<FailedAttempt>> {
        self.store.list_attempts(offset, limit).await
    }

    pub async fn list_blocks(
        &self,
        active_only: bool,
        offset: i64,
        limit: i64,
    ) -> SecurityResult<Vec<IpBlock>> {
        self.store.list_blocks(active_only, offset, limit).await
    }

    /// One sweep pass: retire lapsed blocks, purge attempts past retention.
    pub async fn sweep(&self) -> SecurityResult<(u64, u64)> {
        let now = self.clock.now_millis();
        let expired = self.store.deactivate_expired(now).await?;
        let cutoff = now - (self.config.retention_days as i64) * 24 * 3600 * 1000;
        let purged = self.store.purge_attempts_before(cutoff).await?;
        if expired > 0 || purged > 0 {
            log::info!(
                "[security] sweep retired {} blocks, purged {} attempts",
                expired,
                purged
            );
        }
        Ok((expired, purged))
    }
}

/// Periodic sweep, stopped by the shutdown signal.
pub fn spawn_sweeper(
    service: Arc<FailedLoginService>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let period = Duration::from_secs(service.config.cleanup_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so boot stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = service.sweep().await {
                        log::error!("[security] sweep failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::error::SecurityErrorKind;
    use quay_audit::{AuditFilter, AuditStore, SinkConfig};
    use quay_core::ManualClock;
    use sqlx::sqlite::SqlitePoolOptions;
    use sqlx::SqlitePool;

    const T0: i64 = 1_700_000_000_000;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn service() -> (FailedLoginService, Arc<ManualClock>, AuditStore) {
        let pool = pool().await;
        let store = SecurityStore::new(pool.clone());
        store.ensure_schema().await.unwrap();
        let audit_store = AuditStore::new(pool);
        audit_store.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::at_millis(T0));
        let metrics = Arc::new(Metrics::new());
        let sink = AuditSink::spawn(
            audit_store.clone(),
            clock.clone(),
            metrics.clone(),
            SinkConfig::default(),
        );
        let svc = FailedLoginService::new(
            store,
            clock.clone(),
            sink,
            metrics,
            SecurityConfig {
                max_attempts: 3,
                window_secs: 300,
                block_secs: 600,
                cleanup_secs: 3600,
                retention_days: 30,
            },
        );
        (svc, clock, audit_store)
    }

    #[tokio::test]
    async fn below_threshold_no_block() {
        let (svc, _, _) = service().await;
        for _ in 0..2 {
            let created = svc
                .record_failure("alice", "203.0.113.7", None, "bad_password")
                .await
                .unwrap();
            assert!(created.is_none());
        }
        assert!(svc.is_blocked("203.0.113.7").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn threshold_creates_block_once() {
        let (svc, _, _) = service().await;
        let mut blocks = 0;
        for _ in 0..5 {
            if svc
                .record_failure("alice", "203.0.113.7", Some("curl"), "bad_password")
                .await
                .unwrap()
                .is_some()
            {
                blocks += 1;
            }
        }
        assert_eq!(blocks, 1);
        let block = svc.is_blocked("203.0.113.7").await.unwrap().unwrap();
        assert_eq!(block.expires_at, T0 + 600_000);
        assert!(!block.permanent);
        // Attempts got flagged.
        let attempts = svc.list_attempts(0, 10).await.unwrap();
        assert!(attempts.iter().filter(|a| a.blocked).count() >= 3);
    }

    #[tokio::test]
    async fn window_slides_by_timestamp() {
        let (svc, clock, _) = service().await;
        svc.record_failure("a", "10.0.0.1", None, "bad_password")
            .await
            .unwrap();
        svc.record_failure("a", "10.0.0.1", None, "bad_password")
            .await
            .unwrap();
        // Third failure lands after the first two left the window.
        clock.advance(chrono::Duration::seconds(301));
        let created = svc
            .record_failure("a", "10.0.0.1", None, "bad_password")
            .await
            .unwrap();
        assert!(created.is_none());
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn block_expires_lazily() {
        let (svc, clock, _) = service().await;
        for _ in 0..3 {
            svc.record_failure("a", "10.0.0.1", None, "bad_password")
                .await
                .unwrap();
        }
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_some());
        clock.advance(chrono::Duration::seconds(601));
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_none());
        // Observation retired the row for good.
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn permanent_block_survives_expiry() {
        let (svc, clock, _) = service().await;
        for _ in 0..3 {
            svc.record_failure("a", "10.0.0.1", None, "bad_password")
                .await
                .unwrap();
        }
        svc.mark_permanent("10.0.0.1", Some("admin")).await.unwrap();
        clock.advance(chrono::Duration::days(365));
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_some());
        svc.unblock("10.0.0.1", Some("admin")).await.unwrap();
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unblock_without_block_is_not_found() {
        let (svc, _, _) = service().await;
        let err = svc.unblock("10.9.9.9", None).await.unwrap_err();
        assert_eq!(err.kind, SecurityErrorKind::NotFound);
    }

    #[tokio::test]
    async fn block_transition_emits_critical_audit() {
        let (svc, _, audit_store) = service().await;
        for _ in 0..3 {
            svc.record_failure("alice", "203.0.113.7", None, "bad_password")
                .await
                .unwrap();
        }
        // Allow the sink writer to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let filter = AuditFilter {
            action_prefix: Some("security.ip_blocked".into()),
            ..Default::default()
        };
        let page = audit_store.query(&filter, 0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].severity, AuditSeverity::Critical);
        assert_eq!(page.records[0].ip.as_deref(), Some("203.0.113.7"));
    }

    #[tokio::test]
    async fn sweep_retires_and_purges() {
        let (svc, clock, _) = service().await;
        for _ in 0..3 {
            svc.record_failure("a", "10.0.0.1", None, "bad_password")
                .await
                .unwrap();
        }
        clock.advance(chrono::Duration::days(31));
        let (expired, purged) = svc.sweep().await.unwrap();
        assert_eq!(expired, 1);
        assert_eq!(purged, 3);
        assert!(svc.list_blocks(true, 0, 10).await.unwrap().is_empty());
        assert_eq!(svc.list_blocks(false, 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_ips_do_not_interfere() {
        let (svc, _, _) = service().await;
        for _ in 0..3 {
            svc.record_failure("a", "10.0.0.1", None, "bad_password")
                .await
                .unwrap();
        }
        svc.record_failure("a", "10.0.0.2", None, "bad_password")
            .await
            .unwrap();
        assert!(svc.is_blocked("10.0.0.1").await.unwrap().is_some());
        assert!(svc.is_blocked("10.0.0.2").await.unwrap().is_none());
    }
}

//! SQL persistence for audit records.

use crate::audit::error::AuditResult;
use crate::audit::types::*;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

/// Audit table access. Cheap to clone; wraps the shared pool.
#[derive(Clone)]
pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the audit tables when absent. Idempotent.
    pub async fn ensure_schema(&self) -> AuditResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_records (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                principal TEXT,
                action TEXT NOT NULL,
                resource TEXT NOT NULL,
                status TEXT NOT NULL,
                severity TEXT NOT NULL,
                ip TEXT,
                user_agent TEXT,
                message TEXT NOT NULL,
                details TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_ts ON audit_records(ts DESC, id DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_records(action)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert(&self, record: &AuditRecord) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO audit_records
                (id, ts, principal, action, resource, status, severity, ip, user_agent, message, details)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(record.timestamp)
        .bind(&record.principal)
        .bind(&record.action)
        .bind(&record.resource)
        .bind(record.status.as_str())
        .bind(record.severity.as_str())
        .bind(&record.ip)
        .bind(&record.user_agent)
        .bind(&record.message)
        .bind(record.details.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Filtered page, ordered `(ts DESC, id DESC)`, plus the unpaged total.
    pub async fn query(
        &self,
        filter: &AuditFilter,
        offset: i64,
        limit: i64,
    ) -> AuditResult<AuditPage> {
        let mut count_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) AS n FROM audit_records");
        push_filter(&mut count_qb, filter);
        let total: i64 = count_qb
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("n")
            .unwrap_or(0);

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, ts, principal, action, resource, status, severity, ip, user_agent, message, details
             FROM audit_records",
        );
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY ts DESC, id DESC LIMIT ");
        qb.push_bind(limit);
        qb.push(" OFFSET ");
        qb.push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        let records = rows.iter().map(row_to_record).collect();

        Ok(AuditPage {
            records,
            total,
            offset,
            limit,
        })
    }

    /// Synchronous aggregate view. `now_ms` anchors the 24 h window.
    pub async fn stats(&self, now_ms: i64) -> AuditResult<AuditStats> {
        let total: i64 = sqlx::query("SELECT COUNT(*) AS n FROM audit_records")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")
            .unwrap_or(0);

        let last_24h: i64 = sqlx::query("SELECT COUNT(*) AS n FROM audit_records WHERE ts >= ?")
            .bind(now_ms - 24 * 3600 * 1000)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")
            .unwrap_or(0);

        let by_severity = sqlx::query(
            "SELECT severity, COUNT(*) AS n FROM audit_records GROUP BY severity ORDER BY n DESC",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| (r.get::<String, _>("severity"), r.get::<i64, _>("n")))
        .collect();

        let top_actions = sqlx::query(
            "SELECT action, COUNT(*) AS n FROM audit_records GROUP BY action ORDER BY n DESC LIMIT 10",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| (r.get::<String, _>("action"), r.get::<i64, _>("n")))
        .collect();

        Ok(AuditStats {
            total,
            last_24h,
            by_severity,
            top_actions,
        })
    }

    /// Drop records older than the cutoff. Returns how many went away.
    pub async fn purge_older_than(&self, cutoff_ms: i64) -> AuditResult<u64> {
        let done = sqlx::query("DELETE FROM audit_records WHERE ts < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

fn push_filter(qb: &mut QueryBuilder<Sqlite>, filter: &AuditFilter) {
    let mut sep = " WHERE ";
    if let Some(username) = &filter.username {
        qb.push(sep).push("principal = ").push_bind(username.clone());
        sep = " AND ";
    }
    if let Some(prefix) = &filter.action_prefix {
        qb.push(sep)
            .push("action LIKE ")
            .push_bind(format!("{}%", prefix));
        sep = " AND ";
    }
    if let Some(status) = filter.status {
        qb.push(sep).push("status = ").push_bind(status.as_str());
        sep = " AND ";
    }
    if let Some(severity) = filter.severity {
        qb.push(sep)
            .push("severity = ")
            .push_bind(severity.as_str());
        sep = " AND ";
    }
    if let Some(from) = filter.from {
        qb.push(sep).push("ts >= ").push_bind(from);
        sep = " AND ";
    }
    if let Some(to) = filter.to {
        qb.push(sep).push("ts < ").push_bind(to);
    }
}

fn row_to_record(row: &SqliteRow) -> AuditRecord {
    let details_raw: String = row.get("details");
    AuditRecord {
        id: row.get("id"),
        timestamp: row.get("ts"),
        principal: row.get("principal"),
        action: row.get("action"),
        resource: row.get("resource"),
        status: AuditStatus::parse(&row.get::<String, _>("status")).unwrap_or(AuditStatus::Error),
        severity: AuditSeverity::parse(&row.get::<String, _>("severity"))
            .unwrap_or(AuditSeverity::Info),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        message: row.get("message"),
        details: serde_json::from_str(&details_raw).unwrap_or(serde_json::Value::Null),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> AuditStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = AuditStore::new(pool);
        store.ensure_schema().await.unwrap();
        store
    }

    fn rec(ts: i64, action: &str, severity: AuditSeverity) -> AuditRecord {
        let mut r = AuditRecord::new(action, "r", "m").with_severity(severity);
        r.timestamp = ts;
        r
    }

    #[tokio::test]
    async fn insert_and_query_all() {
        let s = store().await;
        s.insert(&rec(1000, "auth.login.success", AuditSeverity::Info))
            .await
            .unwrap();
        s.insert(&rec(2000, "auth.login.failed", AuditSeverity::Warning))
            .await
            .unwrap();
        let page = s.query(&AuditFilter::default(), 0, 50).await.unwrap();
        assert_eq!(page.total, 2);
        // Newest first.
        assert_eq!(page.records[0].action, "auth.login.failed");
    }

    #[tokio::test]
    async fn filter_by_action_prefix() {
        let s = store().await;
        s.insert(&rec(1, "auth.login.failed", AuditSeverity::Info))
            .await
            .unwrap();
        s.insert(&rec(2, "vpn.peer.create", AuditSeverity::Info))
            .await
            .unwrap();
        let filter = AuditFilter {
            action_prefix: Some("auth.".into()),
            ..Default::default()
        };
        let page = s.query(&filter, 0, 50).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].action, "auth.login.failed");
    }

    #[tokio::test]
    async fn filter_by_severity_and_range() {
        let s = store().await;
        s.insert(&rec(1000, "a.b", AuditSeverity::Critical))
            .await
            .unwrap();
        s.insert(&rec(2000, "a.c", AuditSeverity::Critical))
            .await
            .unwrap();
        s.insert(&rec(3000, "a.d", AuditSeverity::Info))
            .await
            .unwrap();
        let filter = AuditFilter {
            severity: Some(AuditSeverity::Critical),
            from: Some(1500),
            to: Some(2500),
            ..Default::default()
        };
        let page = s.query(&filter, 0, 50).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.records[0].action, "a.c");
    }

    #[tokio::test]
    async fn filter_by_username() {
        let s = store().await;
        s.insert(
            &rec(1, "auth.login.success", AuditSeverity::Info).with_principal("alice"),
        )
        .await
        .unwrap();
        s.insert(&rec(2, "auth.login.success", AuditSeverity::Info).with_principal("bob"))
            .await
            .unwrap();
        let filter = AuditFilter {
            username: Some("alice".into()),
            ..Default::default()
        };
        assert_eq!(s.query(&filter, 0, 50).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn pagination_is_stable() {
        let s = store().await;
        for i in 0..10 {
            s.insert(&rec(1000 + i, "a.b", AuditSeverity::Info))
                .await
                .unwrap();
        }
        let p1 = s.query(&AuditFilter::default(), 0, 3).await.unwrap();
        let p2 = s.query(&AuditFilter::default(), 3, 3).await.unwrap();
        assert_eq!(p1.records.len(), 3);
        assert_eq!(p2.records.len(), 3);
        assert!(p1.records[2].timestamp > p2.records[0].timestamp);
        assert_eq!(p1.total, 10);
    }

    #[tokio::test]
    async fn details_round_trip() {
        let s = store().await;
        let mut r = rec(5, "vpn.peer.create", AuditSeverity::Info);
        r.details = json!({"peer": "wg-7", "keys": [1, 2]});
        s.insert(&r).await.unwrap();
        let page = s.query(&AuditFilter::default(), 0, 1).await.unwrap();
        assert_eq!(page.records[0].details["peer"], "wg-7");
    }

    #[tokio::test]
    async fn stats_shape() {
        let s = store().await;
        let now = 100_000_000;
        s.insert(&rec(now - 1000, "a.b", AuditSeverity::Critical))
            .await
            .unwrap();
        s.insert(&rec(now - (25 * 3600 * 1000), "a.b", AuditSeverity::Info))
            .await
            .unwrap();
        let stats = s.stats(now).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.last_24h, 1);
        assert_eq!(stats.top_actions[0].0, "a.b");
        assert_eq!(stats.top_actions[0].1, 2);
    }

    #[tokio::test]
    async fn purge_by_cutoff() {
        let s = store().await;
        s.insert(&rec(1000, "a", AuditSeverity::Info)).await.unwrap();
        s.insert(&rec(9000, "b", AuditSeverity::Info)).await.unwrap();
        let purged = s.purge_older_than(5000).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(s.query(&AuditFilter::default(), 0, 10).await.unwrap().total, 1);
    }
}

//! SQL persistence for failed attempts and IP blocks.
//!
//! Block creation is serialised by a partial unique index (one active row
//! per ip) plus `INSERT OR IGNORE`; lazy deactivation is a conditional
//! `UPDATE` keyed on `active = 1`, so two observers of the same expired
//! block cannot both claim the transition.

use crate::security::error::SecurityResult;
use crate::security::types::*;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct SecurityStore {
    pool: SqlitePool,
}

impl SecurityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> SecurityResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS failed_attempts (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL,
                ip TEXT NOT NULL,
                user_agent TEXT,
                reason TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                blocked INTEGER NOT NULL DEFAULT 0,
                blocked_at INTEGER
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_attempts_ip_ts ON failed_attempts(ip, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ip_blocks (
                id TEXT PRIMARY KEY,
                ip TEXT NOT NULL,
                reason TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                permanent INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_blocks_one_active
             ON ip_blocks(ip) WHERE active = 1",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Failed attempts ──────────────────────────────────────────────

    pub async fn insert_attempt(&self, attempt: &FailedAttempt) -> SecurityResult<()> {
        sqlx::query(
            "INSERT INTO failed_attempts
                (id, username, ip, user_agent, reason, created_at, blocked, blocked_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attempt.id)
        .bind(&attempt.username)
        .bind(&attempt.ip)
        .bind(&attempt.user_agent)
        .bind(&attempt.reason)
        .bind(attempt.created_at)
        .bind(attempt.blocked as i64)
        .bind(attempt.blocked_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Attempts from `ip` at or after `since_ms` (the sliding window).
    pub async fn count_attempts_since(&self, ip: &str, since_ms: i64) -> SecurityResult<i64> {
        let n = sqlx::query(
            "SELECT COUNT(*) AS n FROM failed_attempts WHERE ip = ? AND created_at >= ?",
        )
        .bind(ip)
        .bind(since_ms)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")
        .unwrap_or(0);
        Ok(n)
    }

    /// Flag every unflagged attempt from `ip` as counted into a block.
    pub async fn mark_attempts_blocked(&self, ip: &str, now_ms: i64) -> SecurityResult<u64> {
        let done = sqlx::query(
            "UPDATE failed_attempts SET blocked = 1, blocked_at = ? WHERE ip = ? AND blocked = 0",
        )
        .bind(now_ms)
        .bind(ip)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn list_attempts(&self, offset: i64, limit: i64) -> SecurityResult<Vec<FailedAttempt>> {
        let rows = sqlx::query(
            "SELECT id, username, ip, user_agent, reason, created_at, blocked, blocked_at
             FROM failed_attempts ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_attempt).collect())
    }

    pub async fn purge_attempts_before(&self, cutoff_ms: i64) -> SecurityResult<u64> {
        let done = sqlx::query("DELETE FROM failed_attempts WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    // ── IP blocks ────────────────────────────────────────────────────

    /// Create a block unless an active one already exists for this ip.
    /// Returns the created block, or `None` when the partial unique index
    /// rejected the insert (a concurrent caller won).
    pub async fn create_block_if_absent(&self, block: &IpBlock) -> SecurityResult<Option<IpBlock>> {
        let done = sqlx::query(
            "INSERT OR IGNORE INTO ip_blocks
                (id, ip, reason, attempt_count, created_at, expires_at, active, permanent)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&block.id)
        .bind(&block.ip)
        .bind(&block.reason)
        .bind(block.attempt_count)
        .bind(block.created_at)
        .bind(block.expires_at)
        .bind(block.permanent as i64)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            Ok(Some(block.clone()))
        } else {
            Ok(None)
        }
    }

    pub async fn active_block(&self, ip: &str) -> SecurityResult<Option<IpBlock>> {
        let row = sqlx::query(
            "SELECT id, ip, reason, attempt_count, created_at, expires_at, active, permanent
             FROM ip_blocks WHERE ip = ? AND active = 1 LIMIT 1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_block))
    }

    /// Conditional deactivation; only one caller wins the transition.
    pub async fn deactivate_block(&self, id: &str) -> SecurityResult<bool> {
        let done = sqlx::query("UPDATE ip_blocks SET active = 0 WHERE id = ? AND active = 1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn deactivate_blocks_for_ip(&self, ip: &str) -> SecurityResult<u64> {
        let done = sqlx::query("UPDATE ip_blocks SET active = 0 WHERE ip = ? AND active = 1")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    pub async fn mark_block_permanent(&self, ip: &str) -> SecurityResult<bool> {
        let done = sqlx::query("UPDATE ip_blocks SET permanent = 1 WHERE ip = ? AND active = 1")
            .bind(ip)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() >= 1)
    }

    pub async fn list_blocks(
        &self,
        active_only: bool,
        offset: i64,
        limit: i64,
    ) -> SecurityResult<Vec<IpBlock>> {
        let sql = if active_only {
            "SELECT id, ip, reason, attempt_count, created_at, expires_at, active, permanent
             FROM ip_blocks WHERE active = 1 ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        } else {
            "SELECT id, ip, reason, attempt_count, created_at, expires_at, active, permanent
             FROM ip_blocks ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?"
        };
        let rows = sqlx::query(sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_block).collect())
    }

    /// Deactivate every lapsed non-permanent block.
    pub async fn deactivate_expired(&self, now_ms: i64) -> SecurityResult<u64> {
        let done = sqlx::query(
            "UPDATE ip_blocks SET active = 0
             WHERE active = 1 AND permanent = 0 AND expires_at <= ?",
        )
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}

fn row_to_attempt(row: &SqliteRow) -> FailedAttempt {
    FailedAttempt {
        id: row.get("id"),
        username: row.get("username"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        reason: row.get("reason"),
        created_at: row.get("created_at"),
        blocked: row.get::<i64, _>("blocked") != 0,
        blocked_at: row.get("blocked_at"),
    }
}

fn row_to_block(row: &SqliteRow) -> IpBlock {
    IpBlock {
        id: row.get("id"),
        ip: row.get("ip"),
        reason: row.get("reason"),
        attempt_count: row.get("attempt_count"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        active: row.get::<i64, _>("active") != 0,
        permanent: row.get::<i64, _>("permanent") != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn store() -> SecurityStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let s = SecurityStore::new(pool);
        s.ensure_schema().await.unwrap();
        s
    }

    fn attempt(ip: &str, ts: i64) -> FailedAttempt {
        FailedAttempt {
            id: quay_core::new_id(),
            username: "alice".into(),
            ip: ip.into(),
            user_agent: None,
            reason: "bad_password".into(),
            created_at: ts,
            blocked: false,
            blocked_at: None,
        }
    }

    fn block(ip: &str, expires: i64) -> IpBlock {
        IpBlock {
            id: quay_core::new_id(),
            ip: ip.into(),
            reason: "too many failures".into(),
            attempt_count: 5,
            created_at: 0,
            expires_at: expires,
            active: true,
            permanent: false,
        }
    }

    #[tokio::test]
    async fn window_count_excludes_older() {
        let s = store().await;
        s.insert_attempt(&attempt("10.0.0.1", 1000)).await.unwrap();
        s.insert_attempt(&attempt("10.0.0.1", 2000)).await.unwrap();
        s.insert_attempt(&attempt("10.0.0.1", 9000)).await.unwrap();
        s.insert_attempt(&attempt("10.0.0.2", 9000)).await.unwrap();
        assert_eq!(s.count_attempts_since("10.0.0.1", 1500).await.unwrap(), 2);
        assert_eq!(s.count_attempts_since("10.0.0.1", 0).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn create_block_if_absent_is_single_shot() {
        let s = store().await;
        let first = s.create_block_if_absent(&block("10.0.0.1", 99)).await.unwrap();
        assert!(first.is_some());
        let second = s.create_block_if_absent(&block("10.0.0.1", 99)).await.unwrap();
        assert!(second.is_none());
        // A different ip is unaffected.
        assert!(s
            .create_block_if_absent(&block("10.0.0.2", 99))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn deactivated_block_allows_new_one() {
        let s = store().await;
        let b = s
            .create_block_if_absent(&block("10.0.0.1", 99))
            .await
            .unwrap()
            .unwrap();
        assert!(s.deactivate_block(&b.id).await.unwrap());
        // Conditional update only fires once.
        assert!(!s.deactivate_block(&b.id).await.unwrap());
        assert!(s
            .create_block_if_absent(&block("10.0.0.1", 200))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn mark_attempts_blocked_flags_unflagged_only() {
        let s = store().await;
        s.insert_attempt(&attempt("10.0.0.1", 1)).await.unwrap();
        s.insert_attempt(&attempt("10.0.0.1", 2)).await.unwrap();
        assert_eq!(s.mark_attempts_blocked("10.0.0.1", 10).await.unwrap(), 2);
        assert_eq!(s.mark_attempts_blocked("10.0.0.1", 10).await.unwrap(), 0);
        let attempts = s.list_attempts(0, 10).await.unwrap();
        assert!(attempts.iter().all(|a| a.blocked && a.blocked_at == Some(10)));
    }

    #[tokio::test]
    async fn deactivate_expired_skips_permanent() {
        let s = store().await;
        s.create_block_if_absent(&block("10.0.0.1", 100)).await.unwrap();
        let mut perm = block("10.0.0.2", 100);
        perm.permanent = true;
        s.create_block_if_absent(&perm).await.unwrap();
        assert_eq!(s.deactivate_expired(500).await.unwrap(), 1);
        assert!(s.active_block("10.0.0.1").await.unwrap().is_none());
        assert!(s.active_block("10.0.0.2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purge_attempts() {
        let s = store().await;
        s.insert_attempt(&attempt("10.0.0.1", 100)).await.unwrap();
        s.insert_attempt(&attempt("10.0.0.1", 900)).await.unwrap();
        assert_eq!(s.purge_attempts_before(500).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn mark_permanent_requires_active_block() {
        let s = store().await;
        assert!(!s.mark_block_permanent("10.0.0.9").await.unwrap());
        s.create_block_if_absent(&block("10.0.0.9", 50)).await.unwrap();
        assert!(s.mark_block_permanent("10.0.0.9").await.unwrap());
        let b = s.active_block("10.0.0.9").await.unwrap().unwrap();
        assert!(b.permanent);
    }
}

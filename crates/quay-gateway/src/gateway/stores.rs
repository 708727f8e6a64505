//! Gateway-owned configuration stores: alert rules, scheduled tasks, and
//! the plugin registry.

// The audit error doubles as the generic store error here; the gateway
// folds both into 500s the same way.
use quay_audit::AuditResult;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

// ── Alerts ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    /// Metric counter the rule watches.
    pub metric: String,
    /// Comparison operator: `gt` or `lt`.
    pub op: String,
    pub threshold: i64,
    pub severity: String,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct AlertStore {
    pool: SqlitePool,
}

impl AlertStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> AuditResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS alert_rules (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                metric TEXT NOT NULL,
                op TEXT NOT NULL,
                threshold INTEGER NOT NULL,
                severity TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, rule: &AlertRule) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO alert_rules (id, name, metric, op, threshold, severity, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.id)
        .bind(&rule.name)
        .bind(&rule.metric)
        .bind(&rule.op)
        .bind(rule.threshold)
        .bind(&rule.severity)
        .bind(rule.enabled as i64)
        .bind(rule.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> AuditResult<Vec<AlertRule>> {
        let rows = sqlx::query("SELECT * FROM alert_rules ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_alert).collect())
    }

    pub async fn update(&self, rule: &AlertRule) -> AuditResult<bool> {
        let done = sqlx::query(
            "UPDATE alert_rules SET name = ?, metric = ?, op = ?, threshold = ?, severity = ?, enabled = ?
             WHERE id = ?",
        )
        .bind(&rule.name)
        .bind(&rule.metric)
        .bind(&rule.op)
        .bind(rule.threshold)
        .bind(&rule.severity)
        .bind(rule.enabled as i64)
        .bind(&rule.id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> AuditResult<bool> {
        let done = sqlx::query("DELETE FROM alert_rules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }
}

fn row_to_alert(row: &SqliteRow) -> AlertRule {
    AlertRule {
        id: row.get("id"),
        name: row.get("name"),
        metric: row.get("metric"),
        op: row.get("op"),
        threshold: row.get("threshold"),
        severity: row.get("severity"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: row.get("created_at"),
    }
}

// ── Scheduled tasks ──────────────────────────────────────────────────

/// What a task definition runs.
pub const TASK_KINDS: [&str; 3] = ["security_sweep", "audit_purge", "vpn_sync"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDef {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub schedule_secs: i64,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub status: String,
    pub output: String,
}

#[derive(Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> AuditResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_defs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                schedule_secs INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS task_executions (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER,
                status TEXT NOT NULL,
                output TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, def: &TaskDef) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO task_defs (id, name, kind, schedule_secs, enabled, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&def.id)
        .bind(&def.name)
        .bind(&def.kind)
        .bind(def.schedule_secs)
        .bind(def.enabled as i64)
        .bind(def.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> AuditResult<Vec<TaskDef>> {
        let rows = sqlx::query("SELECT * FROM task_defs ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    pub async fn get(&self, id: &str) -> AuditResult<Option<TaskDef>> {
        let row = sqlx::query("SELECT * FROM task_defs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_task))
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> AuditResult<bool> {
        let done = sqlx::query("UPDATE task_defs SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> AuditResult<bool> {
        let done = sqlx::query("DELETE FROM task_defs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn record_execution(&self, execution: &TaskExecution) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO task_executions (id, task_id, started_at, finished_at, status, output)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                finished_at = excluded.finished_at,
                status = excluded.status,
                output = excluded.output",
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(execution.started_at)
        .bind(execution.finished_at)
        .bind(&execution.status)
        .bind(&execution.output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_executions(&self, task_id: &str, limit: i64) -> AuditResult<Vec<TaskExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM task_executions WHERE task_id = ?
             ORDER BY started_at DESC, id DESC LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| TaskExecution {
                id: row.get("id"),
                task_id: row.get("task_id"),
                started_at: row.get("started_at"),
                finished_at: row.get("finished_at"),
                status: row.get("status"),
                output: row.get("output"),
            })
            .collect())
    }
}

fn row_to_task(row: &SqliteRow) -> TaskDef {
    TaskDef {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("kind"),
        schedule_secs: row.get("schedule_secs"),
        enabled: row.get::<i64, _>("enabled") != 0,
        created_at: row.get("created_at"),
    }
}

// ── Plugins ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginEntry {
    pub id: String,
    pub name: String,
    pub version: String,
    pub enabled: bool,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct PluginStore {
    pool: SqlitePool,
}

impl PluginStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> AuditResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS plugins (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                version TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list(&self) -> AuditResult<Vec<PluginEntry>> {
        let rows = sqlx::query("SELECT * FROM plugins ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| PluginEntry {
                id: row.get("id"),
                name: row.get("name"),
                version: row.get("version"),
                enabled: row.get::<i64, _>("enabled") != 0,
                created_at: row.get("created_at"),
            })
            .collect())
    }

    pub async fn register(&self, entry: &PluginEntry) -> AuditResult<()> {
        sqlx::query(
            "INSERT INTO plugins (id, name, version, enabled, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET version = excluded.version",
        )
        .bind(&entry.id)
        .bind(&entry.name)
        .bind(&entry.version)
        .bind(entry.enabled as i64)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> AuditResult<bool> {
        let done = sqlx::query("UPDATE plugins SET enabled = ? WHERE id = ?")
            .bind(enabled as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn remove(&self, id: &str) -> AuditResult<bool> {
        let done = sqlx::query("DELETE FROM plugins WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }
}

// ── Groups ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEntry {
    pub id: String,
    pub name: String,
    pub member_ids: Vec<i64>,
    pub created_at: i64,
}

#[derive(Clone)]
pub struct GroupStore {
    pool: SqlitePool,
}

impl GroupStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> AuditResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS groups (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                member_ids TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert(&self, group: &GroupEntry) -> AuditResult<bool> {
        let members = serde_json::to_string(&group.member_ids).unwrap_or_else(|_| "[]".into());
        let result = sqlx::query(
            "INSERT INTO groups (id, name, member_ids, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&group.id)
        .bind(&group.name)
        .bind(members)
        .bind(group.created_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> AuditResult<Vec<GroupEntry>> {
        let rows = sqlx::query("SELECT * FROM groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_group).collect())
    }

    pub async fn get(&self, id: &str) -> AuditResult<Option<GroupEntry>> {
        let row = sqlx::query("SELECT * FROM groups WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_group))
    }

    pub async fn set_members(&self, id: &str, member_ids: &[i64]) -> AuditResult<bool> {
        let members = serde_json::to_string(member_ids).unwrap_or_else(|_| "[]".into());
        let done = sqlx::query("UPDATE groups SET member_ids = ? WHERE id = ?")
            .bind(members)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn delete(&self, id: &str) -> AuditResult<bool> {
        let done = sqlx::query("DELETE FROM groups WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }
}

fn row_to_group(row: &SqliteRow) -> GroupEntry {
    let members_raw: String = row.get("member_ids");
    GroupEntry {
        id: row.get("id"),
        name: row.get("name"),
        member_ids: serde_json::from_str(&members_raw).unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn alert_crud() {
        let store = AlertStore::new(pool().await);
        store.ensure_schema().await.unwrap();
        let mut rule = AlertRule {
            id: quay_core::new_id(),
            name: "too many failures".into(),
            metric: "login_failure_total".into(),
            op: "gt".into(),
            threshold: 100,
            severity: "warning".into(),
            enabled: true,
            created_at: 1,
        };
        store.insert(&rule).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
        rule.threshold = 200;
        assert!(store.update(&rule).await.unwrap());
        assert_eq!(store.list().await.unwrap()[0].threshold, 200);
        assert!(store.delete(&rule.id).await.unwrap());
        assert!(!store.delete(&rule.id).await.unwrap());
    }

    #[tokio::test]
    async fn task_defs_and_executions() {
        let store = TaskStore::new(pool().await);
        store.ensure_schema().await.unwrap();
        let def = TaskDef {
            id: quay_core::new_id(),
            name: "nightly sweep".into(),
            kind: "security_sweep".into(),
            schedule_secs: 3600,
            enabled: true,
            created_at: 1,
        };
        store.insert(&def).await.unwrap();
        assert!(store.get(&def.id).await.unwrap().is_some());

        let mut execution = TaskExecution {
            id: quay_core::new_id(),
            task_id: def.id.clone(),
            started_at: 10,
            finished_at: None,
            status: "running".into(),
            output: String::new(),
        };
        store.record_execution(&execution).await.unwrap();
        execution.finished_at = Some(20);
        execution.status = "success".into();
        execution.output = "retired 3 blocks".into();
        store.record_execution(&execution).await.unwrap();

        let executions = store.list_executions(&def.id, 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, "success");
        assert_eq!(executions[0].finished_at, Some(20));
    }

    #[tokio::test]
    async fn group_crud() {
        let store = GroupStore::new(pool().await);
        store.ensure_schema().await.unwrap();
        let group = GroupEntry {
            id: quay_core::new_id(),
            name: "media-admins".into(),
            member_ids: vec![1, 2],
            created_at: 1,
        };
        assert!(store.insert(&group).await.unwrap());
        // Duplicate name is reported, not an error.
        let mut dup = group.clone();
        dup.id = quay_core::new_id();
        assert!(!store.insert(&dup).await.unwrap());

        assert!(store.set_members(&group.id, &[1, 2, 3]).await.unwrap());
        let fetched = store.get(&group.id).await.unwrap().unwrap();
        assert_eq!(fetched.member_ids, vec![1, 2, 3]);
        assert!(store.delete(&group.id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn plugin_registry() {
        let store = PluginStore::new(pool().await);
        store.ensure_schema().await.unwrap();
        let entry = PluginEntry {
            id: quay_core::new_id(),
            name: "media-indexer".into(),
            version: "1.2.0".into(),
            enabled: false,
            created_at: 1,
        };
        store.register(&entry).await.unwrap();
        assert!(store.set_enabled(&entry.id, true).await.unwrap());
        let listed = store.list().await.unwrap();
        assert!(listed[0].enabled);
        assert!(store.remove(&entry.id).await.unwrap());
    }
}

//! Principal and backup-code persistence.

use crate::auth::error::{AuthError, AuthResult};
use crate::auth::types::*;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

#[derive(Clone)]
pub struct PrincipalStore {
    pool: SqlitePool,
}

impl PrincipalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> AuthResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS principals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                role TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                totp_state TEXT NOT NULL DEFAULT 'disabled',
                totp_secret_enc TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backup_codes (
                id TEXT PRIMARY KEY,
                principal_id INTEGER NOT NULL,
                code_hash TEXT NOT NULL,
                consumed INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_backup_principal ON backup_codes(principal_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Principals ───────────────────────────────────────────────────

    pub async fn create(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
        role: Role,
        now_ms: i64,
    ) -> AuthResult<Principal> {
        let result = sqlx::query(
            "INSERT INTO principals
                (username, email, password_hash, role, enabled, totp_state, created_at, updated_at)
             VALUES (?, ?, ?, ?, 1, 'disabled', ?, ?)",
        )
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .bind(role.as_str())
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await;

        let done = match result {
            Ok(done) => done,
            Err(sqlx::Error::Database(db)) if db.message().contains("UNIQUE") => {
                return Err(AuthError::conflict(format!(
                    "Username '{}' already exists",
                    username
                )));
            }
            Err(e) => return Err(e.into()),
        };

        self.get_by_id(done.last_insert_rowid())
            .await?
            .ok_or_else(|| AuthError::database("Created principal vanished"))
    }

    pub async fn get_by_id(&self, id: i64) -> AuthResult<Option<Principal>> {
        let row = sqlx::query("SELECT * FROM principals WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_principal))
    }

    pub async fn get_by_username(&self, username: &str) -> AuthResult<Option<Principal>> {
        let row = sqlx::query("SELECT * FROM principals WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_principal))
    }

    pub async fn list(&self, offset: i64, limit: i64) -> AuthResult<Vec<Principal>> {
        let rows = sqlx::query("SELECT * FROM principals ORDER BY id LIMIT ? OFFSET ?")
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_principal).collect())
    }

    pub async fn count(&self) -> AuthResult<i64> {
        let n = sqlx::query("SELECT COUNT(*) AS n FROM principals")
            .fetch_one(&self.pool)
            .await?
            .try_get("n")
            .unwrap_or(0);
        Ok(n)
    }

    pub async fn update_profile(
        &self,
        id: i64,
        email: Option<&str>,
        role: Option<Role>,
        enabled: Option<bool>,
        now_ms: i64,
    ) -> AuthResult<Principal> {
        let current = self
            .get_by_id(id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("Principal {} not found", id)))?;
        let email = email.unwrap_or(&current.email);
        let role = role.unwrap_or(current.role);
        let enabled = enabled.unwrap_or(current.enabled);
        sqlx::query(
            "UPDATE principals SET email = ?, role = ?, enabled = ?, updated_at = ? WHERE id = ?",
        )
        .bind(email)
        .bind(role.as_str())
        .bind(enabled as i64)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        self.get_by_id(id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("Principal {} not found", id)))
    }

    pub async fn set_password(&self, id: i64, password_hash: &str, now_ms: i64) -> AuthResult<()> {
        let done = sqlx::query(
            "UPDATE principals SET password_hash = ?, updated_at = ? WHERE id = ?",
        )
        .bind(password_hash)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(AuthError::not_found(format!("Principal {} not found", id)));
        }
        Ok(())
    }

    pub async fn delete(&self, id: i64) -> AuthResult<()> {
        let done = sqlx::query("DELETE FROM principals WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if done.rows_affected() == 0 {
            return Err(AuthError::not_found(format!("Principal {} not found", id)));
        }
        sqlx::query("DELETE FROM backup_codes WHERE principal_id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Second factor ────────────────────────────────────────────────

    pub async fn set_totp(
        &self,
        id: i64,
        state: TwoFactorState,
        secret_enc: Option<&str>,
        now_ms: i64,
    ) -> AuthResult<()> {
        let done = sqlx::query(
            "UPDATE principals SET totp_state = ?, totp_secret_enc = ?, updated_at = ? WHERE id = ?",
        )
        .bind(state.as_str())
        .bind(secret_enc)
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(AuthError::not_found(format!("Principal {} not found", id)));
        }
        Ok(())
    }

    /// Replace the full backup-code set (regeneration and initial issue).
    pub async fn replace_backup_codes(
        &self,
        principal_id: i64,
        code_hashes: &[String],
        now_ms: i64,
    ) -> AuthResult<()> {
        sqlx::query("DELETE FROM backup_codes WHERE principal_id = ?")
            .bind(principal_id)
            .execute(&self.pool)
            .await?;
        for hash in code_hashes {
            sqlx::query(
                "INSERT INTO backup_codes (id, principal_id, code_hash, consumed, created_at)
                 VALUES (?, ?, ?, 0, ?)",
            )
            .bind(quay_core::new_id())
            .bind(principal_id)
            .bind(hash)
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Mark one matching unconsumed code as used. The conditional UPDATE
    /// makes each code strictly single-use.
    pub async fn consume_backup_code(
        &self,
        principal_id: i64,
        code_hash: &str,
    ) -> AuthResult<bool> {
        let done = sqlx::query(
            "UPDATE backup_codes SET consumed = 1
             WHERE principal_id = ? AND code_hash = ? AND consumed = 0",
        )
        .bind(principal_id)
        .bind(code_hash)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn unconsumed_backup_count(&self, principal_id: i64) -> AuthResult<i64> {
        let n = sqlx::query(
            "SELECT COUNT(*) AS n FROM backup_codes WHERE principal_id = ? AND consumed = 0",
        )
        .bind(principal_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("n")
        .unwrap_or(0);
        Ok(n)
    }
}

fn row_to_principal(row: &SqliteRow) -> Principal {
    Principal {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: Role::parse(&row.get::<String, _>("role")).unwrap_or(Role::User),
        enabled: row.get::<i64, _>("enabled") != 0,
        totp_state: TwoFactorState::parse(&row.get::<String, _>("totp_state"))
            .unwrap_or(TwoFactorState::Disabled),
        totp_secret_enc: row.get("totp_secret_enc"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

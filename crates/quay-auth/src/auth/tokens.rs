//! Session tokens.
//!
//! Access tokens are stateless JWTs checked against the injected clock;
//! refresh tokens are opaque server-side rows that rotate on use. The
//! rotation is a conditional UPDATE, so a concurrent second refresh with
//! the same old token loses cleanly.

use crate::auth::error::{AuthError, AuthResult};
use crate::auth::types::{Principal, Role};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use quay_core::Clock;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

/// Access-token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal id.
    pub sub: i64,
    pub username: String,
    pub role: Role,
    /// Issued at, unix seconds.
    pub iat: i64,
    /// Expiry, unix seconds.
    pub exp: i64,
}

/// Stateless JWT issue/verify.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl_secs: i64,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(jwt_secret: &str, access_ttl_secs: i64, clock: Arc<dyn Clock>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(jwt_secret.as_bytes()),
            access_ttl_secs,
            clock,
        }
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.access_ttl_secs
    }

    pub fn issue_access(&self, principal: &Principal) -> AuthResult<String> {
        let now = self.clock.now().timestamp();
        let claims = Claims {
            sub: principal.id,
            username: principal.username.clone(),
            role: principal.role,
            iat: now,
            exp: now + self.access_ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::crypto("Token signing failed").with_detail(e.to_string()))
    }

    /// Signature check plus an expiry check against the injected clock.
    pub fn verify_access(&self, token: &str) -> AuthResult<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        validation.required_spec_claims.clear();
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| AuthError::unauthorized("Invalid access token"))?;
        if data.claims.exp <= self.clock.now().timestamp() {
            return Err(AuthError::unauthorized("Access token expired"));
        }
        Ok(data.claims)
    }
}

/// Server-side refresh-token rows.
#[derive(Clone)]
pub struct RefreshStore {
    pool: SqlitePool,
}

impl RefreshStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> AuthResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS refresh_tokens (
                token TEXT PRIMARY KEY,
                principal_id INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                revoked INTEGER NOT NULL DEFAULT 0
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_refresh_principal ON refresh_tokens(principal_id)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn issue(
        &self,
        principal_id: i64,
        now_ms: i64,
        ttl_secs: i64,
    ) -> AuthResult<String> {
        let token = quay_core::random_token(32);
        sqlx::query(
            "INSERT INTO refresh_tokens (token, principal_id, created_at, expires_at, revoked)
             VALUES (?, ?, ?, ?, 0)",
        )
        .bind(&token)
        .bind(principal_id)
        .bind(now_ms)
        .bind(now_ms + ttl_secs * 1000)
        .execute(&self.pool)
        .await?;
        Ok(token)
    }

    /// Revoke-on-use. Returns the bound principal when this caller won the
    /// swap; `None` when the token is unknown, expired, or already used.
    pub async fn consume(&self, token: &str, now_ms: i64) -> AuthResult<Option<i64>> {
        let row = sqlx::query(
            "SELECT principal_id, expires_at FROM refresh_tokens WHERE token = ? AND revoked = 0",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.get::<i64, _>("expires_at") <= now_ms {
            return Ok(None);
        }
        // Linearisation point: exactly one concurrent caller flips the row.
        let done = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1 WHERE token = ? AND revoked = 0",
        )
        .bind(token)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 1 {
            Ok(Some(row.get("principal_id")))
        } else {
            Ok(None)
        }
    }

    pub async fn revoke(&self, token: &str) -> AuthResult<bool> {
        let done = sqlx::query("UPDATE refresh_tokens SET revoked = 1 WHERE token = ? AND revoked = 0")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() == 1)
    }

    pub async fn revoke_all_for_principal(&self, principal_id: i64) -> AuthResult<u64> {
        let done = sqlx::query(
            "UPDATE refresh_tokens SET revoked = 1 WHERE principal_id = ? AND revoked = 0",
        )
        .bind(principal_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    pub async fn purge_expired(&self, now_ms: i64) -> AuthResult<u64> {
        let done = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ? OR revoked = 1")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }
}

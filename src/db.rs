//! Database connection and idempotent schema bootstrap.
//!
//! Production schema migration is owned by the platform installer; the
//! bootstrap here only creates missing tables so a fresh install and the
//! test suite can run against an empty file.

use quay_audit::AuditStore;
use quay_auth::{PrincipalStore, RefreshStore};
use quay_gateway::{AlertStore, GroupStore, PluginStore, TaskStore};
use quay_security::SecurityStore;
use quay_vpn::VpnStore;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database unreachable at {path}: {source}")]
    Unreachable { path: String, source: sqlx::Error },
    #[error("schema bootstrap failed: {0}")]
    Bootstrap(String),
}

pub async fn connect(path: &str) -> Result<SqlitePool, DbError> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
        .map_err(|source| DbError::Unreachable {
            path: path.to_string(),
            source,
        })?
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|source| DbError::Unreachable {
            path: path.to_string(),
            source,
        })
}

/// Create any missing tables. Safe to run on every boot.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<(), DbError> {
    AuditStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    SecurityStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    PrincipalStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    RefreshStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    VpnStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    AlertStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    TaskStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    PluginStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    GroupStore::new(pool.clone())
        .ensure_schema()
        .await
        .map_err(|e| DbError::Bootstrap(e.to_string()))?;
    Ok(())
}

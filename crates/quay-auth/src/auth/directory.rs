//! Directory-service (LDAP / Active Directory) bind fallback.
//!
//! One fresh connection per authentication, service bind, filtered search
//! with the username escaped, rebind as the found entry, deterministic
//! unbind on every exit path. Settings hot-swap through `update_config`,
//! which takes the write side of the lock.

use crate::auth::crypto::SecretBox;
use crate::auth::error::{AuthError, AuthResult};
use ldap3::{ldap_escape, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use tokio::sync::RwLock;

/// `userAccountControl` bit for a disabled account.
const ACCOUNTDISABLE: u32 = 0x2;

/// Directory settings. The bind password is stored sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub base_dn: String,
    pub bind_dn: String,
    /// AES-GCM envelope; never exposed through the API.
    pub bind_password_enc: String,
    /// Search filter template; `{username}` is replaced with the escaped
    /// login name.
    pub user_filter: String,
    pub group_filter: String,
    pub use_tls: bool,
    pub skip_verify: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: String::new(),
            port: 389,
            base_dn: String::new(),
            bind_dn: String::new(),
            bind_password_enc: String::new(),
            user_filter: "(&(objectClass=user)(sAMAccountName={username}))".into(),
            group_filter: "(&(objectClass=group)(member={dn}))".into(),
            use_tls: false,
            skip_verify: false,
        }
    }
}

impl DirectoryConfig {
    pub fn url(&self) -> String {
        let scheme = if self.use_tls { "ldaps" } else { "ldap" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A directory entry that authenticated successfully.
#[derive(Debug, Clone, Serialize)]
pub struct DirectoryUser {
    pub dn: String,
    pub username: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Escape one value for embedding in an LDAP search filter (RFC 4515).
pub fn escape_filter_value(value: &str) -> String {
    ldap_escape(value).into_owned()
}

/// Substitute the escaped username into the filter template.
pub fn render_user_filter(template: &str, username: &str) -> String {
    template.replace("{username}", &escape_filter_value(username))
}

/// Bitmask test against `ACCOUNTDISABLE`. A missing attribute means the
/// server has no such concept (plain LDAP) and the account counts as
/// enabled.
pub fn account_enabled(user_account_control: Option<&str>) -> bool {
    match user_account_control.and_then(|v| v.trim().parse::<u32>().ok()) {
        Some(uac) => uac & ACCOUNTDISABLE == 0,
        None => true,
    }
}

pub struct DirectoryService {
    config: RwLock<DirectoryConfig>,
    secrets: SecretBox,
    pool: SqlitePool,
    op_timeout: Duration,
}

impl DirectoryService {
    /// Load persisted settings (or defaults) and build the service.
    pub async fn load(pool: SqlitePool, secrets: SecretBox) -> AuthResult<Self> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS directory_config (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                config TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        let row = sqlx::query("SELECT config FROM directory_config WHERE id = 1")
            .fetch_optional(&pool)
            .await?;
        let config = match row {
            Some(row) => serde_json::from_str(&row.get::<String, _>("config"))
                .unwrap_or_default(),
            None => DirectoryConfig::default(),
        };
        Ok(Self {
            config: RwLock::new(config),
            secrets,
            pool,
            op_timeout: Duration::from_secs(10),
        })
    }

    pub async fn is_enabled(&self) -> bool {
        self.config.read().await.enabled
    }

    pub async fn snapshot(&self) -> DirectoryConfig {
        self.config.read().await.clone()
    }

    /// Swap settings under the write lock and persist them. A plaintext
    /// bind password, when supplied, is sealed before it lands anywhere.
    pub async fn update_config(
        &self,
        mut new_config: DirectoryConfig,
        bind_password: Option<&str>,
    ) -> AuthResult<()> {
        let mut guard = self.config.write().await;
        match bind_password {
            Some(plain) => new_config.bind_password_enc = self.secrets.seal(plain)?,
            None => new_config.bind_password_enc = guard.bind_password_enc.clone(),
        }
        let json = serde_json::to_string(&new_config)
            .map_err(|e| AuthError::database("Config serialise failed").with_detail(e.to_string()))?;
        sqlx::query(
            "INSERT INTO directory_config (id, config) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET config = excluded.config",
        )
        .bind(json)
        .execute(&self.pool)
        .await?;
        *guard = new_config;
        log::info!("[directory] configuration updated");
        Ok(())
    }

    /// Service-account bind only; used by the settings test button.
    pub async fn test_bind(&self) -> AuthResult<()> {
        let config = self.snapshot().await;
        if config.host.is_empty() {
            return Err(AuthError::validation("Directory host not configured"));
        }
        let bind_password = self.secrets.open(&config.bind_password_enc)?;
        let mut ldap = self.connect(&config).await?;
        let result = tokio::time::timeout(
            self.op_timeout,
            ldap.simple_bind(&config.bind_dn, &bind_password),
        )
        .await
        .map_err(|_| AuthError::directory("Directory bind timed out"))
        .and_then(|r| r.map_err(AuthError::from))
        .and_then(|r| {
            r.success()
                .map(|_| ())
                .map_err(|e| AuthError::directory("Service bind rejected").with_detail(e.to_string()))
        });
        let _ = ldap.unbind().await;
        result
    }

    /// Full directory authentication.
    ///
    /// `Ok(Some(user))`: credentials accepted. `Ok(None)`: directory
    /// reachable but the credentials were rejected (unknown, ambiguous,
    /// disabled, or wrong password). `Err`: directory unavailable.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> AuthResult<Option<DirectoryUser>> {
        // An empty password would turn the rebind into an anonymous bind,
        // which many servers accept.
        if password.is_empty() {
            return Ok(None);
        }
        let config = self.snapshot().await;
        if !config.enabled {
            return Ok(None);
        }
        let bind_password = self.secrets.open(&config.bind_password_enc)?;
        let mut ldap = self.connect(&config).await?;
        let result = self
            .authenticate_inner(&mut ldap, &config, &bind_password, username, password)
            .await;
        let _ = ldap.unbind().await;
        result
    }

    async fn connect(&self, config: &DirectoryConfig) -> AuthResult<ldap3::Ldap> {
        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.op_timeout)
            .set_no_tls_verify(config.skip_verify);
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &config.url())
            .await
            .map_err(|e| {
                AuthError::directory(format!("Cannot reach directory at {}", config.url()))
                    .with_detail(e.to_string())
            })?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    async fn authenticate_inner(
        &self,
        ldap: &mut ldap3::Ldap,
        config: &DirectoryConfig,
        bind_password: &str,
        username: &str,
        password: &str,
    ) -> AuthResult<Option<DirectoryUser>> {
        tokio::time::timeout(
            self.op_timeout,
            ldap.simple_bind(&config.bind_dn, bind_password),
        )
        .await
        .map_err(|_| AuthError::directory("Directory bind timed out"))??
        .success()
        .map_err(|e| AuthError::directory("Service bind rejected").with_detail(e.to_string()))?;

        let filter = render_user_filter(&config.user_filter, username);
        let (entries, _res) = tokio::time::timeout(
            self.op_timeout,
            ldap.search(
                &config.base_dn,
                Scope::Subtree,
                &filter,
                vec!["mail", "displayName", "userAccountControl"],
            ),
        )
        .await
        .map_err(|_| AuthError::directory("Directory search timed out"))??
        .success()
        .map_err(|e| AuthError::directory("Directory search failed").with_detail(e.to_string()))?;

        // Exactly one match or the login does not exist here.
        if entries.len() != 1 {
            if entries.len() > 1 {
                log::warn!(
                    "[directory] filter for '{}' matched {} entries, rejecting",
                    username,
                    entries.len()
                );
            }
            return Ok(None);
        }
        let entry = SearchEntry::construct(entries.into_iter().next().expect("one entry"));

        let uac = entry
            .attrs
            .get("userAccountControl")
            .and_then(|v| v.first())
            .map(String::as_str);
        if !account_enabled(uac) {
            log::info!("[directory] account '{}' is disabled upstream", username);
            return Ok(None);
        }

        // Rebind as the entry to check the supplied password.
        let bound = tokio::time::timeout(self.op_timeout, ldap.simple_bind(&entry.dn, password))
            .await
            .map_err(|_| AuthError::directory("Directory rebind timed out"))??;
        if bound.success().is_err() {
            return Ok(None);
        }

        let attr = |name: &str| entry.attrs.get(name).and_then(|v| v.first()).cloned();
        Ok(Some(DirectoryUser {
            dn: entry.dn.clone(),
            username: username.to_string(),
            email: attr("mail"),
            display_name: attr("displayName"),
        }))
    }
}

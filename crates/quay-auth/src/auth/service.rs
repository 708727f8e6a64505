//! Login orchestration.
//!
//! The ordering here is a contract: the IP gate runs first, failed
//! attempts are recorded and awaited before any response leaves, and the
//! whole verify sequence runs under a constant timing floor so an
//! attacker cannot tell a missing user from a wrong password.

use crate::auth::crypto::SecretBox;
use crate::auth::directory::DirectoryService;
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::password;
use crate::auth::store::PrincipalStore;
use crate::auth::tokens::{Claims, RefreshStore, TokenService};
use crate::auth::totp;
use crate::auth::types::*;
use quay_audit::{AuditRecord, AuditSeverity, AuditSink, AuditStatus};
use quay_core::{Clock, Metrics};
use quay_security::FailedLoginService;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Short-lived credential between password and second factor.
#[derive(Debug, Clone)]
struct PendingLogin {
    principal_id: i64,
    expires_at_ms: i64,
}

pub struct AuthService {
    principals: PrincipalStore,
    refresh: RefreshStore,
    tokens: TokenService,
    directory: Arc<DirectoryService>,
    failed_logins: Arc<FailedLoginService>,
    audit: AuditSink,
    metrics: Arc<Metrics>,
    clock: Arc<dyn Clock>,
    secrets: SecretBox,
    config: AuthConfig,
    pending: Mutex<HashMap<String, PendingLogin>>,
    /// Valid bcrypt verifier that matches nothing; the dummy path burns
    /// the same work factor as a real verification.
    dummy_hash: String,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        principals: PrincipalStore,
        refresh: RefreshStore,
        directory: Arc<DirectoryService>,
        failed_logins: Arc<FailedLoginService>,
        audit: AuditSink,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
    ) -> AuthResult<Self> {
        let tokens = TokenService::new(&config.jwt_secret, config.access_ttl_secs, clock.clone());
        let secrets = SecretBox::new(&config.jwt_secret);
        let dummy_hash = password::unusable_hash()?;
        Ok(Self {
            principals,
            refresh,
            tokens,
            directory,
            failed_logins,
            audit,
            metrics,
            clock,
            secrets,
            config,
            pending: Mutex::new(HashMap::new()),
            dummy_hash,
        })
    }

    pub fn principals(&self) -> &PrincipalStore {
        &self.principals
    }

    pub fn directory(&self) -> &Arc<DirectoryService> {
        &self.directory
    }

    pub fn access_ttl_secs(&self) -> i64 {
        self.config.access_ttl_secs
    }

    // ── Login ────────────────────────────────────────────────────────

    pub async fn login(
        &self,
        username: &str,
        password_input: &str,
        ip: &str,
        user_agent: Option<&str>,
    ) -> AuthResult<LoginOutcome> {
        // 1. IP gate. Runs before any credential work.
        if let Some(block) = self
            .failed_logins
            .is_blocked(ip)
            .await
            .map_err(|e| AuthError::database("Block check failed").with_detail(e.to_string()))?
        {
            self.record_failure(username, ip, user_agent, "ip_blocked").await;
            return Ok(LoginOutcome::Failure {
                reason: FailureReason::Blocked,
                retry_after_secs: Some(block.retry_after_secs(self.clock.now_millis())),
            });
        }

        let started = Instant::now();
        let outcome = self
            .login_inner(username, password_input, ip, user_agent)
            .await;
        // Constant floor over lookup + verify, dummy path included.
        self.apply_floor(started).await;
        outcome
    }

    async fn login_inner(
        &self,
        username: &str,
        password_input: &str,
        ip: &str,
        user_agent: Option<&str>,
    ) -> AuthResult<LoginOutcome> {
        // 2. Lookup, with directory fallback for unknown names.
        let principal = match self.principals.get_by_username(username).await? {
            Some(principal) => principal,
            None => {
                return self
                    .login_via_directory(username, password_input, ip, user_agent)
                    .await;
            }
        };

        // 3. Disabled principals never authenticate.
        if !principal.enabled {
            self.record_failure(username, ip, user_agent, "disabled").await;
            return Ok(LoginOutcome::failure(FailureReason::Disabled));
        }

        // 4. Verifier check on the blocking pool.
        if !self
            .verify_blocking(password_input, &principal.password_hash)
            .await?
        {
            self.record_failure(username, ip, user_agent, "bad_password").await;
            self.audit.log(
                AuditRecord::new(
                    "auth.login.failed",
                    format!("principal:{}", principal.id),
                    "Wrong password",
                )
                .with_status(AuditStatus::Failure)
                .with_severity(AuditSeverity::Warning)
                .with_principal(&principal.username)
                .with_ip(ip),
            );
            return Ok(LoginOutcome::failure(FailureReason::BadPassword));
        }

        // 5. Second factor gate: no refresh token yet.
        if principal.totp_state == TwoFactorState::Enrolled {
            let pending_token = self.issue_pending(principal.id).await;
            return Ok(LoginOutcome::RequiresTwoFactor {
                pending_token,
                principal_id: principal.id,
            });
        }

        // 6. Done.
        self.finish_login(&principal, ip, "local").await
    }

    async fn login_via_directory(
        &self,
        username: &str,
        password_input: &str,
        ip: &str,
        user_agent: Option<&str>,
    ) -> AuthResult<LoginOutcome> {
        if !self.directory.is_enabled().await {
            // Dummy verification keeps the unknown-user path at the same
            // cost as a real one.
            let _ = self.verify_blocking(password_input, &self.dummy_hash).await?;
            self.record_failure(username, ip, user_agent, "unknown_user").await;
            return Ok(LoginOutcome::failure(FailureReason::UnknownUser));
        }

        match self.directory.authenticate(username, password_input).await {
            Err(e) => {
                log::error!("[auth] directory unavailable for '{}': {}", username, e);
                self.record_failure(username, ip, user_agent, "directory_unavailable")
                    .await;
                self.audit.log(
                    AuditRecord::new("auth.login.failed", format!("user:{}", username), "Directory unavailable")
                        .with_status(AuditStatus::Error)
                        .with_severity(AuditSeverity::Warning)
                        .with_ip(ip),
                );
                Ok(LoginOutcome::failure(FailureReason::DirectoryUnavailable))
            }
            Ok(None) => {
                let _ = self.verify_blocking(password_input, &self.dummy_hash).await?;
                self.record_failure(username, ip, user_agent, "unknown_user").await;
                Ok(LoginOutcome::failure(FailureReason::UnknownUser))
            }
            Ok(Some(dir_user)) => {
                // First directory login provisions a local principal with
                // an unusable verifier; the directory stays authoritative.
                let principal = match self.principals.get_by_username(username).await? {
                    Some(p) => p,
                    None => {
                        let noise = quay_core::random_token(33);
                        let hash = self.hash_blocking(&noise).await?;
                        self.principals
                            .create(
                                username,
                                dir_user.email.as_deref().unwrap_or(""),
                                &hash,
                                Role::User,
                                self.clock.now_millis(),
                            )
                            .await?
                    }
                };
                if !principal.enabled {
                    self.record_failure(username, ip, user_agent, "disabled").await;
                    return Ok(LoginOutcome::failure(FailureReason::Disabled));
                }
                self.finish_login(&principal, ip, "ldap").await
            }
        }
    }

    async fn finish_login(
        &self,
        principal: &Principal,
        ip: &str,
        source: &str,
    ) -> AuthResult<LoginOutcome> {
        let tokens = self.issue_pair(principal).await?;
        Metrics::incr(&self.metrics.login_success_total);
        self.audit.log(
            AuditRecord::new(
                "auth.login.success",
                format!("principal:{}", principal.id),
                "Login succeeded",
            )
            .with_principal(&principal.username)
            .with_ip(ip)
            .with_details(json!({ "source": source })),
        );
        Ok(LoginOutcome::Success {
            tokens,
            principal: principal.to_info(),
        })
    }

    // ── Second factor ────────────────────────────────────────────────

    pub async fn verify_2fa(
        &self,
        pending_token: &str,
        code: &str,
        is_backup_code: bool,
        ip: &str,
        user_agent: Option<&str>,
    ) -> AuthResult<LoginOutcome> {
        if let Some(block) = self
            .failed_logins
            .is_blocked(ip)
            .await
            .map_err(|e| AuthError::database("Block check failed").with_detail(e.to_string()))?
        {
            return Ok(LoginOutcome::Failure {
                reason: FailureReason::Blocked,
                retry_after_secs: Some(block.retry_after_secs(self.clock.now_millis())),
            });
        }

        let now_ms = self.clock.now_millis();
        let principal_id = {
            let pending = self.pending.lock().await;
            match pending.get(pending_token) {
                Some(p) if p.expires_at_ms > now_ms => p.principal_id,
                _ => {
                    drop(pending);
                    self.record_failure("", ip, user_agent, "pending_token_invalid").await;
                    return Ok(LoginOutcome::failure(FailureReason::PendingTokenInvalid));
                }
            }
        };

        let principal = self
            .principals
            .get_by_id(principal_id)
            .await?
            .filter(|p| p.enabled)
            .ok_or_else(|| AuthError::unauthorized("Principal no longer valid"))?;

        let (matched, method) = if is_backup_code {
            let hash = totp::hash_backup_code(code);
            (
                self.principals.consume_backup_code(principal.id, &hash).await?,
                "backup_code",
            )
        } else {
            let secret_enc = principal
                .totp_secret_enc
                .as_deref()
                .ok_or_else(|| AuthError::unauthorized("No second factor enrolled"))?;
            let secret = self.secrets.open(secret_enc)?;
            let unix = (now_ms / 1000) as u64;
            (totp::verify_at(&secret, code, unix)?, "totp")
        };

        if !matched {
            // Same block budget as password failures; the pending token's
            // expiry is deliberately not extended or shortened here.
            self.record_failure(&principal.username, ip, user_agent, "bad_2fa_code").await;
            self.audit.log(
                AuditRecord::new(
                    "auth.2fa.failed",
                    format!("principal:{}", principal.id),
                    "Second factor rejected",
                )
                .with_status(AuditStatus::Failure)
                .with_severity(AuditSeverity::Warning)
                .with_principal(&principal.username)
                .with_ip(ip)
                .with_details(json!({ "method": method })),
            );
            return Ok(LoginOutcome::failure(FailureReason::BadTwoFactorCode));
        }

        // Single-use: the token dies on success.
        self.pending.lock().await.remove(pending_token);

        let tokens = self.issue_pair(&principal).await?;
        Metrics::incr(&self.metrics.login_success_total);
        self.audit.log(
            AuditRecord::new(
                "auth.login.success",
                format!("principal:{}", principal.id),
                "Login succeeded with second factor",
            )
            .with_principal(&principal.username)
            .with_ip(ip)
            .with_details(json!({ "source": "local", "method": method })),
        );
        Ok(LoginOutcome::Success {
            tokens,
            principal: principal.to_info(),
        })
    }

    // ── Tokens ───────────────────────────────────────────────────────

    /// Rotate a refresh token. The conditional revoke makes this a
    /// linearisable swap: one of two concurrent callers fails.
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<(TokenPair, PrincipalInfo)> {
        let now_ms = self.clock.now_millis();
        let principal_id = self
            .refresh
            .consume(refresh_token, now_ms)
            .await?
            .ok_or_else(|| AuthError::unauthorized("Refresh token invalid"))?;
        let principal = self
            .principals
            .get_by_id(principal_id)
            .await?
            .filter(|p| p.enabled)
            .ok_or_else(|| AuthError::unauthorized("Principal no longer valid"))?;
        let tokens = self.issue_pair(&principal).await?;
        self.audit.log(
            AuditRecord::new(
                "auth.token.refresh",
                format!("principal:{}", principal.id),
                "Refresh token rotated",
            )
            .with_principal(&principal.username),
        );
        Ok((tokens, principal.to_info()))
    }

    pub async fn logout(&self, refresh_token: &str) -> AuthResult<()> {
        if self.refresh.revoke(refresh_token).await? {
            self.audit.log(AuditRecord::new(
                "auth.logout",
                "session",
                "Refresh token revoked",
            ));
        }
        Ok(())
    }

    pub fn verify_access(&self, token: &str) -> AuthResult<Claims> {
        self.tokens.verify_access(token)
    }

    async fn issue_pair(&self, principal: &Principal) -> AuthResult<TokenPair> {
        let access_token = self.tokens.issue_access(principal)?;
        let refresh_token = self
            .refresh
            .issue(
                principal.id,
                self.clock.now_millis(),
                self.config.refresh_ttl_secs,
            )
            .await?;
        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_in: self.config.access_ttl_secs,
        })
    }

    async fn issue_pending(&self, principal_id: i64) -> String {
        let token = quay_core::random_token(32);
        let expires_at_ms = self.clock.now_millis() + self.config.pending_ttl_secs * 1000;
        self.pending.lock().await.insert(
            token.clone(),
            PendingLogin {
                principal_id,
                expires_at_ms,
            },
        );
        token
    }

    // ── 2FA management ───────────────────────────────────────────────

    /// Issue a fresh secret and backup codes; state goes to pending until
    /// the first code confirms the authenticator.
    pub async fn twofactor_setup(&self, principal_id: i64) -> AuthResult<TwoFactorSetup> {
        let principal = self.require_principal(principal_id).await?;
        let secret = totp::generate_secret();
        let sealed = self.secrets.seal(&secret)?;
        let now_ms = self.clock.now_millis();
        self.principals
            .set_totp(principal.id, TwoFactorState::PendingSetup, Some(&sealed), now_ms)
            .await?;
        let codes = totp::generate_backup_codes(self.config.backup_code_count);
        let hashes: Vec<String> = codes.iter().map(|c| totp::hash_backup_code(c)).collect();
        self.principals
            .replace_backup_codes(principal.id, &hashes, now_ms)
            .await?;
        self.audit.log(
            AuditRecord::new(
                "auth.2fa.setup",
                format!("principal:{}", principal.id),
                "Second factor setup started",
            )
            .with_principal(&principal.username),
        );
        Ok(TwoFactorSetup {
            otpauth_uri: totp::otpauth_uri(&principal.username, &secret),
            secret,
            backup_codes: codes,
        })
    }

    /// Confirm the authenticator with one valid code; state → enrolled.
    pub async fn twofactor_confirm(&self, principal_id: i64, code: &str) -> AuthResult<()> {
        let principal = self.require_principal(principal_id).await?;
        if principal.totp_state != TwoFactorState::PendingSetup {
            return Err(AuthError::validation("No second-factor setup in progress"));
        }
        let secret_enc = principal
            .totp_secret_enc
            .as_deref()
            .ok_or_else(|| AuthError::validation("No second-factor secret issued"))?;
        let secret = self.secrets.open(secret_enc)?;
        let unix = (self.clock.now_millis() / 1000) as u64;
        if !totp::verify_at(&secret, code, unix)? {
            return Err(AuthError::unauthorized("Confirmation code rejected"));
        }
        self.principals
            .set_totp(
                principal.id,
                TwoFactorState::Enrolled,
                Some(secret_enc),
                self.clock.now_millis(),
            )
            .await?;
        self.audit.log(
            AuditRecord::new(
                "auth.2fa.enrolled",
                format!("principal:{}", principal.id),
                "Second factor enrolled",
            )
            .with_principal(&principal.username),
        );
        Ok(())
    }

    /// Disable the second factor; requires the account password again.
    pub async fn twofactor_disable(&self, principal_id: i64, password_input: &str) -> AuthResult<()> {
        let principal = self.require_principal(principal_id).await?;
        if !self
            .verify_blocking(password_input, &principal.password_hash)
            .await?
        {
            return Err(AuthError::unauthorized("Password rejected"));
        }
        let now_ms = self.clock.now_millis();
        self.principals
            .set_totp(principal.id, TwoFactorState::Disabled, None, now_ms)
            .await?;
        self.principals
            .replace_backup_codes(principal.id, &[], now_ms)
            .await?;
        self.audit.log(
            AuditRecord::new(
                "auth.2fa.disabled",
                format!("principal:{}", principal.id),
                "Second factor disabled",
            )
            .with_principal(&principal.username)
            .with_severity(AuditSeverity::Warning),
        );
        Ok(())
    }

    pub async fn regenerate_backup_codes(&self, principal_id: i64) -> AuthResult<Vec<String>> {
        let principal = self.require_principal(principal_id).await?;
        if principal.totp_state == TwoFactorState::Disabled {
            return Err(AuthError::validation("Second factor is not enrolled"));
        }
        let codes = totp::generate_backup_codes(self.config.backup_code_count);
        let hashes: Vec<String> = codes.iter().map(|c| totp::hash_backup_code(c)).collect();
        self.principals
            .replace_backup_codes(principal.id, &hashes, self.clock.now_millis())
            .await?;
        self.audit.log(
            AuditRecord::new(
                "auth.2fa.backup_codes_regenerated",
                format!("principal:{}", principal.id),
                "Backup codes regenerated",
            )
            .with_principal(&principal.username),
        );
        Ok(codes)
    }

    // ── Principal administration ─────────────────────────────────────

    pub async fn create_principal(
        &self,
        username: &str,
        email: &str,
        password_input: &str,
        role: Role,
        actor: Option<&str>,
    ) -> AuthResult<PrincipalInfo> {
        validate_username(username)?;
        if password_input.len() < 8 {
            return Err(AuthError::validation("Password must be at least 8 characters"));
        }
        let hash = self.hash_blocking(password_input).await?;
        let principal = self
            .principals
            .create(username, email, &hash, role, self.clock.now_millis())
            .await?;
        let mut record = AuditRecord::new(
            "user.created",
            format!("principal:{}", principal.id),
            format!("User '{}' created", username),
        );
        if let Some(actor) = actor {
            record = record.with_principal(actor);
        }
        self.audit.log(record);
        Ok(principal.to_info())
    }

    pub async fn update_principal(
        &self,
        id: i64,
        email: Option<&str>,
        role: Option<Role>,
        enabled: Option<bool>,
        actor: Option<&str>,
    ) -> AuthResult<PrincipalInfo> {
        let updated = self
            .principals
            .update_profile(id, email, role, enabled, self.clock.now_millis())
            .await?;
        if enabled == Some(false) {
            // Disabling cuts every session loose at next refresh.
            self.refresh.revoke_all_for_principal(id).await?;
        }
        let mut record = AuditRecord::new(
            "user.updated",
            format!("principal:{}", id),
            format!("User '{}' updated", updated.username),
        );
        if let Some(actor) = actor {
            record = record.with_principal(actor);
        }
        self.audit.log(record);
        Ok(updated.to_info())
    }

    pub async fn set_principal_password(
        &self,
        id: i64,
        password_input: &str,
        actor: Option<&str>,
    ) -> AuthResult<()> {
        if password_input.len() < 8 {
            return Err(AuthError::validation("Password must be at least 8 characters"));
        }
        let hash = self.hash_blocking(password_input).await?;
        self.principals
            .set_password(id, &hash, self.clock.now_millis())
            .await?;
        self.refresh.revoke_all_for_principal(id).await?;
        let mut record = AuditRecord::new(
            "user.password_changed",
            format!("principal:{}", id),
            "Password changed",
        )
        .with_severity(AuditSeverity::Warning);
        if let Some(actor) = actor {
            record = record.with_principal(actor);
        }
        self.audit.log(record);
        Ok(())
    }

    pub async fn delete_principal(&self, id: i64, actor: Option<&str>) -> AuthResult<()> {
        self.refresh.revoke_all_for_principal(id).await?;
        self.principals.delete(id).await?;
        let mut record = AuditRecord::new(
            "user.deleted",
            format!("principal:{}", id),
            "User deleted",
        )
        .with_severity(AuditSeverity::Warning);
        if let Some(actor) = actor {
            record = record.with_principal(actor);
        }
        self.audit.log(record);
        Ok(())
    }

    // ── Housekeeping ─────────────────────────────────────────────────

    /// Drop expired pending tokens and dead refresh rows; called from the
    /// periodic sweep.
    pub async fn expire_housekeeping(&self) -> AuthResult<u64> {
        let now_ms = self.clock.now_millis();
        {
            let mut pending = self.pending.lock().await;
            pending.retain(|_, p| p.expires_at_ms > now_ms);
        }
        self.refresh.purge_expired(now_ms).await
    }

    // ── Internals ────────────────────────────────────────────────────

    async fn require_principal(&self, id: i64) -> AuthResult<Principal> {
        self.principals
            .get_by_id(id)
            .await?
            .ok_or_else(|| AuthError::not_found(format!("Principal {} not found", id)))
    }

    async fn verify_blocking(&self, password_input: &str, hash: &str) -> AuthResult<bool> {
        let password_input = password_input.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || password::verify_password(&password_input, &hash))
            .await
            .map_err(|e| AuthError::crypto("Verify task failed").with_detail(e.to_string()))
    }

    async fn hash_blocking(&self, password_input: &str) -> AuthResult<String> {
        let password_input = password_input.to_string();
        tokio::task::spawn_blocking(move || password::hash_password(&password_input))
            .await
            .map_err(|e| AuthError::crypto("Hash task failed").with_detail(e.to_string()))?
    }

    async fn record_failure(&self, username: &str, ip: &str, user_agent: Option<&str>, reason: &str) {
        // Awaited so a rapid retry loop converges on the block decision
        // before its next request is answered.
        if let Err(e) = self
            .failed_logins
            .record_failure(username, ip, user_agent, reason)
            .await
        {
            log::error!("[auth] failed-attempt recording failed: {}", e);
        }
    }

    async fn apply_floor(&self, started: Instant) {
        let floor = Duration::from_millis(self.config.min_verify_ms);
        let elapsed = started.elapsed();
        if elapsed < floor {
            tokio::time::sleep(floor - elapsed).await;
        }
    }
}

fn validate_username(username: &str) -> AuthResult<()> {
    let ok = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(AuthError::validation(
            "Username must be 1-64 characters of [A-Za-z0-9._-]",
        ))
    }
}

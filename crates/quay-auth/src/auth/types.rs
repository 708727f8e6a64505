//! Principal, token, and login-outcome types.

use serde::{Deserialize, Serialize};

/// Coarse role model; `Admin` gates every mutation whose blast radius
/// exceeds the calling user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "admin" => Some(Role::Admin),
            "user" => Some(Role::User),
            _ => None,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// Second-factor enrolment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TwoFactorState {
    Disabled,
    /// Secret issued, first code not yet confirmed.
    PendingSetup,
    Enrolled,
}

impl TwoFactorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TwoFactorState::Disabled => "disabled",
            TwoFactorState::PendingSetup => "pending_setup",
            TwoFactorState::Enrolled => "enrolled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(TwoFactorState::Disabled),
            "pending_setup" => Some(TwoFactorState::PendingSetup),
            "enrolled" => Some(TwoFactorState::Enrolled),
            _ => None,
        }
    }
}

/// A human identity, as persisted. The password verifier and the encrypted
/// TOTP secret never leave this crate.
#[derive(Debug, Clone)]
pub struct Principal {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub enabled: bool,
    pub totp_state: TwoFactorState,
    /// AES-GCM envelope around the base-32 TOTP secret.
    pub totp_secret_enc: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Principal {
    /// Public projection: no verifier, no secret material.
    pub fn to_info(&self) -> PrincipalInfo {
        PrincipalInfo {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            role: self.role,
            enabled: self.enabled,
            totp_state: self.totp_state,
            created_at: self.created_at,
        }
    }
}

/// What the API returns for a principal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalInfo {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub enabled: bool,
    pub totp_state: TwoFactorState,
    pub created_at: i64,
}

/// Issued token pair. The refresh token is opaque and server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds, for client refresh scheduling.
    pub expires_in: i64,
}

/// Why a login failed. Deliberately coarse towards the client; the audit
/// trail carries the precise reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    UnknownUser,
    BadPassword,
    Disabled,
    Blocked,
    DirectoryUnavailable,
    BadTwoFactorCode,
    PendingTokenInvalid,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownUser => "unknown_user",
            FailureReason::BadPassword => "bad_password",
            FailureReason::Disabled => "disabled",
            FailureReason::Blocked => "blocked",
            FailureReason::DirectoryUnavailable => "directory_unavailable",
            FailureReason::BadTwoFactorCode => "bad_2fa_code",
            FailureReason::PendingTokenInvalid => "pending_token_invalid",
        }
    }
}

/// Result of `login` / `verify_2fa`.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Success {
        tokens: TokenPair,
        principal: PrincipalInfo,
    },
    /// Password was right but a second factor is enrolled.
    RequiresTwoFactor {
        pending_token: String,
        principal_id: i64,
    },
    Failure {
        reason: FailureReason,
        /// Retry-after hint when the reason is `Blocked`.
        retry_after_secs: Option<i64>,
    },
}

impl LoginOutcome {
    pub fn failure(reason: FailureReason) -> Self {
        LoginOutcome::Failure {
            reason,
            retry_after_secs: None,
        }
    }
}

/// 2FA setup response: the only moment secret material crosses the API.
#[derive(Debug, Clone, Serialize)]
pub struct TwoFactorSetup {
    pub secret: String,
    /// otpauth:// provisioning URI for authenticator apps.
    pub otpauth_uri: String,
    pub backup_codes: Vec<String>,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
    /// Constant floor for password verification, to blunt user
    /// enumeration by timing.
    pub min_verify_ms: u64,
    /// Lifetime of the 2FA pending token.
    pub pending_ttl_secs: i64,
    pub backup_code_count: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 14 * 24 * 3600,
            min_verify_ms: 250,
            pending_ttl_secs: 5 * 60,
            backup_code_count: 10,
        }
    }
}

//! Authentication error type.
//!
//! Credential *outcomes* are not errors; they travel in
//! [`crate::auth::types::LoginOutcome`]. This type covers the machinery
//! around them.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthError {
    pub kind: AuthErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AuthErrorKind {
    /// Token missing, malformed, expired, or revoked.
    Unauthorized,
    /// Target principal or token row absent.
    NotFound,
    /// Uniqueness violation (duplicate username).
    Conflict,
    /// Caller-supplied input failed validation.
    Validation,
    /// Persistence layer failure.
    Database,
    /// Hashing / encryption failure.
    Crypto,
    /// Directory service unreachable or misbehaving.
    Directory,
}

pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    pub fn new(kind: AuthErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Unauthorized, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Conflict, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Validation, msg)
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Database, msg)
    }

    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Crypto, msg)
    }

    pub fn directory(msg: impl Into<String>) -> Self {
        Self::new(AuthErrorKind::Directory, msg)
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "[auth {:?}] {}: {}", self.kind, self.message, d),
            None => write!(f, "[auth {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<sqlx::Error> for AuthError {
    fn from(e: sqlx::Error) -> Self {
        Self::database("Auth store query failed").with_detail(e.to_string())
    }
}

impl From<bcrypt::BcryptError> for AuthError {
    fn from(e: bcrypt::BcryptError) -> Self {
        Self::crypto("Password hashing failed").with_detail(e.to_string())
    }
}

impl From<ldap3::LdapError> for AuthError {
    fn from(e: ldap3::LdapError) -> Self {
        Self::directory("Directory operation failed").with_detail(e.to_string())
    }
}

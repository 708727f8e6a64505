//! Security-engine error type.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityError {
    pub kind: SecurityErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SecurityErrorKind {
    Database,
    /// No matching block/attempt row.
    NotFound,
}

pub type SecurityResult<T> = Result<T, SecurityError>;

impl SecurityError {
    pub fn new(kind: SecurityErrorKind, msg: impl Into<String>) -> Self {
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

    pub fn database(msg: impl Into<String>) -> Self {
        Self::new(SecurityErrorKind::Database, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(SecurityErrorKind::NotFound, msg)
    }
}

impl fmt::Display for SecurityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "[security {:?}] {}: {}", self.kind, self.message, d),
            None => write!(f, "[security {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SecurityError {}

impl From<sqlx::Error> for SecurityError {
    fn from(e: sqlx::Error) -> Self {
        Self::database("Security store query failed").with_detail(e.to_string())
    }
}

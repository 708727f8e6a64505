//! Audit-specific error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised audit error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditError {
    pub kind: AuditErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AuditErrorKind {
    /// Persistence layer rejected the operation.
    Database,
    /// Record could not be serialised.
    Serialization,
    /// Sink already shut down.
    Closed,
}

pub type AuditResult<T> = Result<T, AuditError>;

impl AuditError {
    pub fn new(kind: AuditErrorKind, msg: impl Into<String>) -> Self {
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
        Self::new(AuditErrorKind::Database, msg)
    }

    pub fn closed() -> Self {
        Self::new(AuditErrorKind::Closed, "Audit sink is shut down")
    }
}

impl fmt::Display for AuditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "[audit {:?}] {}: {}", self.kind, self.message, detail),
            None => write!(f, "[audit {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for AuditError {}

impl From<sqlx::Error> for AuditError {
    fn from(e: sqlx::Error) -> Self {
        Self::database("Audit store query failed").with_detail(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_and_without_detail() {
        let plain = AuditError::database("boom");
        assert!(plain.to_string().contains("boom"));
        let detailed = AuditError::database("boom").with_detail("disk full");
        assert!(detailed.to_string().contains("disk full"));
    }

    #[test]
    fn closed_kind() {
        assert_eq!(AuditError::closed().kind, AuditErrorKind::Closed);
    }
}

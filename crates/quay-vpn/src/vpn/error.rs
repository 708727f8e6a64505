//! VPN-layer error type.

use quay_supervisor::{SupervisorError, SupervisorErrorKind};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnError {
    pub kind: VpnErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum VpnErrorKind {
    Database,
    Validation,
    NotFound,
    /// Uniqueness violation (duplicate key, common name, or username).
    Conflict,
    /// External tooling (wg, CA, daemon) failed.
    Tool,
    Io,
}

pub type VpnResult<T> = Result<T, VpnError>;

impl VpnError {
    pub fn new(kind: VpnErrorKind, msg: impl Into<String>) -> Self {
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
        Self::new(VpnErrorKind::Database, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::Validation, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::NotFound, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::Conflict, msg)
    }

    pub fn tool(msg: impl Into<String>) -> Self {
        Self::new(VpnErrorKind::Tool, msg)
    }
}

impl fmt::Display for VpnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "[vpn {:?}] {}: {}", self.kind, self.message, d),
            None => write!(f, "[vpn {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for VpnError {}

impl From<sqlx::Error> for VpnError {
    fn from(e: sqlx::Error) -> Self {
        Self::database("VPN store query failed").with_detail(e.to_string())
    }
}

impl From<std::io::Error> for VpnError {
    fn from(e: std::io::Error) -> Self {
        Self::new(VpnErrorKind::Io, e.to_string())
    }
}

impl From<VpnError> for SupervisorError {
    fn from(e: VpnError) -> Self {
        let kind = match e.kind {
            VpnErrorKind::Validation => SupervisorErrorKind::Validation,
            VpnErrorKind::NotFound => SupervisorErrorKind::NotFound,
            VpnErrorKind::Conflict => SupervisorErrorKind::Conflict,
            VpnErrorKind::Tool => SupervisorErrorKind::Downstream,
            VpnErrorKind::Database | VpnErrorKind::Io => SupervisorErrorKind::Io,
        };
        let mut out = SupervisorError::new(kind, e.message);
        out.detail = e.detail;
        out
    }
}

//! Audit record model and query types.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
    Error,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::Success => "success",
            AuditStatus::Failure => "failure",
            AuditStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(AuditStatus::Success),
            "failure" => Some(AuditStatus::Failure),
            "error" => Some(AuditStatus::Error),
            _ => None,
        }
    }
}

/// How loudly the record should surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "info" => Some(AuditSeverity::Info),
            "warning" => Some(AuditSeverity::Warning),
            "critical" => Some(AuditSeverity::Critical),
            _ => None,
        }
    }
}

/// One append-only audit entry.
///
/// `action` is dot-namespaced (`auth.login.failed`, `vpn.peer.create`);
/// `principal` is absent for pre-authentication events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    /// Epoch milliseconds; stamped by the sink at enqueue time.
    pub timestamp: i64,
    pub principal: Option<String>,
    pub action: String,
    pub resource: String,
    pub status: AuditStatus,
    pub severity: AuditSeverity,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub message: String,
    /// Opaque structured context.
    pub details: Value,
}

impl AuditRecord {
    pub fn new(
        action: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: quay_core::new_id(),
            timestamp: 0,
            principal: None,
            action: action.into(),
            resource: resource.into(),
            status: AuditStatus::Success,
            severity: AuditSeverity::Info,
            ip: None,
            user_agent: None,
            message: message.into(),
            details: Value::Null,
        }
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_status(mut self, status: AuditStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Timestamp as a chrono instant (for display layers).
    pub fn timestamp_utc(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }
}

/// Query filter; all fields are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub username: Option<String>,
    /// Matches `action` by prefix (`auth.` matches `auth.login.success`).
    pub action_prefix: Option<String>,
    pub status: Option<AuditStatus>,
    pub severity: Option<AuditSeverity>,
    /// Inclusive lower bound, epoch millis.
    pub from: Option<i64>,
    /// Exclusive upper bound, epoch millis.
    pub to: Option<i64>,
}

/// One page of records plus the unpaged total.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub records: Vec<AuditRecord>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}

/// Aggregate view for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct AuditStats {
    pub total: i64,
    pub last_24h: i64,
    pub by_severity: Vec<(String, i64)>,
    pub top_actions: Vec<(String, i64)>,
}

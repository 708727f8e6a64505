//! Append-only audit trail for security-relevant events.

pub mod audit;

pub use audit::error::{AuditError, AuditErrorKind, AuditResult};
pub use audit::sink::{AuditSink, SinkConfig};
pub use audit::store::AuditStore;
pub use audit::types::*;

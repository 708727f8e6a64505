//! Process metrics registry.
//!
//! A fixed set of named counters owned by the composition root and handed
//! down as `Arc<Metrics>`. Rendered in the Prometheus text exposition
//! format by the gateway's `/metrics` route.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter registry for the control-plane core.
#[derive(Debug, Default)]
pub struct Metrics {
    pub http_requests_total: AtomicU64,
    pub http_errors_total: AtomicU64,
    pub login_success_total: AtomicU64,
    pub login_failure_total: AtomicU64,
    pub ip_blocks_created_total: AtomicU64,
    pub audit_buffered_total: AtomicU64,
    pub audit_dropped_total: AtomicU64,
    pub audit_retries_total: AtomicU64,
    pub events_published_total: AtomicU64,
    pub events_dropped_total: AtomicU64,
    pub ws_connections_total: AtomicU64,
    pub supervisor_commands_total: AtomicU64,
    pub supervisor_command_errors_total: AtomicU64,
}

/// Point-in-time snapshot, serialisable for the health API.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub http_requests_total: u64,
    pub http_errors_total: u64,
    pub login_success_total: u64,
    pub login_failure_total: u64,
    pub ip_blocks_created_total: u64,
    pub audit_buffered_total: u64,
    pub audit_dropped_total: u64,
    pub audit_retries_total: u64,
    pub events_published_total: u64,
    pub events_dropped_total: u64,
    pub ws_connections_total: u64,
    pub supervisor_commands_total: u64,
    pub supervisor_command_errors_total: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            http_requests_total: self.http_requests_total.load(Ordering::Relaxed),
            http_errors_total: self.http_errors_total.load(Ordering::Relaxed),
            login_success_total: self.login_success_total.load(Ordering::Relaxed),
            login_failure_total: self.login_failure_total.load(Ordering::Relaxed),
            ip_blocks_created_total: self.ip_blocks_created_total.load(Ordering::Relaxed),
            audit_buffered_total: self.audit_buffered_total.load(Ordering::Relaxed),
            audit_dropped_total: self.audit_dropped_total.load(Ordering::Relaxed),
            audit_retries_total: self.audit_retries_total.load(Ordering::Relaxed),
            events_published_total: self.events_published_total.load(Ordering::Relaxed),
            events_dropped_total: self.events_dropped_total.load(Ordering::Relaxed),
            ws_connections_total: self.ws_connections_total.load(Ordering::Relaxed),
            supervisor_commands_total: self.supervisor_commands_total.load(Ordering::Relaxed),
            supervisor_command_errors_total: self
                .supervisor_command_errors_total
                .load(Ordering::Relaxed),
        }
    }

    /// Render every counter in the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::with_capacity(1024);
        let mut write = |name: &str, help: &str, value: u64| {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n", name, value));
        };
        write(
            "quaynas_http_requests_total",
            "HTTP requests handled.",
            snap.http_requests_total,
        );
        write(
            "quaynas_http_errors_total",
            "HTTP responses with status >= 500.",
            snap.http_errors_total,
        );
        write(
            "quaynas_login_success_total",
            "Successful logins.",
            snap.login_success_total,
        );
        write(
            "quaynas_login_failure_total",
            "Failed login attempts.",
            snap.login_failure_total,
        );
        write(
            "quaynas_ip_blocks_created_total",
            "IP blocks created by the failed-login engine.",
            snap.ip_blocks_created_total,
        );
        write(
            "quaynas_audit_buffered_total",
            "Audit records accepted into the sink buffer.",
            snap.audit_buffered_total,
        );
        write(
            "quaynas_audit_dropped_total",
            "Audit records dropped on buffer overflow or retry exhaustion.",
            snap.audit_dropped_total,
        );
        write(
            "quaynas_audit_retries_total",
            "Audit persistence retries.",
            snap.audit_retries_total,
        );
        write(
            "quaynas_events_published_total",
            "Supervisor events published.",
            snap.events_published_total,
        );
        write(
            "quaynas_events_dropped_total",
            "Supervisor events dropped for slow subscribers.",
            snap.events_dropped_total,
        );
        write(
            "quaynas_ws_connections_total",
            "WebSocket connections accepted.",
            snap.ws_connections_total,
        );
        write(
            "quaynas_supervisor_commands_total",
            "Supervisor commands dispatched.",
            snap.supervisor_commands_total,
        );
        write(
            "quaynas_supervisor_command_errors_total",
            "Supervisor commands that returned an error.",
            snap.supervisor_command_errors_total,
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero() {
        let m = Metrics::new();
        assert_eq!(m.snapshot().http_requests_total, 0);
        assert_eq!(m.snapshot().audit_dropped_total, 0);
    }

    #[test]
    fn incr_and_add() {
        let m = Metrics::new();
        Metrics::incr(&m.http_requests_total);
        Metrics::incr(&m.http_requests_total);
        Metrics::add(&m.events_dropped_total, 5);
        let snap = m.snapshot();
        assert_eq!(snap.http_requests_total, 2);
        assert_eq!(snap.events_dropped_total, 5);
    }

    #[test]
    fn render_exposition_format() {
        let m = Metrics::new();
        Metrics::incr(&m.login_failure_total);
        let text = m.render();
        assert!(text.contains("# TYPE quaynas_login_failure_total counter"));
        assert!(text.contains("quaynas_login_failure_total 1"));
        // One HELP line per counter.
        assert_eq!(text.matches("# HELP ").count(), 13);
    }

    #[test]
    fn snapshot_serialises() {
        let m = Metrics::new();
        let json = serde_json::to_value(m.snapshot()).unwrap();
        assert!(json.get("http_requests_total").is_some());
    }
}

//! Daemon lifecycle state cell.
//!
//! Owns the current state, validates transitions against the lifecycle
//! graph, and emits an event plus an audit record on every change.
//!
//! ```text
//! stopped --start--> starting --ready--> running
//!    ^                  |                   |
//!    |                  v                   v
//!    +----- failed <--timeout/error      degraded <--probe-fail
//!                                           |
//!                                           +--probe-pass--> running
//! running --stop--> stopping --exit--> stopped
//! stopping --restart--> starting            (restart chaining)
//! failed --start--> starting                (manual retry)
//! ```

use crate::supervisor::error::{SupervisorError, SupervisorResult};
use crate::supervisor::events::EventHub;
use crate::supervisor::types::*;
use quay_audit::{AuditRecord, AuditSeverity, AuditSink, AuditStatus};
use quay_core::Clock;
use serde_json::json;
use std::sync::{Arc, Mutex};

/// What `begin_start` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    /// Caller owns the start; state is now `Starting`.
    Proceed,
    /// Daemon already running (or degraded); start is an idempotent no-op.
    AlreadyRunning,
}

pub struct StateCell {
    kind: DaemonKind,
    name: String,
    control: String,
    inner: Mutex<StateInner>,
    hub: Arc<EventHub>,
    audit: AuditSink,
    clock: Arc<dyn Clock>,
}

struct StateInner {
    state: DaemonState,
    since_ms: i64,
    last_error: Option<String>,
}

impl StateCell {
    pub fn new(
        kind: DaemonKind,
        name: impl Into<String>,
        control: impl Into<String>,
        hub: Arc<EventHub>,
        audit: AuditSink,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let since_ms = clock.now_millis();
        Self {
            kind,
            name: name.into(),
            control: control.into(),
            inner: Mutex::new(StateInner {
                state: DaemonState::Stopped,
                since_ms,
                last_error: None,
            }),
            hub,
            audit,
            clock,
        }
    }

    pub fn kind(&self) -> DaemonKind {
        self.kind
    }

    pub fn state(&self) -> DaemonState {
        self.inner.lock().expect("state cell poisoned").state
    }

    pub fn descriptor(&self) -> DaemonDescriptor {
        let inner = self.inner.lock().expect("state cell poisoned");
        DaemonDescriptor {
            kind: self.kind,
            name: self.name.clone(),
            state: inner.state,
            since: inner.since_ms,
            last_error: inner.last_error.clone(),
            control: self.control.clone(),
        }
    }

    /// Decide whether a start may proceed. Starting/stopping in flight is
    /// a conflict; running is idempotent.
    pub fn begin_start(&self) -> SupervisorResult<StartDisposition> {
        let state = self.state();
        match state {
            DaemonState::Running | DaemonState::Degraded => Ok(StartDisposition::AlreadyRunning),
            DaemonState::Starting | DaemonState::Stopping => Err(SupervisorError::conflict(
                format!("{} lifecycle operation already in flight", self.kind.as_str()),
            )),
            DaemonState::Stopped | DaemonState::Failed => {
                self.transition(DaemonState::Starting)?;
                Ok(StartDisposition::Proceed)
            }
        }
    }

    /// Move to a new state, validating against the lifecycle graph.
    pub fn transition(&self, to: DaemonState) -> SupervisorResult<DaemonState> {
        let (from, since) = {
            let mut inner = self.inner.lock().expect("state cell poisoned");
            let from = inner.state;
            if !transition_allowed(from, to) {
                return Err(SupervisorError::conflict(format!(
                    "Illegal transition {} -> {} for {}",
                    from.as_str(),
                    to.as_str(),
                    self.kind.as_str()
                )));
            }
            inner.state = to;
            inner.since_ms = self.clock.now_millis();
            if to == DaemonState::Running {
                inner.last_error = None;
            }
            (from, inner.since_ms)
        };

        log::info!(
            "[supervisor:{}] {} -> {}",
            self.kind.as_str(),
            from.as_str(),
            to.as_str()
        );

        let severity = match to {
            DaemonState::Failed => EventSeverity::Critical,
            DaemonState::Degraded => EventSeverity::Warning,
            _ => EventSeverity::Info,
        };
        self.hub.publish(
            "state.changed",
            severity,
            json!({ "from": from.as_str(), "to": to.as_str(), "since": since }),
        );

        let audit_severity = match to {
            DaemonState::Failed => AuditSeverity::Critical,
            DaemonState::Degraded => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        };
        self.audit.log(
            AuditRecord::new(
                "daemon.state_changed",
                format!("daemon:{}", self.kind.as_str()),
                format!("{} -> {}", from.as_str(), to.as_str()),
            )
            .with_status(if to == DaemonState::Failed {
                AuditStatus::Error
            } else {
                AuditStatus::Success
            })
            .with_severity(audit_severity),
        );

        Ok(from)
    }

    /// Record a failure reason and move to `Failed`.
    pub fn fail(&self, error: impl Into<String>) -> SupervisorResult<()> {
        let message = error.into();
        {
            let mut inner = self.inner.lock().expect("state cell poisoned");
            inner.last_error = Some(message.clone());
        }
        log::error!("[supervisor:{}] failed: {}", self.kind.as_str(), message);
        self.transition(DaemonState::Failed)?;
        Ok(())
    }

    /// Guard for `execute`: commands need a running daemon.
    pub fn require_running(&self) -> SupervisorResult<()> {
        if self.state().accepts_commands() {
            Ok(())
        } else {
            Err(SupervisorError::not_running(self.kind.as_str()))
        }
    }
}

fn transition_allowed(from: DaemonState, to: DaemonState) -> bool {
    use DaemonState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Failed, Starting)
            | (Starting, Running)
            | (Starting, Failed)
            | (Running, Stopping)
            | (Running, Degraded)
            | (Degraded, Running)
            | (Degraded, Stopping)
            | (Degraded, Failed)
            | (Stopping, Stopped)
            | (Stopping, Starting)
            | (Stopping, Failed)
    )
}

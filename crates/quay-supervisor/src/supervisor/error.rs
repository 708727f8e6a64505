//! Supervisor error type.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorError {
    pub kind: SupervisorErrorKind,
    pub message: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SupervisorErrorKind {
    /// Command rejected because the daemon is not in `Running`.
    NotRunning,
    /// Lifecycle operation collides with one in flight, or an illegal
    /// state transition was requested.
    Conflict,
    /// Start/stop/command deadline exceeded.
    Timeout,
    /// Socket or process I/O failure.
    Io,
    /// Peer violated the control protocol.
    Protocol,
    /// Command input failed validation.
    Validation,
    /// Target entity absent (peer, user, zone, ...).
    NotFound,
    /// The daemon answered with an error.
    Downstream,
    /// Action not supported by this supervisor kind.
    Unsupported,
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

impl SupervisorError {
    pub fn new(kind: SupervisorErrorKind, msg: impl Into<String>) -> Self {
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

    pub fn not_running(kind_name: &str) -> Self {
        Self::new(
            SupervisorErrorKind::NotRunning,
            format!("{} daemon is not running", kind_name),
        )
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::Conflict, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::Timeout, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::Io, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::Protocol, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::Validation, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::NotFound, msg)
    }

    pub fn downstream(msg: impl Into<String>) -> Self {
        Self::new(SupervisorErrorKind::Downstream, msg)
    }

    pub fn unsupported(action: &str) -> Self {
        Self::new(
            SupervisorErrorKind::Unsupported,
            format!("Action '{}' is not supported", action),
        )
    }
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(d) => write!(f, "[supervisor {:?}] {}: {}", self.kind, self.message, d),
            None => write!(f, "[supervisor {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SupervisorError {}

impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            Self::timeout(e.to_string())
        } else {
            Self::io(e.to_string())
        }
    }
}

//! Descriptor, state, and command envelope types shared by every
//! supervisor kind.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which daemon a supervisor owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonKind {
    SambaAd,
    AsteriskAmi,
    WireGuard,
    OpenVpn,
    Pptp,
    L2tp,
}

impl DaemonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonKind::SambaAd => "samba_ad",
            DaemonKind::AsteriskAmi => "asterisk_ami",
            DaemonKind::WireGuard => "wireguard",
            DaemonKind::OpenVpn => "openvpn",
            DaemonKind::Pptp => "pptp",
            DaemonKind::L2tp => "l2tp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "samba_ad" => Some(DaemonKind::SambaAd),
            "asterisk_ami" => Some(DaemonKind::AsteriskAmi),
            "wireguard" => Some(DaemonKind::WireGuard),
            "openvpn" => Some(DaemonKind::OpenVpn),
            "pptp" => Some(DaemonKind::Pptp),
            "l2tp" => Some(DaemonKind::L2tp),
            _ => None,
        }
    }
}

/// Lifecycle states. `Starting` and `Stopping` are transient and bounded
/// by deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
    Failed,
}

impl DaemonState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DaemonState::Stopped => "stopped",
            DaemonState::Starting => "starting",
            DaemonState::Running => "running",
            DaemonState::Degraded => "degraded",
            DaemonState::Stopping => "stopping",
            DaemonState::Failed => "failed",
        }
    }

    /// Command dispatch is accepted in these states only.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, DaemonState::Running)
    }
}

/// Snapshot of one supervised daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDescriptor {
    pub kind: DaemonKind,
    pub name: String,
    pub state: DaemonState,
    /// When the current state was entered, epoch millis.
    pub since: i64,
    pub last_error: Option<String>,
    /// Kind-specific control endpoint (unix path, tcp endpoint, interface).
    pub control: String,
}

/// Event severity mirrors the audit scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Info,
    Warning,
    Critical,
}

/// One supervisor event. `seq` increases monotonically per supervisor and
/// is the only ordering clients may rely on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorEvent {
    pub seq: u64,
    pub kind: DaemonKind,
    /// Dot-namespaced event name (`state.changed`, `domain.provisioned`).
    pub name: String,
    pub severity: EventSeverity,
    /// Epoch millis.
    pub timestamp: i64,
    pub data: Value,
}

/// Kind-tagged command envelope; each supervisor parses `action`/`params`
/// into its own typed command set before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }

    pub fn bare(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Value::Null,
        }
    }
}

/// Result of a dispatched command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutput {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

impl CommandOutput {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Value::Null,
        }
    }

    pub fn ok_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
        }
    }
}

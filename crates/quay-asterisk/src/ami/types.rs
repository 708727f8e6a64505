//! Asterisk supervisor configuration and typed command surface.

use quay_supervisor::{CommandRequest, SupervisorError, SupervisorResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmiConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
    /// Whether the supervisor launches the asterisk process itself or
    /// attaches to one managed elsewhere.
    pub manage_process: bool,
    pub program: String,
    pub args: Vec<String>,
    pub action_timeout_secs: u64,
    pub start_deadline_secs: u64,
    pub stop_grace_secs: u64,
    /// Reconnect budget after a control-channel loss before `Failed`.
    pub reconnect_deadline_secs: u64,
}

impl Default for AmiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5038,
            username: "admin".into(),
            secret: String::new(),
            manage_process: true,
            program: "asterisk".into(),
            args: vec!["-f".into()],
            action_timeout_secs: 10,
            start_deadline_secs: 30,
            stop_grace_secs: 30,
            reconnect_deadline_secs: 60,
        }
    }
}

/// One row of the SIP peer listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    pub object_name: String,
    pub ip_address: Option<String>,
    pub status: Option<String>,
}

/// Typed commands the PBX supervisor dispatches.
#[derive(Debug, Clone, PartialEq)]
pub enum AsteriskCommand {
    CoreShowVersion,
    SipPeers,
    Originate {
        channel: String,
        exten: String,
        context: String,
        priority: u32,
        timeout_ms: u64,
    },
    Hangup {
        channel: String,
    },
    Reload {
        module: Option<String>,
    },
    /// Raw CLI pass-through (`Action: Command`).
    Command {
        command: String,
    },
}

#[derive(Debug, Deserialize)]
struct OriginateParams {
    channel: String,
    exten: String,
    context: String,
    #[serde(default = "default_priority")]
    priority: u32,
    #[serde(default = "default_originate_timeout")]
    timeout_ms: u64,
}

fn default_priority() -> u32 {
    1
}

fn default_originate_timeout() -> u64 {
    30_000
}

#[derive(Debug, Deserialize)]
struct HangupParams {
    channel: String,
}

#[derive(Debug, Deserialize)]
struct ReloadParams {
    #[serde(default)]
    module: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommandParams {
    command: String,
}

impl AsteriskCommand {
    /// Parse the kind-tagged envelope into a typed command.
    pub fn parse(request: &CommandRequest) -> SupervisorResult<Self> {
        let bad =
            |e: serde_json::Error| SupervisorError::validation(format!("Invalid params: {}", e));
        match request.action.as_str() {
            "core_show_version" => Ok(AsteriskCommand::CoreShowVersion),
            "sip_peers" => Ok(AsteriskCommand::SipPeers),
            "originate" => {
                let p: OriginateParams =
                    serde_json::from_value(request.params.clone()).map_err(bad)?;
                if p.channel.is_empty() || p.exten.is_empty() || p.context.is_empty() {
                    return Err(SupervisorError::validation(
                        "originate requires channel, exten, and context",
                    ));
                }
                Ok(AsteriskCommand::Originate {
                    channel: p.channel,
                    exten: p.exten,
                    context: p.context,
                    priority: p.priority,
                    timeout_ms: p.timeout_ms,
                })
            }
            "hangup" => {
                let p: HangupParams = serde_json::from_value(request.params.clone()).map_err(bad)?;
                Ok(AsteriskCommand::Hangup { channel: p.channel })
            }
            "reload" => {
                let p: ReloadParams = serde_json::from_value(if request.params.is_null() {
                    serde_json::json!({})
                } else {
                    request.params.clone()
                })
                .map_err(bad)?;
                Ok(AsteriskCommand::Reload { module: p.module })
            }
            "command" => {
                let p: CommandParams =
                    serde_json::from_value(request.params.clone()).map_err(bad)?;
                if p.command.trim().is_empty() {
                    return Err(SupervisorError::validation("command must not be empty"));
                }
                Ok(AsteriskCommand::Command { command: p.command })
            }
            other => Err(SupervisorError::unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_supervisor::SupervisorErrorKind;
    use serde_json::json;

    #[test]
    fn parse_bare_actions() {
        let cmd = AsteriskCommand::parse(&CommandRequest::bare("core_show_version")).unwrap();
        assert_eq!(cmd, AsteriskCommand::CoreShowVersion);
        let cmd = AsteriskCommand::parse(&CommandRequest::bare("sip_peers")).unwrap();
        assert_eq!(cmd, AsteriskCommand::SipPeers);
    }

    #[test]
    fn parse_originate_with_defaults() {
        let req = CommandRequest::new(
            "originate",
            json!({"channel": "SIP/100", "exten": "600", "context": "internal"}),
        );
        let cmd = AsteriskCommand::parse(&req).unwrap();
        assert_eq!(
            cmd,
            AsteriskCommand::Originate {
                channel: "SIP/100".into(),
                exten: "600".into(),
                context: "internal".into(),
                priority: 1,
                timeout_ms: 30_000,
            }
        );
    }

    #[test]
    fn originate_missing_channel_is_validation() {
        let req = CommandRequest::new("originate", json!({"exten": "600", "context": "x"}));
        let err = AsteriskCommand::parse(&req).unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Validation);
    }

    #[test]
    fn reload_accepts_null_params() {
        let cmd = AsteriskCommand::parse(&CommandRequest::bare("reload")).unwrap();
        assert_eq!(cmd, AsteriskCommand::Reload { module: None });
        let req = CommandRequest::new("reload", json!({"module": "chan_sip"}));
        let cmd = AsteriskCommand::parse(&req).unwrap();
        assert_eq!(
            cmd,
            AsteriskCommand::Reload {
                module: Some("chan_sip".into())
            }
        );
    }

    #[test]
    fn unknown_action_is_unsupported() {
        let err = AsteriskCommand::parse(&CommandRequest::bare("fax_send")).unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Unsupported);
    }

    #[test]
    fn empty_cli_command_rejected() {
        let req = CommandRequest::new("command", json!({"command": "  "}));
        let err = AsteriskCommand::parse(&req).unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Validation);
    }
}

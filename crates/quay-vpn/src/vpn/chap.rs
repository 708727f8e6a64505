//! PPTP / L2TP account supervision.
//!
//! Both stacks authenticate through a chap-secrets file. Accounts live in
//! the store; every mutation re-renders the file atomically
//! (write-then-rename) and nudges the daemon with SIGHUP when it is
//! running.

use crate::vpn::error::{VpnError, VpnResult};
use crate::vpn::store::VpnStore;
use crate::vpn::types::*;
use async_trait::async_trait;
use quay_core::Clock;
use quay_supervisor::{
    CommandOutput, CommandRequest, DaemonDescriptor, DaemonKind, DaemonProcess, DaemonState,
    EventHub, EventSeverity, EventStream, StartDisposition, StateCell, Supervisor,
    SupervisorError, SupervisorResult,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct ChapSupervisorConfig {
    pub protocol: VpnProtocol,
    /// Server tag in chap-secrets (`pptpd` or `l2tpd`).
    pub server_tag: String,
    pub secrets_path: String,
    pub manage_process: bool,
    pub program: String,
    pub args: Vec<String>,
    pub stop_grace_secs: u64,
    /// IPsec preshared key (L2TP only); written to `psk_path` on start.
    pub psk: Option<String>,
    pub psk_path: String,
}

impl ChapSupervisorConfig {
    pub fn pptp() -> Self {
        Self {
            protocol: VpnProtocol::Pptp,
            server_tag: "pptpd".into(),
            secrets_path: "/etc/ppp/chap-secrets".into(),
            manage_process: true,
            program: "pptpd".into(),
            args: vec!["--fg".into()],
            stop_grace_secs: 30,
            psk: None,
            psk_path: "/etc/ipsec.secrets".into(),
        }
    }

    pub fn l2tp() -> Self {
        Self {
            protocol: VpnProtocol::L2tp,
            server_tag: "l2tpd".into(),
            secrets_path: "/etc/ppp/chap-secrets".into(),
            manage_process: true,
            program: "xl2tpd".into(),
            args: vec!["-D".into()],
            stop_grace_secs: 30,
            psk: None,
            psk_path: "/etc/ipsec.secrets".into(),
        }
    }
}

/// Render the chap-secrets body for one server tag.
pub fn render_chap_secrets(server_tag: &str, accounts: &[ChapAccount]) -> String {
    let mut lines = vec![
        "# Managed by quaynas; manual edits are overwritten.".to_string(),
        "# client\tserver\tsecret\tIP addresses".to_string(),
    ];
    for account in accounts.iter().filter(|a| a.enabled) {
        lines.push(format!(
            "\"{}\"\t{}\t\"{}\"\t*",
            account.username, server_tag, account.secret
        ));
    }
    lines.join("\n") + "\n"
}

fn validate_account_username(username: &str) -> VpnResult<()> {
    let ok = !username.is_empty()
        && username.len() <= 64
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@'));
    if ok {
        Ok(())
    } else {
        Err(VpnError::validation(format!(
            "'{}' is not a valid account username",
            username
        )))
    }
}

/// The secret lands inside a double-quoted, tab-separated chap-secrets
/// field; quotes and control characters would break out of it and turn
/// into extra lines pppd parses.
fn validate_account_secret(secret: &str) -> VpnResult<()> {
    if secret.len() < 12 || secret.len() > 128 {
        return Err(VpnError::validation(
            "Account secret must be 12-128 characters",
        ));
    }
    if secret
        .chars()
        .any(|c| c.is_control() || matches!(c, '"' | '\\'))
    {
        return Err(VpnError::validation(
            "Account secret must not contain quotes, backslashes, or control characters",
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct AccountAddParams {
    username: String,
    /// Generated when absent.
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccountIdParams {
    id: String,
}

pub struct ChapSupervisor {
    config: ChapSupervisorConfig,
    store: VpnStore,
    cell: Arc<StateCell>,
    hub: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    process: Option<DaemonProcess>,
    op_lock: Mutex<()>,
}

impl ChapSupervisor {
    pub fn new(
        config: ChapSupervisorConfig,
        store: VpnStore,
        cell: Arc<StateCell>,
        hub: Arc<EventHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let process = config.manage_process.then(|| {
            DaemonProcess::new(
                config.protocol.as_str(),
                config.program.clone(),
                config.args.clone(),
            )
        });
        Self {
            config,
            store,
            cell,
            hub,
            clock,
            process,
            op_lock: Mutex::new(()),
        }
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.cell.clone()
    }

    async fn rewrite_secrets(&self) -> VpnResult<()> {
        let accounts = self.store.list_accounts(self.config.protocol).await?;
        let rendered = render_chap_secrets(&self.config.server_tag, &accounts);
        let tmp_path = format!("{}.tmp", self.config.secrets_path);
        tokio::fs::write(&tmp_path, rendered).await?;
        tokio::fs::rename(&tmp_path, &self.config.secrets_path).await?;
        log::debug!(
            "[{}] chap-secrets rewritten ({} accounts)",
            self.config.protocol.as_str(),
            accounts.len()
        );
        Ok(())
    }

    async fn account_add(&self, params: AccountAddParams) -> SupervisorResult<CommandOutput> {
        validate_account_username(&params.username)?;
        let secret = params
            .secret
            .unwrap_or_else(|| quay_core::random_token(18));
        validate_account_secret(&secret)?;
        let account = ChapAccount {
            id: quay_core::new_id(),
            protocol: self.config.protocol,
            username: params.username.clone(),
            secret: secret.clone(),
            enabled: true,
            created_at: self.clock.now_millis(),
        };
        self.store.insert_account(&account).await?;
        self.rewrite_secrets().await?;
        self.hub.publish(
            "account.created",
            EventSeverity::Info,
            json!({ "id": account.id, "username": account.username }),
        );
        // The secret is returned exactly once, at creation.
        Ok(CommandOutput::ok_with(
            format!("Account '{}' created", account.username),
            json!({ "account": account, "secret": secret }),
        ))
    }

    async fn account_remove(&self, id: &str) -> SupervisorResult<CommandOutput> {
        let account = self.store.delete_account(id).await?;
        self.rewrite_secrets().await?;
        self.hub.publish(
            "account.removed",
            EventSeverity::Info,
            json!({ "id": account.id, "username": account.username }),
        );
        Ok(CommandOutput::ok(format!(
            "Account '{}' removed",
            account.username
        )))
    }
}

#[async_trait]
impl Supervisor for ChapSupervisor {
    fn kind(&self) -> DaemonKind {
        match self.config.protocol {
            VpnProtocol::L2tp => DaemonKind::L2tp,
            _ => DaemonKind::Pptp,
        }
    }

    async fn start(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.begin_start()? {
            StartDisposition::AlreadyRunning => return Ok(()),
            StartDisposition::Proceed => {}
        }
        let result = async {
            self.rewrite_secrets().await?;
            if let Some(psk) = &self.config.psk {
                let rendered = format!(": PSK \"{}\"\n", psk);
                let tmp_path = format!("{}.tmp", self.config.psk_path);
                tokio::fs::write(&tmp_path, rendered).await?;
                tokio::fs::rename(&tmp_path, &self.config.psk_path).await?;
            }
            if let Some(process) = &self.process {
                process.spawn().await.map_err(|e| {
                    VpnError::tool(format!("Cannot launch {}", self.config.program))
                        .with_detail(e.to_string())
                })?;
            }
            Ok::<(), VpnError>(())
        }
        .await;
        match result {
            Ok(()) => {
                self.cell.transition(DaemonState::Running)?;
                Ok(())
            }
            Err(e) => {
                self.cell.fail(e.to_string())?;
                Err(e.into())
            }
        }
    }

    async fn stop(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.state() {
            DaemonState::Stopped | DaemonState::Failed => return Ok(()),
            DaemonState::Running | DaemonState::Degraded => {}
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        self.cell.transition(DaemonState::Stopping)?;
        if let Some(process) = &self.process {
            process
                .stop(Duration::from_secs(self.config.stop_grace_secs))
                .await?;
        }
        self.cell.transition(DaemonState::Stopped)?;
        Ok(())
    }

    async fn restart(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.state() {
            DaemonState::Stopped | DaemonState::Failed => {
                self.cell.begin_start()?;
            }
            DaemonState::Running | DaemonState::Degraded => {
                self.cell.transition(DaemonState::Stopping)?;
                if let Some(process) = &self.process {
                    process
                        .stop(Duration::from_secs(self.config.stop_grace_secs))
                        .await?;
                }
                self.cell.transition(DaemonState::Starting)?;
            }
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        self.rewrite_secrets().await.map_err(SupervisorError::from)?;
        if let Some(process) = &self.process {
            if let Err(e) = process.spawn().await {
                self.cell.fail(e.to_string())?;
                return Err(e);
            }
        }
        self.cell.transition(DaemonState::Running)?;
        Ok(())
    }

    async fn status(&self) -> DaemonDescriptor {
        self.cell.descriptor()
    }

    async fn execute(&self, request: CommandRequest) -> SupervisorResult<CommandOutput> {
        let result = match request.action.as_str() {
            "account_add" => {
                let params: AccountAddParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                self.account_add(params).await
            }
            "account_remove" => {
                let params: AccountIdParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                self.account_remove(&params.id).await
            }
            "account_enable" | "account_disable" => {
                let params: AccountIdParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                let enabled = request.action == "account_enable";
                self.store.set_account_enabled(&params.id, enabled).await?;
                self.rewrite_secrets().await?;
                Ok(CommandOutput::ok(format!(
                    "Account {} {}",
                    params.id,
                    if enabled { "enabled" } else { "disabled" }
                )))
            }
            "account_list" => {
                let accounts = self.store.list_accounts(self.config.protocol).await?;
                Ok(CommandOutput::ok_with(
                    format!("{} accounts", accounts.len()),
                    serde_json::to_value(&accounts).unwrap_or_default(),
                ))
            }
            "connections" => {
                let connections = self
                    .store
                    .list_connections(Some(self.config.protocol), true)
                    .await?;
                Ok(CommandOutput::ok_with(
                    format!("{} active connections", connections.len()),
                    serde_json::to_value(&connections).unwrap_or_default(),
                ))
            }
            other => Err(SupervisorError::unsupported(other)),
        };

        if let Err(e) = &result {
            self.hub.publish(
                "command.failed",
                EventSeverity::Warning,
                json!({ "action": request.action, "error": e.to_string() }),
            );
        }
        result
    }

    fn events(&self) -> EventStream {
        self.hub.subscribe(true)
    }

    async fn probe(&self) -> bool {
        match &self.process {
            Some(process) => process.is_running().await,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_audit::{AuditSink, AuditStore, SinkConfig};
    use quay_core::{ManualClock, Metrics};
    use sqlx::sqlite::SqlitePoolOptions;

    const T0: i64 = 1_700_000_000_000;

    fn account(username: &str, secret: &str, enabled: bool) -> ChapAccount {
        ChapAccount {
            id: quay_core::new_id(),
            protocol: VpnProtocol::Pptp,
            username: username.into(),
            secret: secret.into(),
            enabled,
            created_at: 0,
        }
    }

    #[test]
    fn render_includes_enabled_only() {
        let accounts = vec![
            account("alice", "secret-one", true),
            account("bob", "secret-two", false),
        ];
        let rendered = render_chap_secrets("pptpd", &accounts);
        assert!(rendered.contains("\"alice\"\tpptpd\t\"secret-one\"\t*"));
        assert!(!rendered.contains("bob"));
        assert!(rendered.starts_with("# Managed by quaynas"));
        assert!(rendered.ends_with('\n'));
    }

    #[test]
    fn username_validation() {
        assert!(validate_account_username("road.warrior-1@corp").is_ok());
        assert!(validate_account_username("").is_err());
        assert!(validate_account_username("has space").is_err());
        assert!(validate_account_username("quote\"inject").is_err());
    }

    #[test]
    fn secret_validation_blocks_field_breakout() {
        assert!(validate_account_secret("long-enough-secret").is_ok());
        // Too short / too long.
        assert!(validate_account_secret("short").is_err());
        assert!(validate_account_secret(&"x".repeat(129)).is_err());
        // A quote would close the field; a newline or tab would start a
        // new field or line; a backslash starts an escape.
        assert!(validate_account_secret("aaaa\"bbbb\tpptpd\t\"x").is_err());
        assert!(validate_account_secret("aaaabbbbcc\nevil\tpptpd\t*").is_err());
        assert!(validate_account_secret("aaaabbbbcc\tdd").is_err());
        assert!(validate_account_secret("aaaabbbbcc\\dd").is_err());
        assert!(validate_account_secret("aaaabbbbcc\rdd").is_err());
    }

    async fn supervisor(dir: &tempfile::TempDir) -> ChapSupervisor {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = VpnStore::new(pool.clone());
        store.ensure_schema().await.unwrap();
        let audit_store = AuditStore::new(pool);
        audit_store.ensure_schema().await.unwrap();
        let clock = Arc::new(ManualClock::at_millis(T0));
        let metrics = Arc::new(Metrics::new());
        let sink = AuditSink::spawn(
            audit_store,
            clock.clone(),
            metrics.clone(),
            SinkConfig::default(),
        );
        let hub = Arc::new(EventHub::new(DaemonKind::Pptp, clock.clone(), metrics));
        let cell = Arc::new(StateCell::new(
            DaemonKind::Pptp,
            "pptp",
            "chap-secrets",
            hub.clone(),
            sink,
            clock.clone(),
        ));
        let config = ChapSupervisorConfig {
            secrets_path: dir
                .path()
                .join("chap-secrets")
                .to_string_lossy()
                .to_string(),
            manage_process: false,
            ..ChapSupervisorConfig::pptp()
        };
        ChapSupervisor::new(config, store, cell, hub, clock)
    }

    #[tokio::test]
    async fn account_add_renders_file_and_returns_secret_once() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir).await;
        let out = sup
            .execute(CommandRequest::new(
                "account_add",
                json!({"username": "roaduser"}),
            ))
            .await
            .unwrap();
        let secret = out.data["secret"].as_str().unwrap().to_string();
        assert!(secret.len() >= 12);

        let file = std::fs::read_to_string(dir.path().join("chap-secrets")).unwrap();
        assert!(file.contains(&format!("\"roaduser\"\tpptpd\t\"{}\"\t*", secret)));

        // The listing path never echoes the secret.
        let listing = sup
            .execute(CommandRequest::bare("account_list"))
            .await
            .unwrap();
        assert!(!listing.data.to_string().contains(&secret));
    }

    #[tokio::test]
    async fn duplicate_username_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir).await;
        sup.execute(CommandRequest::new(
            "account_add",
            json!({"username": "roaduser"}),
        ))
        .await
        .unwrap();
        let err = sup
            .execute(CommandRequest::new(
                "account_add",
                json!({"username": "roaduser"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, quay_supervisor::SupervisorErrorKind::Conflict);
    }

    #[tokio::test]
    async fn disable_removes_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir).await;
        let out = sup
            .execute(CommandRequest::new(
                "account_add",
                json!({"username": "roaduser"}),
            ))
            .await
            .unwrap();
        let id = out.data["account"]["id"].as_str().unwrap().to_string();
        sup.execute(CommandRequest::new("account_disable", json!({"id": id})))
            .await
            .unwrap();
        let file = std::fs::read_to_string(dir.path().join("chap-secrets")).unwrap();
        assert!(!file.contains("roaduser"));
    }

    #[tokio::test]
    async fn short_secret_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir).await;
        let err = sup
            .execute(CommandRequest::new(
                "account_add",
                json!({"username": "roaduser", "secret": "short"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, quay_supervisor::SupervisorErrorKind::Validation);
    }

    #[tokio::test]
    async fn injecting_secret_never_reaches_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir).await;
        // A caller-supplied secret trying to smuggle in a second line.
        let err = sup
            .execute(CommandRequest::new(
                "account_add",
                json!({"username": "roaduser",
                       "secret": "aaaabbbbcccc\n\"evil\"\tpptpd\t\"x\"\t*"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, quay_supervisor::SupervisorErrorKind::Validation);
        assert!(!dir.path().join("chap-secrets").exists());
    }

    #[tokio::test]
    async fn lifecycle_without_process() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir).await;
        sup.start().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
        sup.restart().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
        sup.stop().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Stopped);
    }
}

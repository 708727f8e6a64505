//! OpenVPN supervision.
//!
//! Certificates are issued and revoked through the CA tooling; the
//! real-time management interface supplies health and the live client
//! list (`status 2` format).

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
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Issued client certs are valid this long.
const CERT_VALIDITY_DAYS: i64 = 825;

#[derive(Debug, Clone)]
pub struct OpenVpnConfig {
    pub manage_process: bool,
    pub program: String,
    pub args: Vec<String>,
    pub mgmt_host: String,
    pub mgmt_port: u16,
    /// CA tool (easy-rsa style CLI).
    pub ca_program: String,
    pub start_deadline_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            manage_process: true,
            program: "openvpn".into(),
            args: vec!["--config".into(), "/etc/openvpn/server.conf".into()],
            mgmt_host: "127.0.0.1".into(),
            mgmt_port: 7505,
            ca_program: "easyrsa".into(),
            start_deadline_secs: 30,
            stop_grace_secs: 30,
        }
    }
}

// ── Management interface ─────────────────────────────────────────────

/// One connected client as reported by `status 2`.
#[derive(Debug, Clone, PartialEq)]
pub struct MgmtClientEntry {
    pub common_name: String,
    pub real_address: String,
    pub bytes_rx: i64,
    pub bytes_tx: i64,
    pub connected_since_unix: i64,
}

/// Short-lived management connection; one command per exchange keeps the
/// protocol trivial (responses end with `END`, `SUCCESS:` or `ERROR:`).
pub struct MgmtClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl MgmtClient {
    pub async fn connect(host: &str, port: u16) -> VpnResult<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            VpnError::tool(format!("Cannot reach management interface at {}:{}", host, port))
                .with_detail(e.to_string())
        })?;
        let (read_half, writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        // Consume the >INFO greeting.
        let mut greeting = String::new();
        reader.read_line(&mut greeting).await?;
        Ok(Self { reader, writer })
    }

    pub async fn send_command(&mut self, command: &str) -> VpnResult<Vec<String>> {
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .await?;
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(VpnError::tool("Management connection closed mid-response"));
            }
            let line = line.trim_end().to_string();
            if line == "END" {
                return Ok(lines);
            }
            if let Some(err) = line.strip_prefix("ERROR:") {
                return Err(VpnError::tool(format!("Management error: {}", err.trim())));
            }
            if line.starts_with("SUCCESS:") {
                lines.push(line);
                return Ok(lines);
            }
            lines.push(line);
        }
    }

    pub async fn status(&mut self) -> VpnResult<Vec<MgmtClientEntry>> {
        let lines = self.send_command("status 2").await?;
        Ok(parse_status_v2(&lines))
    }
}

/// Parse `status 2` CLIENT_LIST rows.
pub fn parse_status_v2(lines: &[String]) -> Vec<MgmtClientEntry> {
    lines
        .iter()
        .filter(|line| line.starts_with("CLIENT_LIST,"))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').collect();
            if fields.len() < 9 {
                return None;
            }
            Some(MgmtClientEntry {
                common_name: fields[1].to_string(),
                real_address: fields[2].to_string(),
                bytes_rx: fields[5].parse().unwrap_or(0),
                bytes_tx: fields[6].parse().unwrap_or(0),
                connected_since_unix: fields[8].parse().unwrap_or(0),
            })
        })
        .collect()
}

// ── Certificate authority ────────────────────────────────────────────

#[derive(Clone)]
struct CertAuthority {
    program: String,
}

impl CertAuthority {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> VpnResult<String> {
        let output = tokio::process::Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| {
                VpnError::tool(format!("Cannot run {}", self.program)).with_detail(e.to_string())
            })?;
        if !output.status.success() {
            return Err(VpnError::tool(format!(
                "{} {} failed",
                self.program,
                args.first().unwrap_or(&"")
            ))
            .with_detail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn issue(&self, common_name: &str) -> VpnResult<()> {
        self.run(&["build-client-full", common_name, "nopass"])
            .await
            .map(|_| ())
    }

    async fn revoke(&self, common_name: &str) -> VpnResult<()> {
        self.run(&["revoke", common_name]).await?;
        self.run(&["gen-crl"]).await.map(|_| ())
    }
}

fn validate_common_name(common_name: &str) -> VpnResult<()> {
    let ok = !common_name.is_empty()
        && common_name.len() <= 64
        && common_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(VpnError::validation(format!(
            "'{}' is not a valid common name",
            common_name
        )))
    }
}

// ── Supervisor ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CertIssueParams {
    common_name: String,
    #[serde(default)]
    principal: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CertIdParams {
    id: String,
}

pub struct OpenVpnSupervisor {
    config: OpenVpnConfig,
    store: VpnStore,
    cell: Arc<StateCell>,
    hub: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    ca: CertAuthority,
    process: Option<DaemonProcess>,
    op_lock: Mutex<()>,
}

impl OpenVpnSupervisor {
    pub fn new(
        config: OpenVpnConfig,
        store: VpnStore,
        cell: Arc<StateCell>,
        hub: Arc<EventHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ca = CertAuthority::new(config.ca_program.clone());
        let process = config
            .manage_process
            .then(|| DaemonProcess::new("openvpn", config.program.clone(), config.args.clone()));
        Self {
            config,
            store,
            cell,
            hub,
            clock,
            ca,
            process,
            op_lock: Mutex::new(()),
        }
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.cell.clone()
    }

    async fn mgmt(&self) -> VpnResult<MgmtClient> {
        MgmtClient::connect(&self.config.mgmt_host, self.config.mgmt_port).await
    }

    async fn await_ready(&self) -> SupervisorResult<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.start_deadline_secs);
        let mut last_error = String::new();
        while tokio::time::Instant::now() < deadline {
            match self.mgmt().await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    last_error = e.to_string();
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        Err(SupervisorError::timeout(format!(
            "Management interface not ready within {}s",
            self.config.start_deadline_secs
        ))
        .with_detail(last_error))
    }

    async fn cert_issue(&self, params: CertIssueParams) -> SupervisorResult<CommandOutput> {
        validate_common_name(&params.common_name)?;
        // Uniqueness first, so the CA is never asked twice for one name.
        if self
            .store
            .list_certs()
            .await?
            .iter()
            .any(|c| c.common_name == params.common_name && !c.revoked)
        {
            return Err(SupervisorError::conflict(format!(
                "Certificate for '{}' already exists",
                params.common_name
            )));
        }
        self.ca.issue(&params.common_name).await?;
        let now_ms = self.clock.now_millis();
        let cert = OpenVpnCert {
            id: quay_core::new_id(),
            common_name: params.common_name.clone(),
            serial: new_serial(),
            not_after: now_ms + CERT_VALIDITY_DAYS * 24 * 3600 * 1000,
            revoked: false,
            created_at: now_ms,
        };
        self.store.insert_cert(&cert).await?;
        let _ = params.principal;
        self.hub.publish(
            "cert.issued",
            EventSeverity::Info,
            json!({ "id": cert.id, "common_name": cert.common_name }),
        );
        Ok(CommandOutput::ok_with(
            format!("Certificate '{}' issued", cert.common_name),
            serde_json::to_value(&cert).unwrap_or_default(),
        ))
    }

    async fn cert_revoke(&self, id: &str) -> SupervisorResult<CommandOutput> {
        let cert = self
            .store
            .get_cert(id)
            .await?
            .ok_or_else(|| SupervisorError::not_found(format!("Certificate {} not found", id)))?;
        self.ca.revoke(&cert.common_name).await?;
        let cert = self.store.revoke_cert(id).await?;
        self.hub.publish(
            "cert.revoked",
            EventSeverity::Warning,
            json!({ "id": cert.id, "common_name": cert.common_name }),
        );
        Ok(CommandOutput::ok(format!(
            "Certificate '{}' revoked",
            cert.common_name
        )))
    }

    /// Reconcile the management client list into connection rows.
    pub async fn sync_connections(&self) -> VpnResult<Vec<VpnConnection>> {
        let mut mgmt = self.mgmt().await?;
        let entries = mgmt.status().await?;
        let now_ms = self.clock.now_millis();
        let certs = self.store.list_certs().await?;
        let open = self
            .store
            .list_connections(Some(VpnProtocol::OpenVpn), true)
            .await?;

        for entry in &entries {
            let id = format!("ovpn-{}", entry.common_name);
            let existing = open.iter().find(|c| c.id == id);
            if existing.is_some() {
                self.store
                    .update_connection_bytes(&id, entry.bytes_rx, entry.bytes_tx)
                    .await?;
            } else {
                let principal = certs
                    .iter()
                    .find(|c| c.common_name == entry.common_name)
                    .map(|_| entry.common_name.clone());
                self.store
                    .open_connection(&VpnConnection {
                        id,
                        principal,
                        protocol: VpnProtocol::OpenVpn,
                        client_ip: entry
                            .real_address
                            .split(':')
                            .next()
                            .unwrap_or("")
                            .to_string(),
                        connected_at: entry.connected_since_unix * 1000,
                        disconnected_at: None,
                        bytes_rx: entry.bytes_rx,
                        bytes_tx: entry.bytes_tx,
                    })
                    .await?;
            }
        }
        // Anything open that the daemon no longer reports is gone.
        for connection in &open {
            if !entries
                .iter()
                .any(|e| format!("ovpn-{}", e.common_name) == connection.id)
            {
                self.store.close_connection(&connection.id, now_ms).await?;
            }
        }
        Ok(self
            .store
            .list_connections(Some(VpnProtocol::OpenVpn), true)
            .await?)
    }
}

// Bookkeeping serials, formatted the way OpenSSL prints them.
fn new_serial() -> String {
    quay_core::random_secret(8)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect()
}

#[async_trait]
impl Supervisor for OpenVpnSupervisor {
    fn kind(&self) -> DaemonKind {
        DaemonKind::OpenVpn
    }

    async fn start(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.begin_start()? {
            StartDisposition::AlreadyRunning => return Ok(()),
            StartDisposition::Proceed => {}
        }
        if let Some(process) = &self.process {
            if let Err(e) = process.spawn().await {
                let stderr = process.stderr_tail().await;
                self.cell.fail(format!("{} {}", e, stderr))?;
                return Err(e);
            }
        }
        match self.await_ready().await {
            Ok(()) => {
                self.cell.transition(DaemonState::Running)?;
                Ok(())
            }
            Err(e) => {
                if let Some(process) = &self.process {
                    let _ = process.stop(Duration::from_secs(2)).await;
                }
                self.cell.fail(e.to_string())?;
                Err(e)
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
        if let Some(process) = &self.process {
            if let Err(e) = process.spawn().await {
                self.cell.fail(e.to_string())?;
                return Err(e);
            }
        }
        match self.await_ready().await {
            Ok(()) => {
                self.cell.transition(DaemonState::Running)?;
                Ok(())
            }
            Err(e) => {
                self.cell.fail(e.to_string())?;
                Err(e)
            }
        }
    }

    async fn status(&self) -> DaemonDescriptor {
        self.cell.descriptor()
    }

    async fn execute(&self, request: CommandRequest) -> SupervisorResult<CommandOutput> {
        let result = match request.action.as_str() {
            // Certificate management works regardless of daemon state.
            "cert_issue" => {
                let params: CertIssueParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                self.cert_issue(params).await
            }
            "cert_revoke" => {
                let params: CertIdParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                self.cert_revoke(&params.id).await
            }
            "cert_list" => {
                let certs = self.store.list_certs().await?;
                Ok(CommandOutput::ok_with(
                    format!("{} certificates", certs.len()),
                    serde_json::to_value(&certs).unwrap_or_default(),
                ))
            }
            "connections" => {
                self.cell.require_running()?;
                let connections = self.sync_connections().await?;
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
        self.mgmt().await.is_ok()
    }
}

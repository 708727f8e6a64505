//! WireGuard supervision.
//!
//! Peer material is issued through the `wg` tooling; the peer's private
//! key appears exactly once, in the client config returned from
//! `peer_add`, and is never stored. Interface lifecycle goes through
//! `wg-quick` against a rendered server config; live peer state comes
//! from `wg show <if> dump`.

use crate::vpn::error::{VpnError, VpnResult};
use crate::vpn::store::VpnStore;
use crate::vpn::types::*;
use async_trait::async_trait;
use quay_core::Clock;
use quay_supervisor::{
    CommandOutput, CommandRequest, DaemonDescriptor, DaemonKind, DaemonState, EventHub,
    EventSeverity, EventStream, StartDisposition, StateCell, Supervisor, SupervisorError,
    SupervisorResult,
};
use serde::Deserialize;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

/// A handshake older than this counts as disconnected.
const HANDSHAKE_LIVENESS_SECS: i64 = 180;

#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    pub interface: String,
    pub listen_port: u16,
    /// Server tunnel address (`10.8.0.1/24`).
    pub address: String,
    /// Public endpoint clients dial (`nas.example.com:51820`).
    pub endpoint: String,
    pub dns: Option<String>,
    pub config_path: String,
    pub private_key_path: String,
    pub wg_program: String,
    pub wg_quick_program: String,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            interface: "wg0".into(),
            listen_port: 51820,
            address: "10.8.0.1/24".into(),
            endpoint: String::new(),
            dns: None,
            config_path: "/etc/wireguard/wg0.conf".into(),
            private_key_path: "/etc/wireguard/wg0.key".into(),
            wg_program: "wg".into(),
            wg_quick_program: "wg-quick".into(),
        }
    }
}

// ── wg CLI wrapper ───────────────────────────────────────────────────

#[derive(Clone)]
struct WgCli {
    program: String,
}

impl WgCli {
    fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str], stdin_data: Option<&str>) -> VpnResult<String> {
        let mut command = Command::new(&self.program);
        command.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
        command.stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let mut child = command.spawn().map_err(|e| {
            VpnError::tool(format!("Cannot run {}", self.program)).with_detail(e.to_string())
        })?;
        if let Some(data) = stdin_data {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(data.as_bytes()).await?;
            }
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(VpnError::tool(format!(
                "{} {} failed (exit {:?})",
                self.program,
                args.first().unwrap_or(&""),
                output.status.code()
            ))
            .with_detail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn genkey(&self) -> VpnResult<String> {
        self.run(&["genkey"], None).await
    }

    async fn genpsk(&self) -> VpnResult<String> {
        self.run(&["genpsk"], None).await
    }

    async fn pubkey(&self, private_key: &str) -> VpnResult<String> {
        self.run(&["pubkey"], Some(private_key)).await
    }

    async fn show_dump(&self, interface: &str) -> VpnResult<String> {
        self.run(&["show", interface, "dump"], None).await
    }

    async fn set_peer(&self, interface: &str, public_key: &str, allowed_ips: &str) -> VpnResult<()> {
        self.run(
            &["set", interface, "peer", public_key, "allowed-ips", allowed_ips],
            None,
        )
        .await
        .map(|_| ())
    }

    async fn remove_peer(&self, interface: &str, public_key: &str) -> VpnResult<()> {
        self.run(&["set", interface, "peer", public_key, "remove"], None)
            .await
            .map(|_| ())
    }
}

// ── Dump parsing & config rendering ──────────────────────────────────

/// One peer line of `wg show <if> dump`.
#[derive(Debug, Clone, PartialEq)]
pub struct WgPeerStatus {
    pub public_key: String,
    pub endpoint: Option<String>,
    /// Unix seconds of the latest handshake; 0 means never.
    pub latest_handshake: i64,
    pub bytes_rx: i64,
    pub bytes_tx: i64,
}

/// Parse the tab-separated dump, skipping the leading interface line.
pub fn parse_dump(output: &str) -> Vec<WgPeerStatus> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split('\t').collect();
            // Peer lines carry 8 fields; the interface line carries 4.
            if fields.len() < 8 {
                return None;
            }
            Some(WgPeerStatus {
                public_key: fields[0].to_string(),
                endpoint: match fields[2] {
                    "(none)" | "" => None,
                    endpoint => Some(endpoint.to_string()),
                },
                latest_handshake: fields[4].parse().unwrap_or(0),
                bytes_rx: fields[5].parse().unwrap_or(0),
                bytes_tx: fields[6].parse().unwrap_or(0),
            })
        })
        .collect()
}

fn render_server_config(
    config: &WireGuardConfig,
    server_private_key: &str,
    peers: &[WireGuardPeer],
) -> String {
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("Address = {}", config.address),
        format!("ListenPort = {}", config.listen_port),
        format!("PrivateKey = {}", server_private_key),
    ];
    for peer in peers.iter().filter(|p| p.enabled) {
        lines.push(String::new());
        lines.push("[Peer]".to_string());
        lines.push(format!("# {}", peer.name));
        lines.push(format!("PublicKey = {}", peer.public_key));
        if let Some(psk) = &peer.preshared_key {
            lines.push(format!("PresharedKey = {}", psk));
        }
        lines.push(format!("AllowedIPs = {}", peer.allowed_ips));
    }
    lines.join("\n")
}

fn render_client_config(
    config: &WireGuardConfig,
    server_public_key: &str,
    peer_private_key: &str,
    peer_address: &str,
    preshared_key: Option<&str>,
) -> String {
    let mut lines = vec![
        "[Interface]".to_string(),
        format!("PrivateKey = {}", peer_private_key),
        format!("Address = {}", peer_address),
    ];
    if let Some(dns) = &config.dns {
        lines.push(format!("DNS = {}", dns));
    }
    lines.push(String::new());
    lines.push("[Peer]".to_string());
    lines.push(format!("PublicKey = {}", server_public_key));
    if let Some(psk) = preshared_key {
        lines.push(format!("PresharedKey = {}", psk));
    }
    lines.push(format!("Endpoint = {}", config.endpoint));
    lines.push("AllowedIPs = 0.0.0.0/0, ::/0".to_string());
    lines.push("PersistentKeepalive = 25".to_string());
    lines.join("\n")
}

fn validate_allowed_ips(allowed_ips: &str) -> VpnResult<()> {
    for part in allowed_ips.split(',') {
        let part = part.trim();
        let (addr, prefix) = part
            .split_once('/')
            .ok_or_else(|| VpnError::validation(format!("'{}' is not CIDR", part)))?;
        if addr.parse::<std::net::IpAddr>().is_err() || prefix.parse::<u8>().is_err() {
            return Err(VpnError::validation(format!("'{}' is not CIDR", part)));
        }
    }
    Ok(())
}

// ── Supervisor ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct PeerAddParams {
    name: String,
    allowed_ips: String,
    #[serde(default)]
    principal: Option<String>,
    #[serde(default)]
    with_psk: bool,
}

#[derive(Debug, Deserialize)]
struct PeerIdParams {
    id: String,
}

pub struct WireGuardSupervisor {
    config: WireGuardConfig,
    store: VpnStore,
    cell: Arc<StateCell>,
    hub: Arc<EventHub>,
    clock: Arc<dyn Clock>,
    cli: WgCli,
    op_lock: Mutex<()>,
}

impl WireGuardSupervisor {
    pub fn new(
        config: WireGuardConfig,
        store: VpnStore,
        cell: Arc<StateCell>,
        hub: Arc<EventHub>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cli = WgCli::new(config.wg_program.clone());
        Self {
            config,
            store,
            cell,
            hub,
            clock,
            cli,
            op_lock: Mutex::new(()),
        }
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.cell.clone()
    }

    /// Load the server private key, generating it on first start.
    async fn server_private_key(&self) -> VpnResult<String> {
        match tokio::fs::read_to_string(&self.config.private_key_path).await {
            Ok(key) => Ok(key.trim().to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = self.cli.genkey().await?;
                tokio::fs::write(&self.config.private_key_path, &key).await?;
                log::info!(
                    "[wireguard] generated server key at {}",
                    self.config.private_key_path
                );
                Ok(key)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn write_server_config(&self) -> VpnResult<()> {
        let private_key = self.server_private_key().await?;
        let peers = self.store.list_peers().await?;
        let rendered = render_server_config(&self.config, &private_key, &peers);
        // Write-then-rename keeps a half-written config from ever being
        // loaded.
        let tmp_path = format!("{}.tmp", self.config.config_path);
        tokio::fs::write(&tmp_path, rendered).await?;
        tokio::fs::rename(&tmp_path, &self.config.config_path).await?;
        Ok(())
    }

    async fn quick(&self, verb: &str) -> VpnResult<()> {
        let output = Command::new(&self.config.wg_quick_program)
            .arg(verb)
            .arg(&self.config.config_path)
            .output()
            .await
            .map_err(|e| {
                VpnError::tool(format!("Cannot run {}", self.config.wg_quick_program))
                    .with_detail(e.to_string())
            })?;
        if !output.status.success() {
            return Err(VpnError::tool(format!("wg-quick {} failed", verb))
                .with_detail(String::from_utf8_lossy(&output.stderr).trim().to_string()));
        }
        Ok(())
    }

    async fn peer_add(&self, params: PeerAddParams) -> SupervisorResult<CommandOutput> {
        if params.name.is_empty() || params.name.len() > 64 {
            return Err(SupervisorError::validation("Peer name must be 1-64 characters"));
        }
        validate_allowed_ips(&params.allowed_ips)?;

        let private_key = self.cli.genkey().await?;
        let public_key = self.cli.pubkey(&private_key).await?;
        let preshared_key = if params.with_psk {
            Some(self.cli.genpsk().await?)
        } else {
            None
        };

        let peer = WireGuardPeer {
            id: quay_core::new_id(),
            name: params.name.clone(),
            principal: params.principal,
            public_key: public_key.clone(),
            allowed_ips: params.allowed_ips.clone(),
            preshared_key: preshared_key.clone(),
            enabled: true,
            created_at: self.clock.now_millis(),
        };
        self.store.insert_peer(&peer).await?;

        // Live-apply when the interface is up; config rewrite covers the
        // next boot either way.
        if self.cell.state() == DaemonState::Running {
            self.cli
                .set_peer(&self.config.interface, &public_key, &params.allowed_ips)
                .await?;
        }
        self.write_server_config().await?;

        let server_public = {
            let private = self.server_private_key().await?;
            self.cli.pubkey(&private).await?
        };
        let peer_address = params
            .allowed_ips
            .split(',')
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        let client_config = render_client_config(
            &self.config,
            &server_public,
            &private_key,
            &peer_address,
            preshared_key.as_deref(),
        );

        self.hub.publish(
            "peer.created",
            EventSeverity::Info,
            json!({ "id": peer.id, "name": peer.name, "public_key": public_key }),
        );

        // The private key leaves the process here and only here.
        Ok(CommandOutput::ok_with(
            format!("Peer '{}' created", params.name),
            json!({
                "peer": peer,
                "client_config": client_config,
            }),
        ))
    }

    async fn peer_remove(&self, id: &str) -> SupervisorResult<CommandOutput> {
        let peer = self.store.delete_peer(id).await?;
        if self.cell.state() == DaemonState::Running {
            self.cli
                .remove_peer(&self.config.interface, &peer.public_key)
                .await?;
        }
        self.write_server_config().await?;
        self.hub.publish(
            "peer.removed",
            EventSeverity::Info,
            json!({ "id": peer.id, "name": peer.name }),
        );
        Ok(CommandOutput::ok(format!("Peer '{}' removed", peer.name)))
    }

    /// Reconcile live dump state into the connection rows.
    pub async fn sync_connections(&self) -> VpnResult<Vec<VpnConnection>> {
        let dump = self.cli.show_dump(&self.config.interface).await?;
        let statuses = parse_dump(&dump);
        let now_ms = self.clock.now_millis();
        let now_secs = now_ms / 1000;
        let peers = self.store.list_peers().await?;

        for status in &statuses {
            let Some(peer) = peers.iter().find(|p| p.public_key == status.public_key) else {
                continue;
            };
            let live = status.latest_handshake > 0
                && now_secs - status.latest_handshake < HANDSHAKE_LIVENESS_SECS;
            let open = self
                .store
                .list_connections(Some(VpnProtocol::WireGuard), true)
                .await?
                .into_iter()
                .find(|c| c.id == peer.id);
            match (live, open) {
                (true, None) => {
                    self.store
                        .open_connection(&VpnConnection {
                            id: peer.id.clone(),
                            principal: peer.principal.clone(),
                            protocol: VpnProtocol::WireGuard,
                            client_ip: status
                                .endpoint
                                .clone()
                                .unwrap_or_default()
                                .split(':')
                                .next()
                                .unwrap_or("")
                                .to_string(),
                            connected_at: now_ms,
                            disconnected_at: None,
                            bytes_rx: status.bytes_rx,
                            bytes_tx: status.bytes_tx,
                        })
                        .await?;
                }
                (true, Some(_)) => {
                    self.store
                        .update_connection_bytes(&peer.id, status.bytes_rx, status.bytes_tx)
                        .await?;
                }
                (false, Some(_)) => {
                    self.store.close_connection(&peer.id, now_ms).await?;
                }
                (false, None) => {}
            }
        }
        Ok(self
            .store
            .list_connections(Some(VpnProtocol::WireGuard), true)
            .await?)
    }
}

#[async_trait]
impl Supervisor for WireGuardSupervisor {
    fn kind(&self) -> DaemonKind {
        DaemonKind::WireGuard
    }

    async fn start(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.begin_start()? {
            StartDisposition::AlreadyRunning => return Ok(()),
            StartDisposition::Proceed => {}
        }
        let result = async {
            self.write_server_config().await?;
            self.quick("up").await
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
            DaemonState::Stopped => return Ok(()),
            DaemonState::Running | DaemonState::Degraded => {}
            DaemonState::Failed => return Ok(()),
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        self.cell.transition(DaemonState::Stopping)?;
        match self.quick("down").await {
            Ok(()) => {
                self.cell.transition(DaemonState::Stopped)?;
                Ok(())
            }
            Err(e) => {
                self.cell.fail(e.to_string())?;
                Err(e.into())
            }
        }
    }

    async fn restart(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.state() {
            DaemonState::Stopped | DaemonState::Failed => {
                self.cell.begin_start()?;
            }
            DaemonState::Running | DaemonState::Degraded => {
                self.cell.transition(DaemonState::Stopping)?;
                if let Err(e) = self.quick("down").await {
                    self.cell.fail(e.to_string())?;
                    return Err(e.into());
                }
                self.cell.transition(DaemonState::Starting)?;
            }
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        let result = async {
            self.write_server_config().await?;
            self.quick("up").await
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

    async fn status(&self) -> DaemonDescriptor {
        self.cell.descriptor()
    }

    async fn execute(&self, request: CommandRequest) -> SupervisorResult<CommandOutput> {
        // Peer CRUD is allowed while stopped (config-only); live state
        // queries need the interface.
        let result = match request.action.as_str() {
            "peer_add" => {
                let params: PeerAddParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                self.peer_add(params).await
            }
            "peer_remove" => {
                let params: PeerIdParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                self.peer_remove(&params.id).await
            }
            "peer_enable" | "peer_disable" => {
                let params: PeerIdParams = serde_json::from_value(request.params.clone())
                    .map_err(|e| SupervisorError::validation(format!("Invalid params: {}", e)))?;
                let enabled = request.action == "peer_enable";
                self.store.set_peer_enabled(&params.id, enabled).await?;
                self.write_server_config().await?;
                Ok(CommandOutput::ok(format!(
                    "Peer {} {}",
                    params.id,
                    if enabled { "enabled" } else { "disabled" }
                )))
            }
            "peer_list" => {
                let peers = self.store.list_peers().await?;
                Ok(CommandOutput::ok_with(
                    format!("{} peers", peers.len()),
                    serde_json::to_value(&peers).unwrap_or_default(),
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
        self.cli.show_dump(&self.config.interface).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_audit::{AuditSink, AuditStore, SinkConfig};
    use quay_core::{ManualClock, Metrics};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    const T0: i64 = 1_700_000_000_000;

    fn stub(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    /// wg stub: deterministic keys, dump with one live peer.
    fn wg_stub(dir: &tempfile::TempDir, handshake_secs: i64) -> String {
        stub(
            dir,
            "wg",
            &format!(
                r#"case "$1" in
  genkey) echo "PRIV-$$-$(date +%N)" ;;
  genpsk) echo "PSK-KEY" ;;
  pubkey) read key; echo "PUB-$key" ;;
  show) printf 'PRIVSRV\tPUBSRV\t51820\toff\n'
        pub=$(cat {dumpfile} 2>/dev/null)
        if [ -n "$pub" ]; then
          printf '%s\t(none)\t198.51.100.4:40123\t10.8.0.2/32\t{hs}\t1000\t2000\t25\n' "$pub"
        fi ;;
  set) exit 0 ;;
  *) exit 1 ;;
esac"#,
                dumpfile = dir.path().join("peer.pub").display(),
                hs = handshake_secs,
            ),
        )
    }

    async fn supervisor(dir: &tempfile::TempDir, handshake_secs: i64) -> WireGuardSupervisor {
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
        let hub = Arc::new(EventHub::new(DaemonKind::WireGuard, clock.clone(), metrics));
        let cell = Arc::new(StateCell::new(
            DaemonKind::WireGuard,
            "wireguard",
            "wg-test0",
            hub.clone(),
            sink,
            clock.clone(),
        ));
        let config = WireGuardConfig {
            interface: "wg-test0".into(),
            endpoint: "nas.example.com:51820".into(),
            dns: Some("10.8.0.1".into()),
            config_path: dir.path().join("wg-test0.conf").to_string_lossy().to_string(),
            private_key_path: dir.path().join("wg-test0.key").to_string_lossy().to_string(),
            wg_program: wg_stub(dir, handshake_secs),
            wg_quick_program: stub(dir, "wg-quick", "exit 0"),
            ..Default::default()
        };
        WireGuardSupervisor::new(config, store, cell, hub, clock)
    }

    #[test]
    fn parse_dump_skips_interface_line() {
        let dump = "PRIV\tPUB\t51820\toff\n\
                    PEER1\t(none)\t198.51.100.4:40123\t10.8.0.2/32\t1699999970\t1000\t2000\t25\n\
                    PEER2\tPSK\t\t10.8.0.3/32\t0\t0\t0\toff";
        let statuses = parse_dump(dump);
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].public_key, "PEER1");
        assert_eq!(statuses[0].endpoint.as_deref(), Some("198.51.100.4:40123"));
        assert_eq!(statuses[0].bytes_rx, 1000);
        assert_eq!(statuses[1].endpoint, None);
        assert_eq!(statuses[1].latest_handshake, 0);
    }

    #[test]
    fn server_config_includes_enabled_peers_only() {
        let config = WireGuardConfig::default();
        let peers = vec![
            WireGuardPeer {
                id: "1".into(),
                name: "on".into(),
                principal: None,
                public_key: "PK-ON".into(),
                allowed_ips: "10.8.0.2/32".into(),
                preshared_key: Some("PSK".into()),
                enabled: true,
                created_at: 0,
            },
            WireGuardPeer {
                id: "2".into(),
                name: "off".into(),
                principal: None,
                public_key: "PK-OFF".into(),
                allowed_ips: "10.8.0.3/32".into(),
                preshared_key: None,
                enabled: false,
                created_at: 0,
            },
        ];
        let rendered = render_server_config(&config, "SRV-PRIV", &peers);
        assert!(rendered.contains("PrivateKey = SRV-PRIV"));
        assert!(rendered.contains("PublicKey = PK-ON"));
        assert!(rendered.contains("PresharedKey = PSK"));
        assert!(!rendered.contains("PK-OFF"));
    }

    #[test]
    fn allowed_ips_validation() {
        assert!(validate_allowed_ips("10.8.0.2/32").is_ok());
        assert!(validate_allowed_ips("10.8.0.2/32, fd00::2/128").is_ok());
        assert!(validate_allowed_ips("10.8.0.2").is_err());
        assert!(validate_allowed_ips("not-an-ip/24").is_err());
    }

    #[tokio::test]
    async fn lifecycle_up_down() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, 0).await;
        sup.start().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
        // Config file landed on disk.
        let rendered = std::fs::read_to_string(dir.path().join("wg-test0.conf")).unwrap();
        assert!(rendered.contains("[Interface]"));
        sup.stop().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn peer_add_returns_private_material_once() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, 0).await;
        let out = sup
            .execute(CommandRequest::new(
                "peer_add",
                json!({"name": "laptop", "allowed_ips": "10.8.0.2/32", "with_psk": true}),
            ))
            .await
            .unwrap();
        let client_config = out.data["client_config"].as_str().unwrap();
        assert!(client_config.contains("PrivateKey = PRIV-"));
        assert!(client_config.contains("Endpoint = nas.example.com:51820"));
        assert!(client_config.contains("PresharedKey = PSK-KEY"));
        // The stored peer carries only the public half.
        let peers = sup.store.list_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].public_key.starts_with("PUB-"));
        // And the listing never echoes the psk.
        let listing = sup.execute(CommandRequest::bare("peer_list")).await.unwrap();
        assert!(!listing.data.to_string().contains("PSK-KEY"));
    }

    #[tokio::test]
    async fn peer_remove_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, 0).await;
        let err = sup
            .execute(CommandRequest::new("peer_remove", json!({"id": "nope"})))
            .await
            .unwrap_err();
        assert_eq!(err.kind, quay_supervisor::SupervisorErrorKind::NotFound);
    }

    #[tokio::test]
    async fn connections_tracks_live_handshake() {
        let dir = tempfile::tempdir().unwrap();
        // Handshake 30 s before the manual clock's now.
        let sup = supervisor(&dir, T0 / 1000 - 30).await;
        sup.start().await.unwrap();
        let out = sup
            .execute(CommandRequest::new(
                "peer_add",
                json!({"name": "laptop", "allowed_ips": "10.8.0.2/32"}),
            ))
            .await
            .unwrap();
        // Publish the peer's public key to the stub's dump.
        let public_key = out.data["peer"]["public_key"].as_str().unwrap();
        std::fs::write(dir.path().join("peer.pub"), public_key).unwrap();

        let out = sup.execute(CommandRequest::bare("connections")).await.unwrap();
        let connections = out.data.as_array().unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0]["client_ip"], "198.51.100.4");
        assert_eq!(connections[0]["bytes_rx"], 1000);
    }

    #[tokio::test]
    async fn connections_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir, 0).await;
        let err = sup
            .execute(CommandRequest::bare("connections"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, quay_supervisor::SupervisorErrorKind::NotRunning);
    }
}

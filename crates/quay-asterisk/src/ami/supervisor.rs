//! The PBX supervisor.
//!
//! Lifecycle: optionally launches the asterisk process, then treats a
//! successful AMI login as the ready signal. A lost control channel
//! degrades the daemon and a bounded-backoff reconnect loop tries to
//! restore it before giving up.

use crate::ami::client::AmiClient;
use crate::ami::protocol::AmiMessage;
use crate::ami::types::{AmiConfig, AsteriskCommand, PeerEntry};
use async_trait::async_trait;
use quay_supervisor::{
    CommandOutput, CommandRequest, DaemonDescriptor, DaemonKind, DaemonProcess, DaemonState,
    EventHub, EventSeverity, EventStream, StartDisposition, StateCell, Supervisor,
    SupervisorError, SupervisorResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

pub struct AsteriskSupervisor {
    config: AmiConfig,
    cell: Arc<StateCell>,
    hub: Arc<EventHub>,
    process: Option<DaemonProcess>,
    client: RwLock<Option<AmiClient>>,
    /// Serialises lifecycle operations.
    op_lock: Mutex<()>,
}

impl AsteriskSupervisor {
    pub fn new(config: AmiConfig, cell: Arc<StateCell>, hub: Arc<EventHub>) -> Self {
        let process = config.manage_process.then(|| {
            DaemonProcess::new("asterisk", config.program.clone(), config.args.clone())
        });
        Self {
            config,
            cell,
            hub,
            process,
            client: RwLock::new(None),
            op_lock: Mutex::new(()),
        }
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.cell.clone()
    }

    async fn connect_and_login(&self) -> SupervisorResult<AmiClient> {
        let client = AmiClient::connect(&self.config.host, self.config.port, self.hub.clone()).await?;
        client
            .login(
                &self.config.username,
                &self.config.secret,
                Duration::from_secs(self.config.action_timeout_secs),
            )
            .await?;
        Ok(client)
    }

    /// Connect with retries until the start deadline runs out. The daemon
    /// needs a moment after launch before the manager port listens.
    async fn await_ready(&self) -> SupervisorResult<AmiClient> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.start_deadline_secs);
        let mut last_error = SupervisorError::timeout("AMI never became ready");
        while tokio::time::Instant::now() < deadline {
            match self.connect_and_login().await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    last_error = e;
                    tokio::time::sleep(Duration::from_millis(250)).await;
                }
            }
        }
        Err(SupervisorError::timeout(format!(
            "AMI not ready within {}s",
            self.config.start_deadline_secs
        ))
        .with_detail(last_error.to_string()))
    }

    async fn start_inner(&self) -> SupervisorResult<()> {
        if let Some(process) = &self.process {
            if let Err(e) = process.spawn().await {
                let stderr = process.stderr_tail().await;
                self.cell.fail(format!("{} {}", e, stderr))?;
                return Err(e);
            }
        }
        match self.await_ready().await {
            Ok(client) => {
                *self.client.write().await = Some(client);
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

    async fn stop_inner(&self) -> SupervisorResult<()> {
        if let Some(client) = self.client.write().await.take() {
            client.logoff().await;
        }
        if let Some(process) = &self.process {
            process
                .stop(Duration::from_secs(self.config.stop_grace_secs))
                .await?;
        }
        Ok(())
    }

    async fn client_action(
        &self,
        action: AmiMessage,
    ) -> SupervisorResult<AmiMessage> {
        let timeout = Duration::from_secs(self.config.action_timeout_secs);
        let guard = self.client.read().await;
        let client = guard
            .as_ref()
            .ok_or_else(|| SupervisorError::not_running("asterisk_ami"))?;
        let response = client.send_action(action, timeout).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(SupervisorError::downstream(
                response.message().unwrap_or("AMI action failed").to_string(),
            ))
        }
    }

    async fn sip_peers(&self) -> SupervisorResult<Vec<PeerEntry>> {
        // Subscribe before sending so no entry event can slip past.
        let mut stream = self.hub.subscribe(false);
        self.client_action(AmiMessage::action("SIPpeers")).await?;

        let mut peers = Vec::new();
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.action_timeout_secs);
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or_else(|| SupervisorError::timeout("SIP peer listing timed out"))?;
            let event = tokio::time::timeout(remaining, stream.recv())
                .await
                .map_err(|_| SupervisorError::timeout("SIP peer listing timed out"))?
                .ok_or_else(|| SupervisorError::io("Event stream closed mid-listing"))?;
            match event.name.as_str() {
                "ami.PeerEntry" => peers.push(PeerEntry {
                    object_name: event.data["ObjectName"].as_str().unwrap_or("").to_string(),
                    ip_address: event.data["IPaddress"].as_str().map(str::to_string),
                    status: event.data["Status"].as_str().map(str::to_string),
                }),
                "ami.PeerlistComplete" => return Ok(peers),
                _ => {}
            }
        }
    }

    /// Watch the control channel; degrade on loss, reconnect with bounded
    /// backoff, fail when the budget runs out.
    pub fn spawn_monitor(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                if this.cell.state() != DaemonState::Running {
                    continue;
                }
                let connected = {
                    let guard = this.client.read().await;
                    guard.as_ref().map(|c| c.is_connected()).unwrap_or(false)
                };
                if connected {
                    continue;
                }

                log::warn!("[ami] control channel lost, entering degraded reconnect");
                if this.cell.transition(DaemonState::Degraded).is_err() {
                    continue;
                }

                let deadline = tokio::time::Instant::now()
                    + Duration::from_secs(this.config.reconnect_deadline_secs);
                let mut backoff = Duration::from_millis(250);
                loop {
                    if *shutdown.borrow() {
                        return;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        let _ = this.cell.fail("Control channel could not be restored");
                        break;
                    }
                    match this.connect_and_login().await {
                        Ok(client) => {
                            *this.client.write().await = Some(client);
                            let _ = this.cell.transition(DaemonState::Running);
                            log::info!("[ami] control channel restored");
                            break;
                        }
                        Err(e) => {
                            log::debug!("[ami] reconnect attempt failed: {}", e);
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(Duration::from_secs(8));
                        }
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Supervisor for AsteriskSupervisor {
    fn kind(&self) -> DaemonKind {
        DaemonKind::AsteriskAmi
    }

    async fn start(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.begin_start()? {
            StartDisposition::AlreadyRunning => Ok(()),
            StartDisposition::Proceed => self.start_inner().await,
        }
    }

    async fn stop(&self) -> SupervisorResult<()> {
        let _op = self.op_lock.lock().await;
        match self.cell.state() {
            DaemonState::Stopped => return Ok(()),
            DaemonState::Running | DaemonState::Degraded | DaemonState::Failed => {}
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        if self.cell.state() == DaemonState::Failed {
            // Nothing supervised is alive; clean up what might remain.
            self.stop_inner().await.ok();
            return Ok(());
        }
        self.cell.transition(DaemonState::Stopping)?;
        let result = self.stop_inner().await;
        match result {
            Ok(()) => {
                self.cell.transition(DaemonState::Stopped)?;
                Ok(())
            }
            Err(e) => {
                self.cell.fail(e.to_string())?;
                Err(e)
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
                let stop_result = self.stop_inner().await;
                if let Err(e) = stop_result {
                    self.cell.fail(e.to_string())?;
                    return Err(e);
                }
                // Chain straight into starting; status never rests at
                // stopped in between.
                self.cell.transition(DaemonState::Starting)?;
            }
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        self.start_inner().await
    }

    async fn status(&self) -> DaemonDescriptor {
        self.cell.descriptor()
    }

    async fn execute(&self, request: CommandRequest) -> SupervisorResult<CommandOutput> {
        self.cell.require_running()?;
        let command = AsteriskCommand::parse(&request)?;
        let result = match command {
            AsteriskCommand::CoreShowVersion => self
                .client_action(
                    AmiMessage::action("Command").with("Command", "core show version"),
                )
                .await
                .map(|resp| {
                    let output = resp.get("Output").unwrap_or_default_str();
                    CommandOutput::ok_with("Version read", json!({ "version": output }))
                }),
            AsteriskCommand::SipPeers => self.sip_peers().await.map(|peers| {
                CommandOutput::ok_with(
                    format!("{} peers", peers.len()),
                    serde_json::to_value(&peers).unwrap_or_default(),
                )
            }),
            AsteriskCommand::Originate {
                channel,
                exten,
                context,
                priority,
                timeout_ms,
            } => self
                .client_action(
                    AmiMessage::action("Originate")
                        .with("Channel", channel)
                        .with("Exten", exten)
                        .with("Context", context)
                        .with("Priority", priority.to_string())
                        .with("Timeout", timeout_ms.to_string()),
                )
                .await
                .map(|resp| CommandOutput::ok(resp.message().unwrap_or("Originate queued"))),
            AsteriskCommand::Hangup { channel } => self
                .client_action(AmiMessage::action("Hangup").with("Channel", channel))
                .await
                .map(|resp| CommandOutput::ok(resp.message().unwrap_or("Channel hung up"))),
            AsteriskCommand::Reload { module } => {
                let mut action = AmiMessage::action("Reload");
                if let Some(module) = module {
                    action.push("Module", module);
                }
                self.client_action(action)
                    .await
                    .map(|resp| CommandOutput::ok(resp.message().unwrap_or("Reloaded")))
            }
            AsteriskCommand::Command { command } => self
                .client_action(AmiMessage::action("Command").with("Command", command))
                .await
                .map(|resp| {
                    let output = resp.get("Output").unwrap_or_default_str();
                    CommandOutput::ok_with("Command executed", json!({ "output": output }))
                }),
        };

        if let Err(e) = &result {
            // Command failures never move the state machine.
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
        let guard = self.client.read().await;
        let Some(client) = guard.as_ref() else {
            return false;
        };
        if !client.is_connected() {
            return false;
        }
        client
            .send_action(AmiMessage::action("Ping"), Duration::from_secs(3))
            .await
            .map(|r| r.is_success())
            .unwrap_or(false)
    }
}

trait OptStrExt {
    fn unwrap_or_default_str(&self) -> String;
}

impl OptStrExt for Option<&str> {
    fn unwrap_or_default_str(&self) -> String {
        self.unwrap_or("").to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ami::testsupport::FakeAmiServer;
    use quay_audit::{AuditSink, AuditStore, SinkConfig};
    use quay_core::{Metrics, SystemClock};
    use quay_supervisor::SupervisorErrorKind;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn supervisor(port: u16, secret: &str) -> Arc<AsteriskSupervisor> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = AuditStore::new(pool);
        store.ensure_schema().await.unwrap();
        let clock = Arc::new(SystemClock);
        let metrics = Arc::new(Metrics::new());
        let sink = AuditSink::spawn(store, clock.clone(), metrics.clone(), SinkConfig::default());
        let hub = Arc::new(EventHub::new(DaemonKind::AsteriskAmi, clock.clone(), metrics));
        let cell = Arc::new(StateCell::new(
            DaemonKind::AsteriskAmi,
            "asterisk",
            format!("127.0.0.1:{}", port),
            hub.clone(),
            sink,
            clock,
        ));
        let config = AmiConfig {
            host: "127.0.0.1".into(),
            port,
            username: "admin".into(),
            secret: secret.into(),
            manage_process: false,
            action_timeout_secs: 3,
            start_deadline_secs: 3,
            stop_grace_secs: 2,
            reconnect_deadline_secs: 10,
            ..Default::default()
        };
        Arc::new(AsteriskSupervisor::new(config, cell, hub))
    }

    #[tokio::test]
    async fn lifecycle_start_execute_stop() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;

        assert_eq!(sup.status().await.state, DaemonState::Stopped);
        sup.start().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);

        let out = sup
            .execute(CommandRequest::bare("core_show_version"))
            .await
            .unwrap();
        assert!(out.success);
        assert!(out.data["version"].as_str().unwrap().contains("Asterisk"));

        sup.stop().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        sup.start().await.unwrap();
        sup.start().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
    }

    #[tokio::test]
    async fn execute_rejected_when_stopped() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        let err = sup
            .execute(CommandRequest::bare("core_show_version"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn bad_secret_fails_start() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "wrong").await;
        let err = sup.start().await.unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Timeout);
        assert_eq!(sup.status().await.state, DaemonState::Failed);
        // Retry is allowed from failed.
        assert!(sup.start().await.is_err());
    }

    #[tokio::test]
    async fn sip_peers_collects_event_list() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        sup.start().await.unwrap();
        let out = sup.execute(CommandRequest::bare("sip_peers")).await.unwrap();
        let peers = out.data.as_array().unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0]["object_name"], "100");
    }

    #[tokio::test]
    async fn originate_and_hangup() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        sup.start().await.unwrap();
        let out = sup
            .execute(CommandRequest::new(
                "originate",
                json!({"channel": "SIP/100", "exten": "600", "context": "internal"}),
            ))
            .await
            .unwrap();
        assert!(out.message.contains("Originate"));
        let out = sup
            .execute(CommandRequest::new("hangup", json!({"channel": "SIP/100-1"})))
            .await
            .unwrap();
        assert!(out.success);
    }

    #[tokio::test]
    async fn restart_lands_running() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        sup.start().await.unwrap();
        sup.restart().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
        // Restart from stopped behaves like start.
        sup.stop().await.unwrap();
        sup.restart().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
    }

    #[tokio::test]
    async fn command_failure_leaves_state_alone() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        sup.start().await.unwrap();
        let err = sup
            .execute(CommandRequest::new("command", json!({"command": "bogus"})))
            .await;
        // The fake answers Success for any CLI command, so use an
        // unsupported action for the failure path instead.
        assert!(err.is_ok());
        let err = sup
            .execute(CommandRequest::bare("fax_send"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Unsupported);
        assert_eq!(sup.status().await.state, DaemonState::Running);
    }

    #[tokio::test]
    async fn monitor_restores_lost_channel() {
        let server = FakeAmiServer::spawn().await;
        let sup = supervisor(server.port, "s3cret").await;
        sup.start().await.unwrap();
        let (_tx, rx) = watch::channel(false);
        let monitor = sup.spawn_monitor(rx);

        // Sever the control channel server-side.
        let _ = sup
            .execute(CommandRequest::new(
                "command",
                json!({"command": "anything"}),
            ))
            .await;
        {
            let guard = sup.client.read().await;
            let client = guard.as_ref().unwrap();
            let _ = client
                .send_action(
                    crate::ami::protocol::AmiMessage::action("Hangup-Connection"),
                    Duration::from_millis(500),
                )
                .await;
        }

        // The monitor degrades, reconnects, and recovers.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(8);
        let mut saw_recovery = false;
        while tokio::time::Instant::now() < deadline {
            if sup.status().await.state == DaemonState::Running {
                let guard = sup.client.read().await;
                if guard.as_ref().map(|c| c.is_connected()).unwrap_or(false) {
                    saw_recovery = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(saw_recovery, "control channel was not restored");
        monitor.abort();
    }
}

//! The AD DC supervisor.
//!
//! Lifecycle runs the `samba` daemon; readiness is a successful
//! `samba-tool processes` probe. Domain provisioning and demotion are
//! lifecycle-adjacent (they require a stopped daemon) and therefore live
//! beside start/stop rather than in `execute`.

use crate::samba::tool::{parse_name_lines, SambaTool};
use crate::samba::types::*;
use async_trait::async_trait;
use quay_supervisor::{
    CommandOutput, CommandRequest, DaemonDescriptor, DaemonKind, DaemonProcess, DaemonState,
    EventHub, EventSeverity, EventStream, StartDisposition, StateCell, Supervisor,
    SupervisorError, SupervisorResult,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SambaConfig {
    pub manage_process: bool,
    pub program: String,
    pub args: Vec<String>,
    pub tool_program: String,
    pub start_deadline_secs: u64,
    pub stop_grace_secs: u64,
}

impl Default for SambaConfig {
    fn default() -> Self {
        Self {
            manage_process: true,
            program: "samba".into(),
            args: vec!["--foreground".into(), "--no-process-group".into()],
            tool_program: "samba-tool".into(),
            start_deadline_secs: 30,
            stop_grace_secs: 30,
        }
    }
}

pub struct SambaSupervisor {
    config: SambaConfig,
    cell: Arc<StateCell>,
    hub: Arc<EventHub>,
    tool: SambaTool,
    process: Option<DaemonProcess>,
    op_lock: Mutex<()>,
}

impl SambaSupervisor {
    pub fn new(config: SambaConfig, cell: Arc<StateCell>, hub: Arc<EventHub>) -> Self {
        let tool = SambaTool::new(config.tool_program.clone());
        let process = config
            .manage_process
            .then(|| DaemonProcess::new("samba", config.program.clone(), config.args.clone()));
        Self {
            config,
            cell,
            hub,
            tool,
            process,
            op_lock: Mutex::new(()),
        }
    }

    pub fn state_cell(&self) -> Arc<StateCell> {
        self.cell.clone()
    }

    async fn await_ready(&self) -> SupervisorResult<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.start_deadline_secs);
        let mut last_error = SupervisorError::timeout("samba never became ready");
        while tokio::time::Instant::now() < deadline {
            match self.tool.run(&["processes".into()]).await {
                Ok(_) => return Ok(()),
                Err(e) => {
                    last_error = e;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
        Err(SupervisorError::timeout(format!(
            "samba not ready within {}s",
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

    async fn stop_inner(&self) -> SupervisorResult<()> {
        if let Some(process) = &self.process {
            process
                .stop(Duration::from_secs(self.config.stop_grace_secs))
                .await?;
        }
        Ok(())
    }

    /// Provision a new domain. Requires a stopped (or failed) daemon; on
    /// success the daemon is started and `domain.provisioned` is emitted.
    pub async fn provision(&self, options: ProvisionOptions) -> SupervisorResult<CommandOutput> {
        options.validate()?;
        let _op = self.op_lock.lock().await;
        match self.cell.state() {
            DaemonState::Stopped | DaemonState::Failed => {}
            state => {
                return Err(SupervisorError::conflict(format!(
                    "Cannot provision while daemon is {}",
                    state.as_str()
                )))
            }
        }
        let output = self.tool.run(&provision_args(&options)).await?;

        self.cell.begin_start()?;
        self.start_inner().await?;

        self.hub.publish(
            "domain.provisioned",
            EventSeverity::Info,
            json!({ "realm": options.realm, "domain": options.domain }),
        );
        Ok(CommandOutput::ok_with(
            format!("Domain {} provisioned", options.realm),
            json!({ "output": output }),
        ))
    }

    /// Demote this DC and stop the daemon.
    pub async fn demote(&self) -> SupervisorResult<CommandOutput> {
        let _op = self.op_lock.lock().await;
        if self.cell.state() != DaemonState::Running && self.cell.state() != DaemonState::Degraded {
            return Err(SupervisorError::not_running("samba_ad"));
        }
        let output = self
            .tool
            .run(&["domain".into(), "demote".into(), "--remove-other-dead-server=self".into()])
            .await?;
        self.cell.transition(DaemonState::Stopping)?;
        self.stop_inner().await?;
        self.cell.transition(DaemonState::Stopped)?;
        self.hub
            .publish("domain.demoted", EventSeverity::Warning, json!({}));
        Ok(CommandOutput::ok_with("Domain controller demoted", json!({ "output": output })))
    }
}

#[async_trait]
impl Supervisor for SambaSupervisor {
    fn kind(&self) -> DaemonKind {
        DaemonKind::SambaAd
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
            DaemonState::Running | DaemonState::Degraded => {}
            DaemonState::Failed => {
                self.stop_inner().await.ok();
                return Ok(());
            }
            _ => {
                return Err(SupervisorError::conflict(
                    "Lifecycle operation already in flight",
                ))
            }
        }
        self.cell.transition(DaemonState::Stopping)?;
        match self.stop_inner().await {
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
                if let Err(e) = self.stop_inner().await {
                    self.cell.fail(e.to_string())?;
                    return Err(e);
                }
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
        let command = SambaCommand::parse(&request)?;
        let args = command.build_args();
        let result = self.tool.run(&args).await.map(|output| match command {
            SambaCommand::UserList
            | SambaCommand::GroupList
            | SambaCommand::ComputerList
            | SambaCommand::OuList => CommandOutput::ok_with(
                "Listing complete",
                json!({ "names": parse_name_lines(&output) }),
            ),
            _ => CommandOutput::ok_with("Command complete", json!({ "output": output })),
        });

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
        self.tool.run(&["processes".into()]).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_audit::{AuditSink, AuditStore, SinkConfig};
    use quay_core::{Metrics, SystemClock};
    use quay_supervisor::SupervisorErrorKind;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn stub_tool(dir: &tempfile::TempDir, body: &str) -> String {
        let path = dir.path().join("samba-tool");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh").unwrap();
        writeln!(file, "{}", body).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().to_string()
    }

    async fn supervisor(tool_program: String) -> Arc<SambaSupervisor> {
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
        let hub = Arc::new(EventHub::new(DaemonKind::SambaAd, clock.clone(), metrics));
        let cell = Arc::new(StateCell::new(
            DaemonKind::SambaAd,
            "samba",
            "/var/run/samba",
            hub.clone(),
            sink,
            clock,
        ));
        let config = SambaConfig {
            manage_process: false,
            tool_program,
            start_deadline_secs: 2,
            stop_grace_secs: 2,
            ..Default::default()
        };
        Arc::new(SambaSupervisor::new(config, cell, hub))
    }

    #[tokio::test]
    async fn start_waits_for_tool_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(&dir, "exit 0")).await;
        sup.start().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);
        sup.stop().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn start_fails_when_tool_never_ready() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(&dir, "exit 1")).await;
        let err = sup.start().await.unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Timeout);
        assert_eq!(sup.status().await.state, DaemonState::Failed);
    }

    #[tokio::test]
    async fn execute_requires_running() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(&dir, "exit 0")).await;
        let err = sup
            .execute(CommandRequest::bare("user_list"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::NotRunning);
    }

    #[tokio::test]
    async fn user_list_parses_names() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(
            &dir,
            "if [ \"$1\" = \"processes\" ]; then exit 0; fi; echo Administrator; echo jdoe",
        ))
        .await;
        sup.start().await.unwrap();
        let out = sup.execute(CommandRequest::bare("user_list")).await.unwrap();
        assert_eq!(out.data["names"], json!(["Administrator", "jdoe"]));
    }

    #[tokio::test]
    async fn provision_requires_stopped_and_emits_event() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(&dir, "exit 0")).await;
        let mut events = sup.events();

        let options = ProvisionOptions {
            realm: "AD.EXAMPLE.COM".into(),
            domain: "EXAMPLE".into(),
            admin_password: "Sup3rSecret!".into(),
            server_role: ServerRole::Dc,
            function_level: FunctionLevel::Level2016,
            dns_backend: DnsBackend::SambaInternal,
            host_ip: None,
        };
        sup.provision(options.clone()).await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Running);

        // Provisioning an already-running domain is a conflict.
        let err = sup.provision(options).await.unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Conflict);

        let mut saw_provisioned = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_secs(1), events.recv()).await
        {
            if event.name == "domain.provisioned" {
                assert_eq!(event.data["realm"], "AD.EXAMPLE.COM");
                saw_provisioned = true;
                break;
            }
        }
        assert!(saw_provisioned);
    }

    #[tokio::test]
    async fn command_failure_keeps_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(
            &dir,
            "if [ \"$1\" = \"processes\" ]; then exit 0; fi; echo nope >&2; exit 255",
        ))
        .await;
        sup.start().await.unwrap();
        let err = sup
            .execute(CommandRequest::new(
                "user_delete",
                json!({"username": "ghost"}),
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SupervisorErrorKind::Downstream);
        assert_eq!(sup.status().await.state, DaemonState::Running);
    }

    #[tokio::test]
    async fn demote_stops_the_daemon() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(stub_tool(&dir, "exit 0")).await;
        sup.start().await.unwrap();
        sup.demote().await.unwrap();
        assert_eq!(sup.status().await.state, DaemonState::Stopped);
    }
}

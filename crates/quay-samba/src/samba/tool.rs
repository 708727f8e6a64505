//! `samba-tool` invocation layer.
//!
//! Arguments are always separate argv entries; stderr is captured and
//! carried in the error so callers see the tool's own diagnostics.

use quay_supervisor::{SupervisorError, SupervisorResult};
use std::time::Duration;
use tokio::process::Command;

#[derive(Clone)]
pub struct SambaTool {
    program: String,
    timeout: Duration,
}

impl SambaTool {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run one tool invocation; returns stdout on success.
    pub async fn run(&self, args: &[String]) -> SupervisorResult<String> {
        log::debug!("[samba-tool] {} {}", self.program, args.join(" "));
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program).args(args).output(),
        )
        .await
        .map_err(|_| {
            SupervisorError::timeout(format!(
                "samba-tool {} timed out after {:?}",
                args.first().map(String::as_str).unwrap_or(""),
                self.timeout
            ))
        })?
        .map_err(|e| {
            SupervisorError::io(format!("Cannot run {}", self.program)).with_detail(e.to_string())
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(SupervisorError::downstream(format!(
                "samba-tool {} failed (exit {:?})",
                args.first().map(String::as_str).unwrap_or(""),
                output.status.code()
            ))
            .with_detail(if stderr.is_empty() { stdout } else { stderr }))
        }
    }
}

/// Split plain `name` lines (user/group/computer listings).
pub fn parse_name_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

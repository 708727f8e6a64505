//! Managed child process for daemons the platform launches itself.
//!
//! Graceful stop sends SIGTERM and waits out the grace period before the
//! hard kill. Stderr is captured so start failures carry the daemon's own
//! words.

use crate::supervisor::error::{SupervisorError, SupervisorResult};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub struct DaemonProcess {
    name: String,
    program: String,
    args: Vec<String>,
    child: Mutex<Option<Child>>,
    /// Tail of the child's stderr, for error reporting.
    stderr_tail: Arc<Mutex<String>>,
}

const STDERR_TAIL_LIMIT: usize = 8 * 1024;

impl DaemonProcess {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            child: Mutex::new(None),
            stderr_tail: Arc::new(Mutex::new(String::new())),
        }
    }

    /// Launch the daemon. Fails if it is already running.
    pub async fn spawn(&self) -> SupervisorResult<u32> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(SupervisorError::conflict(format!(
                    "{} process already running",
                    self.name
                )));
            }
        }

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SupervisorError::io(format!("Cannot launch {}", self.program))
                    .with_detail(e.to_string())
            })?;
        let pid = child.id().unwrap_or_default();
        log::info!("[process:{}] launched pid {}", self.name, pid);

        if let Some(stderr) = child.stderr.take() {
            let tail = self.stderr_tail.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                let mut stderr = stderr;
                let mut buf = [0u8; 1024];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).to_string();
                            log::debug!("[process:{}] stderr: {}", name, chunk.trim_end());
                            let mut tail = tail.lock().await;
                            tail.push_str(&chunk);
                            if tail.len() > STDERR_TAIL_LIMIT {
                                let cut = tail.len() - STDERR_TAIL_LIMIT;
                                tail.drain(..cut);
                            }
                        }
                    }
                }
            });
        }

        *guard = Some(child);
        Ok(pid)
    }

    /// True while the child has not exited.
    pub async fn is_running(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Captured stderr tail, for error surfaces.
    pub async fn stderr_tail(&self) -> String {
        self.stderr_tail.lock().await.clone()
    }

    /// SIGTERM, wait out `grace`, then SIGKILL.
    pub async fn stop(&self, grace: Duration) -> SupervisorResult<()> {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };
        if child.try_wait()?.is_some() {
            *guard = None;
            return Ok(());
        }
        let pid = child.id().unwrap_or_default();

        let term = Command::new("kill")
            .arg("-TERM")
            .arg(pid.to_string())
            .output()
            .await;
        if let Err(e) = term {
            log::warn!("[process:{}] SIGTERM delivery failed: {}", self.name, e);
        }

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                log::info!(
                    "[process:{}] pid {} exited: {:?}",
                    self.name,
                    pid,
                    status.map(|s| s.code())
                );
            }
            Err(_) => {
                log::warn!(
                    "[process:{}] pid {} ignored SIGTERM for {:?}, killing",
                    self.name,
                    pid,
                    grace
                );
                child.kill().await?;
            }
        }
        *guard = None;
        Ok(())
    }

    /// Exit status when the child has terminated on its own.
    pub async fn try_exit_code(&self) -> Option<i32> {
        let mut guard = self.child.lock().await;
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => status.code(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_graceful_stop() {
        let proc = DaemonProcess::new("sleeper", "sleep", vec!["30".into()]);
        let pid = proc.spawn().await.unwrap();
        assert!(pid > 0);
        assert!(proc.is_running().await);
        proc.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!proc.is_running().await);
    }

    #[tokio::test]
    async fn double_spawn_is_conflict() {
        let proc = DaemonProcess::new("sleeper", "sleep", vec!["30".into()]);
        proc.spawn().await.unwrap();
        let err = proc.spawn().await.unwrap_err();
        assert_eq!(
            err.kind,
            crate::supervisor::error::SupervisorErrorKind::Conflict
        );
        proc.stop(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn respawn_after_exit_is_allowed() {
        let proc = DaemonProcess::new("true", "true", vec![]);
        proc.spawn().await.unwrap();
        // Give the child a moment to exit.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!proc.is_running().await);
        proc.spawn().await.unwrap();
        proc.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_io_error() {
        let proc = DaemonProcess::new("ghost", "no-such-binary-here", vec![]);
        let err = proc.spawn().await.unwrap_err();
        assert_eq!(err.kind, crate::supervisor::error::SupervisorErrorKind::Io);
    }

    #[tokio::test]
    async fn stderr_is_captured() {
        let proc = DaemonProcess::new(
            "complainer",
            "sh",
            vec!["-c".into(), "echo boom >&2".into()],
        );
        proc.spawn().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(proc.stderr_tail().await.contains("boom"));
        proc.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn stop_when_never_started_is_ok() {
        let proc = DaemonProcess::new("idle", "sleep", vec!["1".into()]);
        proc.stop(Duration::from_secs(1)).await.unwrap();
    }
}

//! Periodic health probing.
//!
//! `k` consecutive probe failures while running moves the daemon to
//! `Degraded`; a single pass moves it back. The loop only ever touches
//! the running/degraded pair, so lifecycle operations in flight are left
//! alone.

use crate::supervisor::state::StateCell;
use crate::supervisor::supervisor::Supervisor;
use crate::supervisor::types::DaemonState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// Consecutive failures before `Degraded`.
    pub fail_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            fail_threshold: 3,
        }
    }
}

pub fn spawn_health_loop(
    supervisor: Arc<dyn Supervisor>,
    cell: Arc<StateCell>,
    config: HealthConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut consecutive_failures = 0u32;
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let state = cell.state();
            if state != DaemonState::Running && state != DaemonState::Degraded {
                consecutive_failures = 0;
                continue;
            }

            if supervisor.probe().await {
                consecutive_failures = 0;
                if state == DaemonState::Degraded {
                    // One pass recovers.
                    let _ = cell.transition(DaemonState::Running);
                }
            } else {
                consecutive_failures += 1;
                log::warn!(
                    "[health:{}] probe failed ({}/{})",
                    cell.kind().as_str(),
                    consecutive_failures,
                    config.fail_threshold
                );
                if state == DaemonState::Running && consecutive_failures >= config.fail_threshold {
                    let _ = cell.transition(DaemonState::Degraded);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::error::SupervisorResult;
    use crate::supervisor::events::{EventHub, EventStream};
    use crate::supervisor::types::*;
    use async_trait::async_trait;
    use quay_audit::{AuditSink, AuditStore, SinkConfig};
    use quay_core::{Metrics, SystemClock};
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ProbeStub {
        cell: Arc<StateCell>,
        hub: Arc<EventHub>,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl Supervisor for ProbeStub {
        fn kind(&self) -> DaemonKind {
            DaemonKind::OpenVpn
        }
        async fn start(&self) -> SupervisorResult<()> {
            Ok(())
        }
        async fn stop(&self) -> SupervisorResult<()> {
            Ok(())
        }
        async fn restart(&self) -> SupervisorResult<()> {
            Ok(())
        }
        async fn status(&self) -> DaemonDescriptor {
            self.cell.descriptor()
        }
        async fn execute(&self, request: CommandRequest) -> SupervisorResult<CommandOutput> {
            let _ = request;
            Ok(CommandOutput::ok("noop"))
        }
        fn events(&self) -> EventStream {
            self.hub.subscribe(true)
        }
        async fn probe(&self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }
    }

    async fn stub() -> Arc<ProbeStub> {
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
        let hub = Arc::new(EventHub::new(DaemonKind::OpenVpn, clock.clone(), metrics));
        let cell = Arc::new(StateCell::new(
            DaemonKind::OpenVpn,
            "openvpn",
            "127.0.0.1:7505",
            hub.clone(),
            sink,
            clock,
        ));
        cell.begin_start().unwrap();
        cell.transition(DaemonState::Running).unwrap();
        Arc::new(ProbeStub {
            cell,
            hub,
            healthy: AtomicBool::new(true),
        })
    }

    #[tokio::test]
    async fn three_failures_degrade_one_pass_recovers() {
        let stub = stub().await;
        tokio::time::pause();
        let cell = stub.cell.clone();
        let (_tx, rx) = watch::channel(false);
        let handle = spawn_health_loop(
            stub.clone(),
            cell.clone(),
            HealthConfig {
                interval_secs: 10,
                fail_threshold: 3,
            },
            rx,
        );

        stub.healthy.store(false, Ordering::Relaxed);
        // Two failures: still running.
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(cell.state(), DaemonState::Running);
        // Third failure: degraded.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cell.state(), DaemonState::Degraded);

        stub.healthy.store(true, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cell.state(), DaemonState::Running);

        handle.abort();
    }

    #[tokio::test]
    async fn stopped_daemon_is_left_alone() {
        let stub = stub().await;
        tokio::time::pause();
        let cell = stub.cell.clone();
        cell.transition(DaemonState::Stopping).unwrap();
        cell.transition(DaemonState::Stopped).unwrap();
        stub.healthy.store(false, Ordering::Relaxed);
        let (_tx, rx) = watch::channel(false);
        let handle = spawn_health_loop(stub.clone(), cell.clone(), HealthConfig::default(), rx);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cell.state(), DaemonState::Stopped);
        handle.abort();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let stub = stub().await;
        tokio::time::pause();
        let (tx, rx) = watch::channel(false);
        let handle = spawn_health_loop(stub.clone(), stub.cell.clone(), HealthConfig::default(), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(30), handle)
            .await
            .expect("health loop should exit")
            .unwrap();
    }
}

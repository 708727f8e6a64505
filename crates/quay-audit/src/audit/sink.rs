//! Non-blocking buffered sink.
//!
//! `log()` only touches an in-process queue and returns; a single writer
//! task persists records in the background. The write path is never
//! allowed to block or fail the caller: overflow drops the oldest buffered
//! record, persistence errors are retried with exponential backoff up to a
//! cap and then dropped, and every drop is counted.

use crate::audit::store::AuditStore;
use crate::audit::types::AuditRecord;
use quay_core::{Clock, Metrics};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

/// Sink tuning knobs.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Queue depth before the oldest record is shed.
    pub capacity: usize,
    /// Persistence attempts per record.
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            max_retries: 5,
            backoff_base_ms: 100,
            backoff_cap_ms: 5_000,
        }
    }
}

/// Cloneable handle to the audit sink.
#[derive(Clone)]
pub struct AuditSink {
    shared: Arc<SinkShared>,
}

struct SinkShared {
    queue: Mutex<VecDeque<AuditRecord>>,
    notify: Notify,
    shutdown: AtomicBool,
    drained: AtomicBool,
    in_flight: AtomicBool,
    capacity: usize,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    live: broadcast::Sender<AuditRecord>,
}

impl AuditSink {
    /// Spawn the writer task and return the handle.
    pub fn spawn(
        store: AuditStore,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
        config: SinkConfig,
    ) -> Self {
        let (live, _) = broadcast::channel(256);
        let shared = Arc::new(SinkShared {
            queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            notify: Notify::new(),
            shutdown: AtomicBool::new(false),
            drained: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            capacity: config.capacity,
            clock,
            metrics,
            live,
        });

        let writer_shared = shared.clone();
        tokio::spawn(async move {
            writer_loop(writer_shared, store, config).await;
        });

        Self { shared }
    }

    /// Enqueue a record. Returns immediately; the timestamp is stamped here
    /// so ordering reflects enqueue order even under writer backlog.
    pub fn log(&self, mut record: AuditRecord) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            Metrics::incr(&self.shared.metrics.audit_dropped_total);
            return;
        }
        if record.timestamp == 0 {
            record.timestamp = self.shared.clock.now_millis();
        }

        let _ = self.shared.live.send(record.clone());

        {
            let mut queue = self.shared.queue.lock().expect("audit queue poisoned");
            queue.push_back(record);
            if queue.len() > self.shared.capacity {
                queue.pop_front();
                Metrics::incr(&self.shared.metrics.audit_dropped_total);
            }
        }
        Metrics::incr(&self.shared.metrics.audit_buffered_total);
        self.shared.notify.notify_one();
    }

    /// Live feed of records as they are enqueued (WebSocket fan-out).
    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.shared.live.subscribe()
    }

    /// Wait until the queue and the in-flight slot are empty.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let empty = {
                let queue = self.shared.queue.lock().expect("audit queue poisoned");
                queue.is_empty()
            };
            if empty && !self.shared.in_flight.load(Ordering::Acquire) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Stop accepting records and drain what is buffered (bounded grace).
    pub async fn shutdown(&self, grace: Duration) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.notify.notify_one();
        let deadline = tokio::time::Instant::now() + grace;
        while !self.shared.drained.load(Ordering::Acquire) {
            if tokio::time::Instant::now() >= deadline {
                log::warn!("[audit] sink shutdown grace expired with records unflushed");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

async fn writer_loop(shared: Arc<SinkShared>, store: AuditStore, config: SinkConfig) {
    loop {
        let next = {
            let mut queue = shared.queue.lock().expect("audit queue poisoned");
            queue.pop_front()
        };

        match next {
            Some(record) => {
                shared.in_flight.store(true, Ordering::Release);
                persist_with_retry(&shared, &store, &config, record).await;
                shared.in_flight.store(false, Ordering::Release);
            }
            None => {
                if shared.shutdown.load(Ordering::Acquire) {
                    break;
                }
                shared.notify.notified().await;
            }
        }
    }
    shared.drained.store(true, Ordering::Release);
}

async fn persist_with_retry(
    shared: &SinkShared,
    store: &AuditStore,
    config: &SinkConfig,
    record: AuditRecord,
) {
    let mut attempt = 0u32;
    loop {
        match store.insert(&record).await {
            Ok(()) => return,
            Err(e) => {
                if attempt >= config.max_retries {
                    Metrics::incr(&shared.metrics.audit_dropped_total);
                    log::error!(
                        "[audit] dropping record {} after {} attempts: {}",
                        record.id,
                        attempt + 1,
                        e
                    );
                    return;
                }
                Metrics::incr(&shared.metrics.audit_retries_total);
                let backoff = (config.backoff_base_ms << attempt).min(config.backoff_cap_ms);
                log::warn!(
                    "[audit] insert failed (attempt {}), retrying in {} ms: {}",
                    attempt + 1,
                    backoff,
                    e
                );
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                attempt += 1;
            }
        }
    }
}

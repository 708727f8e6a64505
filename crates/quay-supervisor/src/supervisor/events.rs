//! Per-supervisor event fan-out.
//!
//! One publisher, many subscribers. Sequence numbers are assigned under
//! the hub lock, so every subscriber observes a subsequence of the same
//! canonical order. A ring of recent events is replayed to late
//! subscribers; a slow subscriber loses events (counted) instead of
//! stalling the publisher.

use crate::supervisor::types::*;
use quay_core::{Clock, Metrics};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Events kept for late subscribers.
pub const REPLAY_RING: usize = 256;
/// Per-subscriber buffer before drops start.
pub const SUBSCRIBER_BUFFER: usize = 64;

pub struct EventHub {
    kind: DaemonKind,
    inner: Mutex<HubInner>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
}

struct HubInner {
    seq: u64,
    ring: VecDeque<SupervisorEvent>,
    subscribers: Vec<Subscriber>,
    next_subscriber: u64,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<SupervisorEvent>,
    dropped: Arc<AtomicU64>,
}

/// Receiving side handed to one listener.
pub struct EventStream {
    pub rx: mpsc::Receiver<SupervisorEvent>,
    /// Events this listener lost to backpressure.
    pub dropped: Arc<AtomicU64>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<SupervisorEvent> {
        self.rx.recv().await
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventHub {
    pub fn new(kind: DaemonKind, clock: Arc<dyn Clock>, metrics: Arc<Metrics>) -> Self {
        Self {
            kind,
            inner: Mutex::new(HubInner {
                seq: 0,
                ring: VecDeque::with_capacity(REPLAY_RING),
                subscribers: Vec::new(),
                next_subscriber: 0,
            }),
            clock,
            metrics,
        }
    }

    /// Publish one event; returns it with its assigned sequence number.
    pub fn publish(
        &self,
        name: impl Into<String>,
        severity: EventSeverity,
        data: Value,
    ) -> SupervisorEvent {
        let mut inner = self.inner.lock().expect("event hub poisoned");
        inner.seq += 1;
        let event = SupervisorEvent {
            seq: inner.seq,
            kind: self.kind,
            name: name.into(),
            severity,
            timestamp: self.clock.now_millis(),
            data,
        };

        inner.ring.push_back(event.clone());
        if inner.ring.len() > REPLAY_RING {
            inner.ring.pop_front();
        }

        inner.subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped.fetch_add(1, Ordering::Relaxed);
                Metrics::incr(&self.metrics.events_dropped_total);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        Metrics::incr(&self.metrics.events_published_total);
        event
    }

    /// Subscribe; with `replay` the most recent buffered events are
    /// delivered first, in order.
    pub fn subscribe(&self, replay: bool) -> EventStream {
        let mut inner = self.inner.lock().expect("event hub poisoned");
        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        // Room for a full replay plus a live buffer.
        let (tx, rx) = mpsc::channel(REPLAY_RING + SUBSCRIBER_BUFFER);
        let dropped = Arc::new(AtomicU64::new(0));
        if replay {
            for event in inner.ring.iter() {
                // Capacity covers the whole ring; a failure here means the
                // subscriber vanished already.
                let _ = tx.try_send(event.clone());
            }
        }
        inner.subscribers.push(Subscriber {
            id,
            tx,
            dropped: dropped.clone(),
        });
        log::debug!(
            "[events:{}] subscriber {} attached (replay: {})",
            self.kind.as_str(),
            id,
            replay
        );
        EventStream { rx, dropped }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event hub poisoned").subscribers.len()
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().expect("event hub poisoned").seq
    }
}

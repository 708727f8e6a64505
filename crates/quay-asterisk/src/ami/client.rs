//! Manager connection client.
//!
//! One reader task owns the socket and demultiplexes incoming messages:
//! events go to the fan-out hub, everything else fulfils the single
//! pending response slot. Action senders serialise on the send lock and
//! hold it until their response (or cancellation), so responses pair with
//! actions strictly FIFO; the protocol has no request ids.
//!
//! Cancellation: a caller abandoning the slot marks one orphan; the
//! reader discards exactly one following non-event message with a
//! warning, keeping pairing correct for the next caller.

use crate::ami::protocol::{AmiCodec, AmiMessage};
use quay_supervisor::{EventHub, SupervisorError, SupervisorResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch, Mutex};

pub struct AmiClient {
    inner: Arc<ClientInner>,
    /// Server banner line, read before any message traffic.
    pub banner: String,
}

struct ClientInner {
    /// Send lock and writer. Held by a caller from action write until its
    /// response arrives or the caller gives up.
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// The one in-flight response slot.
    pending: StdMutex<Option<oneshot::Sender<AmiMessage>>>,
    /// Responses on the wire whose caller went away.
    orphans: AtomicUsize,
    hub: Arc<EventHub>,
    connected_tx: watch::Sender<bool>,
}

/// Restores the pairing invariant when a caller abandons the slot.
struct SlotGuard<'a> {
    inner: &'a ClientInner,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self
            .inner
            .pending
            .lock()
            .expect("pending slot poisoned")
            .take()
            .is_some();
        if abandoned {
            self.inner.orphans.fetch_add(1, Ordering::SeqCst);
            log::warn!("[ami] caller abandoned response slot; next response will be discarded");
        }
    }
}

impl AmiClient {
    /// Dial the manager socket and consume the banner.
    pub async fn connect(host: &str, port: u16, hub: Arc<EventHub>) -> SupervisorResult<Self> {
        let stream = TcpStream::connect((host, port)).await.map_err(|e| {
            SupervisorError::io(format!("Cannot connect to AMI at {}:{}", host, port))
                .with_detail(e.to_string())
        })?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let mut banner = String::new();
        reader.read_line(&mut banner).await.map_err(|e| {
            SupervisorError::protocol("AMI banner read failed").with_detail(e.to_string())
        })?;
        let banner = banner.trim().to_string();
        log::info!("[ami] connected, banner: {}", banner);

        let (connected_tx, _) = watch::channel(true);
        let inner = Arc::new(ClientInner {
            writer: Mutex::new(Some(write_half)),
            pending: StdMutex::new(None),
            orphans: AtomicUsize::new(0),
            hub,
            connected_tx,
        });

        let reader_inner = inner.clone();
        tokio::spawn(async move {
            reader_loop(reader, reader_inner).await;
        });

        Ok(Self { inner, banner })
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    /// Watch for connection loss (used by the reconnect loop).
    pub fn connected_watch(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// Orphaned responses discarded so far (diagnostics).
    pub fn orphan_count(&self) -> usize {
        self.inner.orphans.load(Ordering::SeqCst)
    }

    /// Send one action and await the next response, FIFO. The send lock is
    /// held for the whole exchange.
    pub async fn send_action(
        &self,
        action: AmiMessage,
        timeout: Duration,
    ) -> SupervisorResult<AmiMessage> {
        let mut writer_guard = self.inner.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| SupervisorError::io("AMI connection is closed"))?;

        let (tx, rx) = oneshot::channel();
        *self.inner.pending.lock().expect("pending slot poisoned") = Some(tx);
        let guard = SlotGuard { inner: &self.inner };

        if let Err(e) = writer.write_all(action.to_wire().as_bytes()).await {
            // Nothing reached the peer; reclaim the slot without marking
            // an orphan.
            self.inner
                .pending
                .lock()
                .expect("pending slot poisoned")
                .take();
            std::mem::forget(guard);
            let _ = self.inner.connected_tx.send(false);
            return Err(SupervisorError::io("AMI write failed").with_detail(e.to_string()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                // Reader consumed the slot; the guard has nothing to do.
                std::mem::forget(guard);
                Ok(response)
            }
            Ok(Err(_)) => {
                // Reader dropped the sender: connection died.
                std::mem::forget(guard);
                Err(SupervisorError::io("AMI connection lost while awaiting response"))
            }
            Err(_) => {
                // Deadline exceeded; guard marks the orphan on drop.
                drop(guard);
                Err(SupervisorError::timeout(format!(
                    "AMI response not received within {:?}",
                    timeout
                )))
            }
        }
    }

    /// Authenticate the manager session.
    pub async fn login(
        &self,
        username: &str,
        secret: &str,
        timeout: Duration,
    ) -> SupervisorResult<()> {
        let response = self
            .send_action(
                AmiMessage::action("Login")
                    .with("Username", username)
                    .with("Secret", secret),
                timeout,
            )
            .await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SupervisorError::downstream(format!(
                "AMI login rejected: {}",
                response.message().unwrap_or("no message")
            )))
        }
    }

    /// Polite goodbye; the socket closes behind it.
    pub async fn logoff(&self) {
        let _ = self
            .send_action(AmiMessage::action("Logoff"), Duration::from_secs(2))
            .await;
        self.close().await;
    }

    pub async fn close(&self) {
        let mut writer = self.inner.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
        let _ = self.inner.connected_tx.send(false);
    }
}

async fn reader_loop(mut reader: BufReader<OwnedReadHalf>, inner: Arc<ClientInner>) {
    let mut codec = AmiCodec::new();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                log::info!("[ami] connection closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("[ami] read error: {}", e);
                break;
            }
        }

        let Some(message) = codec.push_line(&line) else {
            continue;
        };

        if message.is_event() {
            let name = message.event_name().unwrap_or("Unknown").to_string();
            inner.hub.publish(
                format!("ami.{}", name),
                quay_supervisor::EventSeverity::Info,
                message.to_json(),
            );
            continue;
        }

        // Response traffic. Settle orphans first so pairing stays FIFO.
        if inner.orphans.load(Ordering::SeqCst) > 0 {
            inner.orphans.fetch_sub(1, Ordering::SeqCst);
            log::warn!(
                "[ami] discarding orphan response: {}",
                message.message().unwrap_or("(no message)")
            );
            continue;
        }

        let slot = inner.pending.lock().expect("pending slot poisoned").take();
        match slot {
            Some(tx) => {
                if tx.send(message).is_err() {
                    log::warn!("[ami] response arrived after caller vanished, discarded");
                }
            }
            None => {
                log::warn!("[ami] unsolicited response discarded");
            }
        }
    }

    // Connection is gone: fail the in-flight caller and tell the world.
    inner.pending.lock().expect("pending slot poisoned").take();
    let _ = inner.connected_tx.send(false);
    inner.hub.publish(
        "connection.lost",
        quay_supervisor::EventSeverity::Warning,
        serde_json::Value::Null,
    );
}

//! Live WebSocket streams.
//!
//! `/ws` concatenates every supervisor's event stream plus (for admins)
//! audit notifications. Delivery is at-least-once; each frame carries a
//! per-connection monotonic `seq`. Clients may narrow the stream with
//! `{"type": "subscribe", "topics": [...]}`.

use crate::gateway::error::ApiError;
use crate::gateway::extract::{AdminUser, AuthUser};
use crate::gateway::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use quay_core::Metrics;
use quay_supervisor::Supervisor;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    topics: Vec<String>,
}

/// One outbound frame before seq assignment.
struct Outbound {
    topic: String,
    kind: &'static str,
    data: Value,
}

pub async fn event_stream(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    user: AuthUser,
) -> Response {
    Metrics::incr(&state.metrics.ws_connections_total);
    ws.on_upgrade(move |socket| run_event_stream(socket, state, user))
}

async fn run_event_stream(socket: WebSocket, state: AppState, user: AuthUser) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);

    // One forwarder per supervisor stream; replay gives late subscribers
    // the recent history.
    let mut forwarders = Vec::new();
    for supervisor in state.registry.all().await {
        let topic = format!("supervisor.{}", supervisor.kind().as_str());
        let mut events = supervisor.events();
        let tx = tx.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let frame = Outbound {
                    topic: topic.clone(),
                    kind: "supervisor_event",
                    data: serde_json::to_value(&event).unwrap_or(Value::Null),
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
        }));
    }

    // Audit notifications are admin-visible only.
    if user.is_admin() {
        let mut audit_rx = state.audit.subscribe();
        let tx = tx.clone();
        forwarders.push(tokio::spawn(async move {
            loop {
                match audit_rx.recv().await {
                    Ok(record) => {
                        let frame = Outbound {
                            topic: "audit".to_string(),
                            kind: "audit_record",
                            data: serde_json::to_value(&record).unwrap_or(Value::Null),
                        };
                        if tx.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[ws] audit feed lagged, {} records skipped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }
    drop(tx);

    let mut seq: u64 = 0;
    // Empty set means "everything this role can see".
    let mut topics: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(outbound) = outbound else { break };
                if !topics.is_empty() && !topics.contains(&outbound.topic) {
                    continue;
                }
                seq += 1;
                let frame = json!({
                    "type": outbound.kind,
                    "seq": seq,
                    "topic": outbound.topic,
                    "data": outbound.data,
                });
                if sink.send(Message::Text(frame.to_string())).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(message) = serde_json::from_str::<ClientMessage>(&text) {
                            if message.kind == "subscribe" {
                                topics = message.topics.into_iter().collect();
                                log::debug!("[ws] {} narrowed to {:?}", user.username(), topics);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    for forwarder in forwarders {
        forwarder.abort();
    }
    log::info!("[ws] event stream for {} closed ({} frames)", user.username(), seq);
}

// ── Terminal ─────────────────────────────────────────────────────────

/// Admin-only interactive shell over WebSocket. Line-oriented: client
/// text frames go to the shell's stdin, stdout/stderr lines come back as
/// text frames. The session is bounded by the request deadline; the
/// upgrade detaches the future from the HTTP timeout layer, so the
/// deadline is enforced here and the shell is killed when it elapses.
pub async fn terminal(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    admin: AdminUser,
) -> Result<Response, ApiError> {
    let username = admin.username().to_string();
    let deadline = Duration::from_secs(state.config.request_timeout_secs);
    state.audit.log(
        quay_audit::AuditRecord::new(
            "terminal.opened",
            "terminal",
            "Terminal session opened",
        )
        .with_severity(quay_audit::AuditSeverity::Warning)
        .with_principal(&username),
    );
    Ok(ws.on_upgrade(move |socket| run_terminal(socket, username, deadline)))
}

async fn run_terminal(socket: WebSocket, username: String, deadline: Duration) {
    let (mut sink, mut stream) = socket.split();

    let child = tokio::process::Command::new("sh")
        .arg("-i")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let mut child = match child {
        Ok(child) => child,
        Err(e) => {
            let _ = sink
                .send(Message::Text(format!("failed to start shell: {}", e)))
                .await;
            return;
        }
    };

    let mut stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = stdout {
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if out_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }
    if let Some(stderr) = stderr {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if out_tx.send(line).await.is_err() {
                    break;
                }
            }
        });
    }

    let session = async {
        loop {
            tokio::select! {
                line = out_rx.recv() => {
                    let Some(line) = line else { break };
                    if sink.send(Message::Text(line)).await.is_err() {
                        break;
                    }
                }
                incoming = stream.next() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(stdin) = stdin.as_mut() {
                                let payload = format!("{}\n", text.trim_end());
                                if stdin.write_all(payload.as_bytes()).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(_)) => break,
                    }
                }
            }
        }
    };

    if tokio::time::timeout(deadline, session).await.is_err() {
        log::warn!(
            "[ws] terminal session for {} hit the {}s deadline, killing shell",
            username,
            deadline.as_secs()
        );
        let _ = sink
            .send(Message::Text("session deadline reached".to_string()))
            .await;
    }

    let _ = child.kill().await;
    log::info!("[ws] terminal session for {} closed", username);
}

//! In-process AMI server used by the client and supervisor tests.

use crate::ami::protocol::{AmiCodec, AmiMessage};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub(crate) struct FakeAmiServer {
    pub port: u16,
}

impl FakeAmiServer {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream));
            }
        });
        Self { port }
    }
}

async fn handle_connection(stream: TcpStream) {
    let (read_half, mut write) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    if write
        .write_all(b"Asterisk Call Manager/5.0.2\r\n")
        .await
        .is_err()
    {
        return;
    }

    let mut codec = AmiCodec::new();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let Some(action) = codec.push_line(&line) else {
            continue;
        };
        let name = action.get("Action").unwrap_or("").to_string();
        match name.as_str() {
            "Login" => {
                let ok = action.get("Secret") == Some("s3cret");
                let response = if ok {
                    AmiMessage::new()
                        .with("Response", "Success")
                        .with("Message", "Authentication accepted")
                } else {
                    AmiMessage::new()
                        .with("Response", "Error")
                        .with("Message", "Authentication failed")
                };
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "Ping" => {
                let response = AmiMessage::new()
                    .with("Response", "Success")
                    .with("Ping", "Pong");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "Delay" => {
                let ms: u64 = action
                    .get("Ms")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                let response = AmiMessage::new()
                    .with("Response", "Success")
                    .with("Message", "Delayed response");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "EmitEvent" => {
                let response = AmiMessage::new().with("Response", "Success");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
                let event = AmiMessage::new()
                    .with("Event", "TestEvent")
                    .with("Payload", "hello");
                let _ = write.write_all(event.to_wire().as_bytes()).await;
            }
            "SIPpeers" => {
                let response = AmiMessage::new()
                    .with("Response", "Success")
                    .with("EventList", "start")
                    .with("Message", "Peer status list will follow");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
                for (peer, status) in [("100", "OK (12 ms)"), ("200", "UNKNOWN")] {
                    let event = AmiMessage::new()
                        .with("Event", "PeerEntry")
                        .with("ObjectName", peer)
                        .with("IPaddress", "192.0.2.10")
                        .with("Status", status);
                    let _ = write.write_all(event.to_wire().as_bytes()).await;
                }
                let done = AmiMessage::new()
                    .with("Event", "PeerlistComplete")
                    .with("EventList", "Complete")
                    .with("ListItems", "2");
                let _ = write.write_all(done.to_wire().as_bytes()).await;
            }
            "Command" => {
                let output = match action.get("Command") {
                    Some("core show version") => "Asterisk 20.5.0 built on x86_64",
                    other => {
                        let _ = other;
                        "command output"
                    }
                };
                let response = AmiMessage::new()
                    .with("Response", "Success")
                    .with("Output", output);
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "Originate" => {
                let response = if action.get("Channel").is_some() {
                    AmiMessage::new()
                        .with("Response", "Success")
                        .with("Message", "Originate successfully queued")
                } else {
                    AmiMessage::new()
                        .with("Response", "Error")
                        .with("Message", "Channel not specified")
                };
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "Hangup" => {
                let response = AmiMessage::new()
                    .with("Response", "Success")
                    .with("Message", "Channel Hungup");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "Reload" => {
                let response = AmiMessage::new()
                    .with("Response", "Success")
                    .with("Message", "Module Reloaded");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
            "Hangup-Connection" => {
                return;
            }
            "Logoff" => {
                let response = AmiMessage::new()
                    .with("Response", "Goodbye")
                    .with("Message", "Thanks for all the fish.");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
                return;
            }
            _ => {
                let response = AmiMessage::new()
                    .with("Response", "Error")
                    .with("Message", "Invalid/unknown command");
                let _ = write.write_all(response.to_wire().as_bytes()).await;
            }
        }
    }
}

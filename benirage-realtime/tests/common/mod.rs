//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use benirage_realtime::backend::{ChannelHandle, ChannelId, DataWriter, RealtimeBackend};
use benirage_realtime::protocol::{
    ChangeEvent, ChangeEventType, ChangeSpec, ChannelMessage, ChannelStatus, Frame, EVENT_HEARTBEAT,
    EVENT_JOIN, EVENT_LEAVE, EVENT_POSTGRES_CHANGES, EVENT_REPLY,
};
use benirage_realtime::{ConnectionEvent, TransportError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

// ─── Scripted backend ─────────────────────────────────────────────────

/// Backend whose probe outcomes are scripted by the test.
#[derive(Default)]
pub struct FakeBackend {
    /// Consumed front to back; when empty `unhealthy` decides
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    unhealthy: AtomicBool,
    heartbeat_fails: AtomicBool,
    probe_delay: Mutex<Duration>,
    channels: Mutex<HashMap<ChannelId, mpsc::Sender<ChannelMessage>>>,
    next_channel: AtomicU64,
    pub probes: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl FakeBackend {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let backend = Self::default();
        backend.unhealthy.store(true, Ordering::SeqCst);
        Arc::new(backend)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn set_heartbeat_fails(&self, fails: bool) {
        self.heartbeat_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_probe_delay(&self, delay: Duration) {
        *self.probe_delay.lock().unwrap() = delay;
    }

    pub fn script(&self, results: Vec<Result<(), TransportError>>) {
        self.script.lock().unwrap().extend(results);
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn open_channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.channels.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Push a message onto an open channel.
    pub async fn send(&self, channel: ChannelId, message: ChannelMessage) {
        let tx = self.channels.lock().unwrap().get(&channel).cloned();
        tx.expect("channel is not open").send(message).await.unwrap();
    }
}

#[async_trait]
impl RealtimeBackend for FakeBackend {
    async fn probe(&self) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let delay = *self.probe_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None if self.unhealthy.load(Ordering::SeqCst) => {
                Err(TransportError::network("connection refused"))
            }
            None => Ok(()),
        }
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if self.heartbeat_fails.load(Ordering::SeqCst) {
            Err(TransportError::timeout("heartbeat lost"))
        } else {
            Ok(())
        }
    }

    async fn subscribe(
        &self,
        name: &str,
        _spec: &ChangeSpec,
    ) -> Result<ChannelHandle, TransportError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let id = self.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(32);
        tx.send(ChannelMessage::status(ChannelStatus::Subscribed))
            .await
            .unwrap();
        self.channels.lock().unwrap().insert(id, tx);
        Ok(ChannelHandle {
            id,
            topic: format!("realtime:{name}"),
            messages: rx,
        })
    }

    async fn unsubscribe(&self, channel: ChannelId) {
        if self.channels.lock().unwrap().remove(&channel).is_some() {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.channels.lock().unwrap().clear();
    }
}

/// Writer that records every successful write in order.
#[derive(Default)]
pub struct RecordingWriter {
    pub writes: Mutex<Vec<(String, Value)>>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl RecordingWriter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

#[async_trait]
impl DataWriter for RecordingWriter {
    async fn write(&self, target: &str, payload: &Value) -> Result<(), TransportError> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::service_unavailable("HTTP 503"));
        }
        self.writes
            .lock()
            .unwrap()
            .push((target.to_string(), payload.clone()));
        Ok(())
    }
}

/// Collects observer events.
pub fn record_events(
    manager: &benirage_realtime::ConnectionManager<FakeBackend>,
) -> (Arc<Mutex<Vec<ConnectionEvent>>>, benirage_realtime::CallbackHandle) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let handle = manager.add_callback(move |event| sink.lock().unwrap().push(event.clone()));
    (events, handle)
}

pub fn change(table: &str, record: Value) -> ChangeEvent {
    ChangeEvent {
        event_type: ChangeEventType::Insert,
        schema: "public".to_string(),
        table: table.to_string(),
        record,
        old_record: Value::Null,
        commit_timestamp: None,
    }
}

// ─── Local Supabase stand-in ──────────────────────────────────────────

/// A request seen by the local HTTP fixture.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

/// Minimal REST + Phoenix realtime server on a free local port.
pub struct LocalSupabase {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<SeenRequest>>>,
}

impl LocalSupabase {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut head = [0u8; 1024];
                    let Ok(n) = stream.peek(&mut head).await else {
                        return;
                    };
                    let text = String::from_utf8_lossy(&head[..n]);
                    if text.contains("/realtime/v1/websocket") {
                        serve_realtime(stream).await;
                    } else {
                        serve_http(stream, seen).await;
                    }
                });
            }
        });
        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            requests,
        }
    }

    pub fn posts(&self) -> Vec<SeenRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == "POST")
            .cloned()
            .collect()
    }
}

/// URL of a local port nothing listens on.
pub async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

/// URL of a server that promises a body and hangs up halfway through it.
pub async fn truncated_body_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                }
            }
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 1024\r\n\r\n";
            let _ = stream.write_all(head.as_bytes()).await;
            let _ = stream.write_all(b"only part").await;
            let _ = stream.shutdown().await;
        }
    });
    format!("http://{addr}/health")
}

async fn serve_http(mut stream: TcpStream, seen: Arc<Mutex<Vec<SeenRequest>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            return;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let mut request_line = lines.next().unwrap_or_default().split_whitespace();
    let method = request_line.next().unwrap_or_default().to_string();
    let target = request_line.next().unwrap_or_default().to_string();
    let path = target.split('?').next().unwrap_or_default().to_string();
    let content_length: usize = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse().ok())
        .unwrap_or(0);

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let Ok(n) = stream.read(&mut chunk).await else {
            return;
        };
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }

    seen.lock().unwrap().push(SeenRequest {
        method: method.clone(),
        path: path.clone(),
        body: String::from_utf8_lossy(&body).to_string(),
    });

    let (status, extra, payload) = match (method.as_str(), path.as_str()) {
        ("OPTIONS", _) => ("204 No Content", "access-control-allow-origin: *\r\n", ""),
        (_, "/rest/v1/secret") => ("401 Unauthorized", "", r#"{"message":"JWT expired"}"#),
        (_, "/rest/v1/broken") => ("503 Service Unavailable", "", "down"),
        ("POST", p) if p.starts_with("/rest/v1/") => ("201 Created", "", ""),
        ("GET", p) if p.starts_with("/rest/v1/") => ("200 OK", "", "[]"),
        ("GET", "/auth/v1/health") => ("200 OK", "", r#"{"name":"GoTrue"}"#),
        ("GET", "/") => ("204 No Content", "", ""),
        _ => ("404 Not Found", "", ""),
    };
    let response = format!(
        "HTTP/1.1 {status}\r\n{extra}content-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{payload}",
        payload.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}

/// Answers joins, leaves and heartbeats; after each successful join pushes
/// one `postgres_changes` INSERT on the joined topic.
async fn serve_realtime(stream: TcpStream) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut writer, mut reader) = ws.split();
    while let Some(Ok(msg)) = reader.next().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(frame) = Frame::decode(text.as_str()) else {
            continue;
        };
        let reply = |frame: &Frame| {
            Frame::new(
                frame.topic.clone(),
                EVENT_REPLY,
                json!({"status": "ok", "response": {}}),
                frame.reference.clone(),
            )
        };
        let mut outgoing = Vec::new();
        match frame.event.as_str() {
            EVENT_JOIN => {
                outgoing.push(reply(&frame));
                let table = frame.payload["config"]["postgres_changes"][0]["table"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string();
                outgoing.push(Frame::new(
                    frame.topic.clone(),
                    EVENT_POSTGRES_CHANGES,
                    json!({
                        "ids": [1],
                        "data": {
                            "type": "INSERT",
                            "schema": "public",
                            "table": table,
                            "record": {"id": 1, "body": "hello from server"},
                            "old_record": null,
                            "commit_timestamp": "2024-05-01T10:00:00Z"
                        }
                    }),
                    None,
                ));
            }
            EVENT_HEARTBEAT | EVENT_LEAVE => outgoing.push(reply(&frame)),
            _ => {}
        }
        for frame in outgoing {
            let text = frame.encode().unwrap();
            if writer.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
    }
}

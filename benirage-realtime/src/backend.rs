//! Backend seams and the Supabase implementation.
//!
//! ```text
//! ┌───────────────────┐  probe / write (HTTP)   ┌──────────────┐
//! │ SupabaseBackend   │ ──────────────────────► │ PostgREST    │
//! │                   │                         └──────────────┘
//! │  writer task ─────┼──► WebSocket ──┐        ┌──────────────┐
//! │  reader task ◄────┼────────────────┴──────► │ Realtime     │
//! │    │ route by topic                         └──────────────┘
//! │    ▼
//! │  channel N: mpsc<ChannelMessage>
//! └───────────────────┘
//! ```
//!
//! One socket is shared by every channel. The reader task resolves pending
//! replies by `ref` and routes everything else by `topic`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::BackendConfig;
use crate::error::TransportError;
use crate::protocol::{
    channel_topic, ChangeSpec, ChannelMessage, ChannelStatus, Frame, Reply, EVENT_CLOSE,
    EVENT_ERROR, EVENT_POSTGRES_CHANGES, EVENT_REPLY, EVENT_SYSTEM,
};

/// Identifier of one joined channel.
pub type ChannelId = u64;

/// Buffered messages per channel before the reader task waits.
const CHANNEL_BUFFER: usize = 256;

/// A joined channel: its id, topic, and the stream of its messages.
///
/// The first status message tells whether the join succeeded.
#[derive(Debug)]
pub struct ChannelHandle {
    pub id: ChannelId,
    pub topic: String,
    pub messages: mpsc::Receiver<ChannelMessage>,
}

/// Realtime backend used by [`crate::ConnectionManager`].
#[async_trait]
pub trait RealtimeBackend: Send + Sync + 'static {
    /// Minimal read proving the backend accepts requests.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Periodic liveness ping.
    async fn heartbeat(&self) -> Result<(), TransportError>;

    /// Join a channel for row changes described by `spec`.
    async fn subscribe(&self, name: &str, spec: &ChangeSpec)
        -> Result<ChannelHandle, TransportError>;

    /// Leave a channel. Unknown ids are ignored.
    async fn unsubscribe(&self, channel: ChannelId);

    /// Close the realtime socket and drop every channel.
    async fn disconnect(&self);
}

/// Write side used to replay queued operations.
#[async_trait]
pub trait DataWriter: Send + Sync {
    async fn write(&self, target: &str, payload: &Value) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: DataWriter + ?Sized> DataWriter for Arc<T> {
    async fn write(&self, target: &str, payload: &Value) -> Result<(), TransportError> {
        (**self).write(target, payload).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ChannelRoute {
    id: ChannelId,
    tx: mpsc::Sender<ChannelMessage>,
}

/// Routing tables shared between the backend and its reader task.
#[derive(Default)]
struct Routes {
    channels: Mutex<HashMap<String, ChannelRoute>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
}

impl Routes {
    fn dispatch(&self, frame: Frame) {
        if frame.event == EVENT_REPLY {
            if let Some(reference) = &frame.reference {
                let waiter = lock(&self.pending).remove(reference);
                if let Some(waiter) = waiter {
                    if let Ok(reply) = frame.reply() {
                        let _ = waiter.send(reply);
                    }
                    return;
                }
            }
        }

        let message = match frame.event.as_str() {
            EVENT_POSTGRES_CHANGES => match frame.change_event() {
                Ok(event) => ChannelMessage::Change(event),
                Err(e) => {
                    log::warn!("Dropping malformed change on {}: {e}", frame.topic);
                    return;
                }
            },
            EVENT_ERROR => ChannelMessage::Status {
                status: ChannelStatus::ChannelError,
                detail: Some(frame.payload.to_string()),
            },
            EVENT_CLOSE => ChannelMessage::status(ChannelStatus::Closed),
            EVENT_SYSTEM => {
                let failed = frame.payload.get("status").and_then(Value::as_str) == Some("error");
                if !failed {
                    return;
                }
                ChannelMessage::Status {
                    status: ChannelStatus::ChannelError,
                    detail: frame
                        .payload
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            }
            _ => return,
        };

        let tx = lock(&self.channels)
            .get(&frame.topic)
            .map(|route| route.tx.clone());
        if let Some(tx) = tx {
            if tx.try_send(message).is_err() {
                log::warn!("Channel {} is not keeping up, message dropped", frame.topic);
            }
        }
    }

    /// Socket went away: every channel errors, every waiter is released.
    fn fail_all(&self, detail: &str) {
        let routes: Vec<ChannelRoute> = lock(&self.channels).drain().map(|(_, r)| r).collect();
        for route in routes {
            let _ = route.tx.try_send(ChannelMessage::Status {
                status: ChannelStatus::ChannelError,
                detail: Some(detail.to_string()),
            });
        }
        lock(&self.pending).clear();
    }
}

struct Socket {
    outgoing: mpsc::Sender<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Socket {
    fn is_open(&self) -> bool {
        !self.outgoing.is_closed() && !self.reader.is_finished()
    }

    fn shutdown(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Supabase realtime + REST backend.
pub struct SupabaseBackend {
    config: BackendConfig,
    http: reqwest::Client,
    socket: tokio::sync::Mutex<Option<Socket>>,
    routes: Arc<Routes>,
    next_ref: AtomicU64,
    next_channel: AtomicU64,
}

impl SupabaseBackend {
    pub fn new(config: BackendConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            config,
            http,
            socket: tokio::sync::Mutex::new(None),
            routes: Arc::new(Routes::default()),
            next_ref: AtomicU64::new(1),
            next_channel: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn make_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header("apikey", &self.config.anon_key)
            .bearer_auth(&self.config.anon_key)
    }

    /// Return the outgoing sender of a live socket, opening one if needed.
    async fn ensure_socket(&self) -> Result<mpsc::Sender<String>, TransportError> {
        let mut socket = self.socket.lock().await;
        if let Some(existing) = socket.as_ref() {
            if existing.is_open() {
                return Ok(existing.outgoing.clone());
            }
        }
        if let Some(stale) = socket.take() {
            stale.shutdown();
        }

        let url = self.config.realtime_url();
        let connect = tokio_tungstenite::connect_async(url.as_str());
        let (ws_stream, _) = tokio::time::timeout(self.config.request_timeout, connect)
            .await
            .map_err(|_| TransportError::timeout("realtime handshake timed out"))??;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let routes = self.routes.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(msg @ Message::Text(_)) => match msg.to_text().map(Frame::decode) {
                        Ok(Ok(frame)) => routes.dispatch(frame),
                        _ => log::debug!("Ignoring undecodable realtime frame"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::info!("Realtime socket closed");
            routes.fail_all("realtime socket closed");
        });

        log::info!("Realtime socket opened to {}", self.config.host());
        *socket = Some(Socket {
            outgoing: out_tx.clone(),
            reader,
            writer,
        });
        Ok(out_tx)
    }

    /// Send a frame and wait for its `phx_reply`.
    async fn request(
        &self,
        outgoing: &mpsc::Sender<String>,
        frame: Frame,
    ) -> Result<Reply, TransportError> {
        let reference = frame
            .reference
            .clone()
            .ok_or_else(|| TransportError::unknown("request frame without ref"))?;
        let (tx, rx) = oneshot::channel();
        lock(&self.routes.pending).insert(reference.clone(), tx);

        let text = frame
            .encode()
            .map_err(|e| TransportError::unknown(e.to_string()))?;
        if outgoing.send(text).await.is_err() {
            lock(&self.routes.pending).remove(&reference);
            return Err(TransportError::network("realtime socket closed"));
        }

        match tokio::time::timeout(self.config.join_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(TransportError::network("realtime socket closed")),
            Err(_) => {
                lock(&self.routes.pending).remove(&reference);
                Err(TransportError::timeout("no reply from realtime service"))
            }
        }
    }
}

#[async_trait]
impl RealtimeBackend for SupabaseBackend {
    async fn probe(&self) -> Result<(), TransportError> {
        let url = self.config.rest_url(&self.config.probe_table);
        let response = self
            .authorized(self.http.get(url))
            .query(&[("select", "*"), ("limit", "1")])
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::from_status(status.as_u16(), &body))
    }

    async fn heartbeat(&self) -> Result<(), TransportError> {
        let outgoing = {
            let socket = self.socket.lock().await;
            socket
                .as_ref()
                .filter(|s| s.is_open())
                .map(|s| s.outgoing.clone())
        };
        match outgoing {
            Some(outgoing) => {
                let reply = self.request(&outgoing, Frame::heartbeat(self.make_ref())).await?;
                if reply.ok {
                    Ok(())
                } else {
                    Err(TransportError::service_unavailable(reply.reason()))
                }
            }
            // No socket open: fall back to the HTTP probe
            None => self.probe().await,
        }
    }

    async fn subscribe(
        &self,
        name: &str,
        spec: &ChangeSpec,
    ) -> Result<ChannelHandle, TransportError> {
        let outgoing = self.ensure_socket().await?;
        let topic = channel_topic(name);
        let id = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);

        lock(&self.routes.channels).insert(
            topic.clone(),
            ChannelRoute {
                id,
                tx: tx.clone(),
            },
        );

        let join = Frame::join(&topic, spec, &self.config.anon_key, self.make_ref());
        let reference = join.reference.clone().unwrap_or_default();
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.routes.pending).insert(reference.clone(), reply_tx);

        let text = join
            .encode()
            .map_err(|e| TransportError::unknown(e.to_string()))?;
        if outgoing.send(text).await.is_err() {
            lock(&self.routes.pending).remove(&reference);
            lock(&self.routes.channels).remove(&topic);
            return Err(TransportError::network("realtime socket closed"));
        }

        // The join outcome arrives asynchronously as the first status message
        let routes = self.routes.clone();
        let join_timeout = self.config.join_timeout;
        let join_topic = topic.clone();
        tokio::spawn(async move {
            let status = match tokio::time::timeout(join_timeout, reply_rx).await {
                Ok(Ok(reply)) if reply.ok => ChannelMessage::status(ChannelStatus::Subscribed),
                Ok(Ok(reply)) => ChannelMessage::Status {
                    status: ChannelStatus::ChannelError,
                    detail: Some(reply.reason()),
                },
                Ok(Err(_)) => ChannelMessage::Status {
                    status: ChannelStatus::ChannelError,
                    detail: Some("realtime socket closed".to_string()),
                },
                Err(_) => {
                    lock(&routes.pending).remove(&reference);
                    ChannelMessage::status(ChannelStatus::TimedOut)
                }
            };
            log::debug!("Join {join_topic}: {status:?}");
            let _ = tx.send(status).await;
        });

        Ok(ChannelHandle {
            id,
            topic,
            messages: rx,
        })
    }

    async fn unsubscribe(&self, channel: ChannelId) {
        let topic = {
            let mut channels = lock(&self.routes.channels);
            let topic = channels
                .iter()
                .find(|(_, route)| route.id == channel)
                .map(|(topic, _)| topic.clone());
            if let Some(topic) = &topic {
                channels.remove(topic);
            }
            topic
        };
        let Some(topic) = topic else {
            return;
        };

        let outgoing = {
            let socket = self.socket.lock().await;
            socket
                .as_ref()
                .filter(|s| s.is_open())
                .map(|s| s.outgoing.clone())
        };
        if let Some(outgoing) = outgoing {
            if let Ok(text) = Frame::leave(&topic, self.make_ref()).encode() {
                let _ = outgoing.send(text).await;
            }
        }
        log::debug!("Left channel {topic}");
    }

    async fn disconnect(&self) {
        if let Some(socket) = self.socket.lock().await.take() {
            socket.shutdown();
            log::info!("Realtime socket disconnected");
        }
        let routes: Vec<ChannelRoute> = lock(&self.routes.channels)
            .drain()
            .map(|(_, route)| route)
            .collect();
        for route in routes {
            let _ = route.tx.try_send(ChannelMessage::status(ChannelStatus::Closed));
        }
        lock(&self.routes.pending).clear();
    }
}

#[async_trait]
impl DataWriter for SupabaseBackend {
    async fn write(&self, target: &str, payload: &Value) -> Result<(), TransportError> {
        let response = self
            .authorized(self.http.post(self.config.rest_url(target)))
            .header("Prefer", "return=minimal")
            .json(payload)
            .send()
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::from_status(status.as_u16(), &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeEventType;

    fn routes_with_channel(topic: &str) -> (Routes, mpsc::Receiver<ChannelMessage>) {
        let routes = Routes::default();
        let (tx, rx) = mpsc::channel(8);
        lock(&routes.channels).insert(topic.to_string(), ChannelRoute { id: 1, tx });
        (routes, rx)
    }

    #[tokio::test]
    async fn test_dispatch_routes_changes_by_topic() {
        let (routes, mut rx) = routes_with_channel("realtime:messages-changes-1");
        let frame = Frame::decode(
            r#"{"topic":"realtime:messages-changes-1","event":"postgres_changes",
                "payload":{"data":{"type":"INSERT","schema":"public","table":"messages","record":{"id":5}}},"ref":null}"#,
        )
        .unwrap();
        routes.dispatch(frame);

        match rx.recv().await {
            Some(ChannelMessage::Change(event)) => {
                assert_eq!(event.event_type, ChangeEventType::Insert);
                assert_eq!(event.record["id"], 5);
            }
            other => panic!("expected change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_resolves_pending_reply() {
        let routes = Routes::default();
        let (tx, rx) = oneshot::channel();
        lock(&routes.pending).insert("7".to_string(), tx);

        let frame = Frame::decode(
            r#"{"topic":"phoenix","event":"phx_reply","payload":{"status":"ok","response":{}},"ref":"7"}"#,
        )
        .unwrap();
        routes.dispatch(frame);

        assert!(rx.await.unwrap().ok);
        assert!(lock(&routes.pending).is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_maps_close_and_error() {
        let (routes, mut rx) = routes_with_channel("realtime:a");
        routes.dispatch(Frame::new("realtime:a", EVENT_ERROR, Value::Null, None));
        routes.dispatch(Frame::new("realtime:a", EVENT_CLOSE, Value::Null, None));

        assert!(matches!(
            rx.recv().await,
            Some(ChannelMessage::Status { status: ChannelStatus::ChannelError, .. })
        ));
        assert!(matches!(
            rx.recv().await,
            Some(ChannelMessage::Status { status: ChannelStatus::Closed, .. })
        ));
    }

    #[tokio::test]
    async fn test_fail_all_notifies_every_channel() {
        let (routes, mut rx) = routes_with_channel("realtime:a");
        routes.fail_all("gone");
        assert!(lock(&routes.channels).is_empty());
        match rx.recv().await {
            Some(ChannelMessage::Status { status, detail }) => {
                assert_eq!(status, ChannelStatus::ChannelError);
                assert_eq!(detail.as_deref(), Some("gone"));
            }
            other => panic!("expected status, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_topic_is_ignored() {
        let (routes, mut rx) = routes_with_channel("realtime:a");
        routes.dispatch(Frame::new("realtime:other", EVENT_CLOSE, Value::Null, None));
        assert!(rx.try_recv().is_err());
    }
}

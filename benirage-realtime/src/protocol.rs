//! Realtime wire protocol.
//!
//! The realtime service speaks Phoenix channels over a single WebSocket.
//! Every frame is a JSON object:
//! ```text
//! { "topic": "realtime:<channel>", "event": "<event>", "payload": {...}, "ref": "42" }
//! ```
//!
//! One socket carries many channels; frames are routed by `topic`.
//! Joins carry a `postgres_changes` config describing which row events the
//! channel wants. Row events arrive as `postgres_changes` frames.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const PHOENIX_TOPIC: &str = "phoenix";
pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_SYSTEM: &str = "system";

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame encoding failed: {0}")]
    Encode(String),
    #[error("frame decoding failed: {0}")]
    Decode(String),
    #[error("unexpected payload: {0}")]
    InvalidPayload(String),
}

/// A single Phoenix frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

impl Frame {
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference,
            join_ref: None,
        }
    }

    /// Join request for a channel.
    pub fn join(topic: &str, spec: &ChangeSpec, access_token: &str, reference: String) -> Self {
        let mut frame = Self::new(
            topic,
            EVENT_JOIN,
            spec.join_payload(access_token),
            Some(reference.clone()),
        );
        frame.join_ref = Some(reference);
        frame
    }

    /// Leave request for a channel.
    pub fn leave(topic: &str, reference: String) -> Self {
        Self::new(topic, EVENT_LEAVE, json!({}), Some(reference))
    }

    /// Socket-level heartbeat.
    pub fn heartbeat(reference: String) -> Self {
        Self::new(PHOENIX_TOPIC, EVENT_HEARTBEAT, json!({}), Some(reference))
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Decode(e.to_string()))
    }

    /// Parse a `phx_reply` payload.
    pub fn reply(&self) -> Result<Reply, ProtocolError> {
        if self.event != EVENT_REPLY {
            return Err(ProtocolError::InvalidPayload(format!(
                "expected {EVENT_REPLY}, got {}",
                self.event
            )));
        }
        let ok = self.payload.get("status").and_then(Value::as_str) == Some("ok");
        let response = self.payload.get("response").cloned().unwrap_or(Value::Null);
        Ok(Reply { ok, response })
    }

    /// Parse a `postgres_changes` payload.
    pub fn change_event(&self) -> Result<ChangeEvent, ProtocolError> {
        if self.event != EVENT_POSTGRES_CHANGES {
            return Err(ProtocolError::InvalidPayload(format!(
                "expected {EVENT_POSTGRES_CHANGES}, got {}",
                self.event
            )));
        }
        let data = self
            .payload
            .get("data")
            .cloned()
            .ok_or_else(|| ProtocolError::InvalidPayload("missing data".to_string()))?;
        serde_json::from_value(data).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

/// Server reply to a request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub ok: bool,
    pub response: Value,
}

impl Reply {
    /// Best-effort human readable reason for an error reply.
    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| self.response.to_string())
    }
}

/// What a channel subscribes to: all row events on one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeSpec {
    pub schema: String,
    pub table: String,
    /// Server-side filter, e.g. `room_id=eq.42`
    pub filter: Option<String>,
}

impl ChangeSpec {
    pub fn new(schema: impl Into<String>, table: impl Into<String>, filter: Option<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
            filter,
        }
    }

    /// Payload of the `phx_join` frame.
    pub fn join_payload(&self, access_token: &str) -> Value {
        let mut change = json!({
            "event": "*",
            "schema": self.schema,
            "table": self.table,
        });
        if let Some(filter) = &self.filter {
            change["filter"] = Value::String(filter.clone());
        }
        json!({
            "config": {
                "broadcast": { "ack": false, "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        })
    }
}

/// Channel topic for a subscription name.
pub fn channel_topic(name: &str) -> String {
    format!("realtime:{name}")
}

/// Row event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

/// A row-level change pushed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: ChangeEventType,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
    #[serde(default)]
    pub commit_timestamp: Option<String>,
}

/// Lifecycle status of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        }
    }
}

impl std::fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item delivered on a channel's message stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Status {
        status: ChannelStatus,
        detail: Option<String>,
    },
    Change(ChangeEvent),
}

impl ChannelMessage {
    pub fn status(status: ChannelStatus) -> Self {
        ChannelMessage::Status {
            status,
            detail: None,
        }
    }
}

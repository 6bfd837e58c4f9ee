//! Wire protocol messages.
//!
//! Every frame is a JSON object `{type, payload, id?, timestamp}`. `type` is
//! drawn from the closed [`MessageType`] set; anything else is rejected as
//! malformed, logged by the caller and dropped.

use crate::error::{SyncError, SyncResult};
use dashsync_types::{BatchUpdate, OperationId, Timestamp, UpdateItem};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Closed set of message types understood on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    // Connection control
    Connect,
    Disconnect,
    Ping,
    Pong,
    // Entity updates
    DashboardUpdate,
    WidgetUpdate,
    LayoutUpdate,
    // Sync
    SyncRequest,
    SyncResponse,
    SyncBatch,
    Ack,
    Nack,
    // Server
    ServerBroadcast,
    ServerError,
    ServerInfo,
}

impl MessageType {
    /// Every message type, in declaration order.
    pub const ALL: [MessageType; 15] = [
        Self::Connect,
        Self::Disconnect,
        Self::Ping,
        Self::Pong,
        Self::DashboardUpdate,
        Self::WidgetUpdate,
        Self::LayoutUpdate,
        Self::SyncRequest,
        Self::SyncResponse,
        Self::SyncBatch,
        Self::Ack,
        Self::Nack,
        Self::ServerBroadcast,
        Self::ServerError,
        Self::ServerInfo,
    ];

    /// The wire name of this type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Disconnect => "DISCONNECT",
            Self::Ping => "PING",
            Self::Pong => "PONG",
            Self::DashboardUpdate => "DASHBOARD_UPDATE",
            Self::WidgetUpdate => "WIDGET_UPDATE",
            Self::LayoutUpdate => "LAYOUT_UPDATE",
            Self::SyncRequest => "SYNC_REQUEST",
            Self::SyncResponse => "SYNC_RESPONSE",
            Self::SyncBatch => "SYNC_BATCH",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::ServerBroadcast => "SERVER_BROADCAST",
            Self::ServerError => "SERVER_ERROR",
            Self::ServerInfo => "SERVER_INFO",
        }
    }

    /// Looks a type up by its wire name.
    #[must_use]
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Whether messages of this type carry remote updates for the inbound
    /// pipeline.
    #[must_use]
    pub fn carries_updates(&self) -> bool {
        matches!(
            self,
            Self::DashboardUpdate
                | Self::WidgetUpdate
                | Self::LayoutUpdate
                | Self::SyncResponse
                | Self::SyncBatch
                | Self::ServerBroadcast
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A framed wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Message type.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Value,
    /// Correlation id for request/response pairs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// When the sender created the message.
    #[serde(default)]
    pub timestamp: Timestamp,
}

impl WireMessage {
    /// Creates a message without a correlation id.
    pub fn new(message_type: MessageType, payload: Value, timestamp: Timestamp) -> Self {
        Self {
            message_type,
            payload,
            id: None,
            timestamp,
        }
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// A heartbeat ping.
    pub fn ping(timestamp: Timestamp) -> Self {
        Self::new(MessageType::Ping, Value::Null, timestamp)
    }

    /// A heartbeat reply.
    pub fn pong(timestamp: Timestamp) -> Self {
        Self::new(MessageType::Pong, Value::Null, timestamp)
    }

    /// A `SYNC_BATCH` request carrying a processed batch, correlated by the
    /// batch id.
    pub fn sync_batch(batch: &BatchUpdate, timestamp: Timestamp) -> SyncResult<Self> {
        Self::sync_items(batch.id.to_string(), &batch.items, timestamp)
    }

    /// A `SYNC_BATCH` request carrying arbitrary items.
    pub fn sync_items(
        request_id: impl Into<String>,
        items: &[UpdateItem],
        timestamp: Timestamp,
    ) -> SyncResult<Self> {
        let payload = serde_json::to_value(UpdatesPayload {
            items: items.to_vec(),
        })?;
        Ok(Self::new(MessageType::SyncBatch, payload, timestamp).with_id(request_id))
    }

    /// Parses a raw text frame.
    pub fn parse(text: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::MalformedMessage(format!("invalid JSON: {e}")))?;
        Self::from_value(value)
    }

    /// Interprets an already-decoded JSON value as a message.
    pub fn from_value(value: Value) -> SyncResult<Self> {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return Err(SyncError::MalformedMessage("missing message type".into()));
        };
        if MessageType::from_wire(kind).is_none() {
            return Err(SyncError::MalformedMessage(format!(
                "unknown message type `{kind}`"
            )));
        }
        serde_json::from_value(value).map_err(|e| SyncError::MalformedMessage(e.to_string()))
    }

    /// Serializes the message into a text frame.
    pub fn to_json(&self) -> SyncResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes the payload into a typed body.
    pub fn payload_as<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            SyncError::MalformedMessage(format!("bad {} payload: {e}", self.message_type))
        })
    }

    /// Extracts the update items carried by an update-bearing message.
    ///
    /// The payload is either `{items: [...]}` or a single update item.
    pub fn updates(&self) -> SyncResult<Vec<UpdateItem>> {
        if !self.message_type.carries_updates() {
            return Ok(Vec::new());
        }
        if self.payload.get("items").is_some() {
            Ok(self.payload_as::<UpdatesPayload>()?.items)
        } else {
            Ok(vec![self.payload_as::<UpdateItem>()?])
        }
    }
}

/// Body of `SYNC_BATCH` / `SYNC_RESPONSE` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatesPayload {
    /// The carried updates.
    #[serde(default)]
    pub items: Vec<UpdateItem>,
}

/// Body of `ACK` / `NACK` messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Operations the server applied.
    #[serde(default)]
    pub confirmed: Vec<ConfirmedOperation>,
    /// Operations the server refused.
    #[serde(default)]
    pub rejected: Vec<RejectedOperation>,
    /// Request-level refusal reason (`NACK` without per-item detail).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One operation the server applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmedOperation {
    /// The operation (update item) id.
    pub id: OperationId,
    /// Authoritative value of the touched fields, when it differs from what
    /// was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// One operation the server refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedOperation {
    /// The operation (update item) id.
    pub id: OperationId,
    /// Why it was refused.
    #[serde(default)]
    pub reason: String,
}

/// Body of `SERVER_ERROR` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerErrorPayload {
    /// Machine-readable code.
    #[serde(default)]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

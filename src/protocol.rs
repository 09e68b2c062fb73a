//! Wire frame decoding and construction.
//!
//! Frames are JSON objects with at least a `type` field. The payload is
//! either nested under `data` or spread flat alongside `type`:
//!
//! ```text
//! {"type": "domain.event.message_appended", "data": {"message": {...}}}
//! {"type": "message", "id": "m1", "conversationId": "c1", ...}
//! {"type": "ping", "ts": 1767225600000}
//! ```
//!
//! [`decode`] turns a frame into an [`InboundEvent`] so downstream code
//! matches exhaustively on enum variants instead of type strings.

// Rust guideline compliant 2026-02

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ClientError, Result};
use crate::model::{
    ConversationId, ConversationSummary, MessageId, OutboundMessage, SenderType, ServerMessage,
    TempId,
};

/// Raw JSON frame as carried by the transport.
pub type Frame = Value;

/// Prefix used by servers that namespace domain events.
const DOMAIN_PREFIX: &str = "domain.event.";

/// Heartbeat frames, handled by the connection manager itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heartbeat {
    /// Liveness probe; must be answered with a pong echoing `ts`.
    Ping {
        /// Sender timestamp in unix milliseconds.
        ts: i64,
    },
    /// Answer to a ping.
    Pong {
        /// Echoed timestamp of the ping being answered.
        ts: i64,
    },
}

/// Connection-level notifications, consumed internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Transport opened (locally) or server welcome received.
    Connected,
    /// Transport lost.
    Disconnected {
        /// Human-readable cause.
        reason: String,
    },
    /// Transport or server reported an error.
    Error {
        /// Error description.
        message: String,
    },
}

/// Domain events forwarded to the store and pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    /// A message was persisted (possibly acknowledging a local temp record).
    MessageAppended(ServerMessage),
    /// A conversation appeared.
    ConversationCreated(ConversationSummary),
    /// Conversation metadata changed.
    ConversationUpdated(ConversationSummary),
    /// A message was read (possibly on another device).
    MessageRead {
        /// Owning conversation.
        conversation_id: ConversationId,
        /// Message that was read.
        message_id: MessageId,
        /// Read time.
        read_at: DateTime<Utc>,
    },
    /// Typing indicator from the remote party.
    Typing {
        /// Conversation being typed in.
        conversation_id: ConversationId,
        /// Who is typing.
        sender_type: SenderType,
        /// Started (true) or stopped (false).
        is_typing: bool,
    },
}

impl DomainEvent {
    /// Conversation this event belongs to.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::MessageAppended(m) => &m.conversation_id,
            Self::ConversationCreated(c) | Self::ConversationUpdated(c) => &c.id,
            Self::MessageRead {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Ping or pong.
    Heartbeat(Heartbeat),
    /// Transport family.
    Transport(TransportEvent),
    /// Domain family.
    Domain(DomainEvent),
    /// Type this client does not understand.
    Unknown {
        /// The unrecognized `type` value.
        event_type: String,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadPayload {
    #[serde(alias = "conversation_id")]
    conversation_id: ConversationId,
    #[serde(alias = "message_id", alias = "id")]
    message_id: MessageId,
    #[serde(default = "Utc::now", alias = "read_at")]
    read_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypingPayload {
    #[serde(alias = "conversation_id")]
    conversation_id: ConversationId,
    #[serde(default, alias = "sender_type")]
    sender_type: SenderType,
    #[serde(default = "default_true", alias = "is_typing")]
    is_typing: bool,
}

fn default_true() -> bool {
    true
}

/// Current wall-clock time in unix milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// The frame's `type` field.
pub fn event_type(frame: &Frame) -> Result<&str> {
    if !frame.is_object() {
        return Err(ClientError::Protocol("frame is not a JSON object".into()));
    }
    frame
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Protocol("frame has no string `type`".into()))
}

/// The frame's payload: `data` when it is an object, otherwise the frame.
pub fn payload(frame: &Frame) -> &Value {
    match frame.get("data") {
        Some(data) if data.is_object() => data,
        _ => frame,
    }
}

/// Parse a text frame into JSON.
pub fn parse_text(text: &str) -> Result<Frame> {
    let frame: Frame = serde_json::from_str(text)?;
    event_type(&frame)?;
    Ok(frame)
}

/// Decode a frame into a typed event.
///
/// # Errors
///
/// Returns [`ClientError::Protocol`] when the frame has no type or a known
/// type carries a payload that does not deserialize.
pub fn decode(frame: &Frame) -> Result<InboundEvent> {
    let raw_type = event_type(frame)?;
    let kind = raw_type.strip_prefix(DOMAIN_PREFIX).unwrap_or(raw_type);
    let data = payload(frame);

    let event = match kind {
        "ping" => InboundEvent::Heartbeat(Heartbeat::Ping { ts: timestamp(data)? }),
        "pong" => InboundEvent::Heartbeat(Heartbeat::Pong { ts: timestamp(data)? }),
        "connected" | "system.welcome" | "welcome" => {
            InboundEvent::Transport(TransportEvent::Connected)
        }
        "disconnected" | "disconnect" => InboundEvent::Transport(TransportEvent::Disconnected {
            reason: text_field(data, "reason"),
        }),
        "error" => InboundEvent::Transport(TransportEvent::Error {
            message: text_field(data, "message"),
        }),
        "message" | "message_appended" | "new_message" => {
            InboundEvent::Domain(DomainEvent::MessageAppended(server_message(data)?))
        }
        "conversation_created" => InboundEvent::Domain(DomainEvent::ConversationCreated(
            conversation(data)?,
        )),
        "conversation_updated" => InboundEvent::Domain(DomainEvent::ConversationUpdated(
            conversation(data)?,
        )),
        "message_read" => {
            let read: ReadPayload = serde_json::from_value(data.clone())?;
            InboundEvent::Domain(DomainEvent::MessageRead {
                conversation_id: read.conversation_id,
                message_id: read.message_id,
                read_at: read.read_at,
            })
        }
        "typing" => {
            let typing: TypingPayload = serde_json::from_value(data.clone())?;
            InboundEvent::Domain(DomainEvent::Typing {
                conversation_id: typing.conversation_id,
                sender_type: typing.sender_type,
                is_typing: typing.is_typing,
            })
        }
        other => InboundEvent::Unknown {
            event_type: other.to_string(),
        },
    };
    Ok(event)
}

fn timestamp(data: &Value) -> Result<i64> {
    data.get("ts")
        .or_else(|| data.get("timestamp"))
        .and_then(Value::as_i64)
        .ok_or_else(|| ClientError::Protocol("heartbeat frame has no numeric ts".into()))
}

fn text_field(data: &Value, key: &str) -> String {
    data.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Extract a server message from a `message_appended` payload.
///
/// Accepts the record itself or `{conversationId, message: {...}}`; in the
/// latter case a conversation id missing from the inner record is taken
/// from the envelope.
fn server_message(data: &Value) -> Result<ServerMessage> {
    let Some(inner) = data.get("message").filter(|m| m.is_object()) else {
        return Ok(serde_json::from_value(data.clone())?);
    };
    let mut record = inner.clone();
    if let Some(obj) = record.as_object_mut() {
        let has_conversation =
            obj.contains_key("conversationId") || obj.contains_key("conversation_id");
        if !has_conversation {
            if let Some(conv) = data
                .get("conversationId")
                .or_else(|| data.get("conversation_id"))
            {
                obj.insert("conversationId".into(), conv.clone());
            }
        }
    }
    Ok(serde_json::from_value(record)?)
}

fn conversation(data: &Value) -> Result<ConversationSummary> {
    let record = data
        .get("conversation")
        .filter(|c| c.is_object())
        .unwrap_or(data);
    Ok(serde_json::from_value(record.clone())?)
}

// ============================================================================
// Outbound frames
// ============================================================================

/// Heartbeat ping carrying a client timestamp.
pub fn ping(ts: i64) -> Frame {
    json!({ "type": "ping", "ts": ts })
}

/// Answer to a server ping.
pub fn pong(ts: i64) -> Frame {
    json!({ "type": "pong", "ts": ts })
}

/// Socket send for an outbound message.
pub fn send_message(message: &OutboundMessage) -> Frame {
    json!({
        "type": "send_message",
        "conversationId": message.conversation_id,
        "content": message.content,
        "tempId": message.temp_id,
    })
}

/// Temp id carried by a `send_message` frame, if `frame` is one.
pub fn send_message_temp_id(frame: &Frame) -> Option<TempId> {
    if frame.get("type").and_then(Value::as_str) != Some("send_message") {
        return None;
    }
    frame
        .get("tempId")
        .and_then(Value::as_str)
        .map(TempId::from)
}

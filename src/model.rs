//! Domain types shared by the store, pipeline and router.
//!
//! A conversation's message list holds [`MessageRecord`]s: either a local
//! [`OutboundMessage`] still waiting for the server, or an authoritative
//! [`ServerMessage`]. Reconciliation swaps the former for the latter in
//! place.
//!
//! Wire field names are camelCase; snake_case aliases are accepted on input
//! because older servers still emit them.

// Rust guideline compliant 2026-02

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::constants::FINGERPRINT_CONTENT_CHARS;

/// Ids arrive as strings or integers depending on the server backend.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Str(String),
    Int(i64),
    Float(f64),
}

impl RawId {
    fn into_string(self) -> String {
        match self {
            Self::Str(s) => s,
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
        }
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the raw id.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                RawId::deserialize(deserializer).map(|raw| Self(raw.into_string()))
            }
        }
    };
}

string_id!(
    /// Server-side conversation identifier.
    ConversationId
);
string_id!(
    /// Server-assigned permanent message identifier.
    MessageId
);
string_id!(
    /// Client-generated provisional message identifier.
    TempId
);

impl TempId {
    /// Generate a fresh temp id: `tmp_<unix-ms base36>_<8 hex>`.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64;
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("tmp_{}_{}", to_base36(millis), &suffix[..8]))
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    /// End customer (the remote party for an agent client).
    Customer,
    /// Support agent or shop operator.
    #[default]
    Agent,
    /// Automated responder.
    Bot,
    /// Server-generated notice.
    System,
    /// Any sender type this client does not know.
    #[serde(other)]
    Unknown,
}

/// Delivery status of a message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Queued locally, no attempt in flight.
    Pending,
    /// Handed to a transport, waiting for the server record.
    Dispatched,
    /// Confirmed by the server.
    Sent,
    /// Retry budget exhausted; waiting for manual resend.
    Failed,
}

/// Coarse cause of a failed send attempt, for display and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SendErrorCode {
    /// No open transport and no usable fallback.
    NotConnected,
    /// The route did not answer in time.
    Timeout,
    /// The server throttled the sender.
    RateLimit,
    /// The server rejected the message itself.
    PayloadInvalid,
    /// The server failed while handling the message.
    ServerError,
    /// Anything else.
    Unknown,
}

impl SendErrorCode {
    /// Classify an HTTP status.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => Self::Timeout,
            429 => Self::RateLimit,
            400..=499 => Self::PayloadInvalid,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }
}

/// Optimistic local record for a message the server has not confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Provisional id, unique per session.
    pub temp_id: TempId,
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Message body.
    pub content: String,
    /// Current delivery status.
    pub status: MessageStatus,
    /// Failed attempts so far.
    pub attempt: u32,
    /// Local creation time.
    pub created_at: DateTime<Utc>,
    /// Last delivery error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Classification of `last_error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<SendErrorCode>,
}

impl OutboundMessage {
    /// Create a pending record with a fresh temp id.
    pub fn new(conversation_id: ConversationId, content: impl Into<String>) -> Self {
        Self {
            temp_id: TempId::generate(),
            conversation_id,
            content: content.into(),
            status: MessageStatus::Pending,
            attempt: 0,
            created_at: Utc::now(),
            last_error: None,
            error_code: None,
        }
    }

    /// Identity used to suppress accidental double sends: the conversation
    /// plus the first 32 characters of the content.
    pub fn fingerprint(&self) -> String {
        let prefix: String = self.content.chars().take(FINGERPRINT_CONTENT_CHARS).collect();
        format!("{}|{prefix}", self.conversation_id)
    }
}

/// Authoritative message record as persisted by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    /// Server-assigned id.
    pub id: MessageId,
    /// Back-reference to the temp record this message confirms.
    #[serde(default, alias = "temp_id", skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<TempId>,
    /// Owning conversation.
    #[serde(alias = "conversation_id")]
    pub conversation_id: ConversationId,
    /// Author kind.
    #[serde(default, alias = "sender_type")]
    pub sender_type: SenderType,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Server creation time.
    #[serde(default = "Utc::now", alias = "created_at")]
    pub created_at: DateTime<Utc>,
    /// When the local user read the message.
    #[serde(default, alias = "read_at")]
    pub read_at: Option<DateTime<Utc>>,
    /// Monotonic per-conversation sequence number, when the server provides one.
    #[serde(default, alias = "sequence_id", skip_serializing_if = "Option::is_none")]
    pub sequence: Option<i64>,
}

/// Entry in a conversation's message list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageRecord {
    /// Local optimistic record.
    Outbound(OutboundMessage),
    /// Server-confirmed record.
    Server(ServerMessage),
}

/// Lookup key accepted by store operations that match "by id or temp id".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKey {
    /// Match the server id.
    Id(MessageId),
    /// Match the temp id (of an outbound record or a server back-reference).
    Temp(TempId),
}

impl MessageRecord {
    /// Server id, once confirmed.
    pub fn id(&self) -> Option<&MessageId> {
        match self {
            Self::Outbound(_) => None,
            Self::Server(m) => Some(&m.id),
        }
    }

    /// Temp id of an outbound record, or the back-reference of a server record.
    pub fn temp_id(&self) -> Option<&TempId> {
        match self {
            Self::Outbound(m) => Some(&m.temp_id),
            Self::Server(m) => m.temp_id.as_ref(),
        }
    }

    /// Owning conversation.
    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::Outbound(m) => &m.conversation_id,
            Self::Server(m) => &m.conversation_id,
        }
    }

    /// Message body.
    pub fn content(&self) -> &str {
        match self {
            Self::Outbound(m) => &m.content,
            Self::Server(m) => &m.content,
        }
    }

    /// Delivery status; server records are always `Sent`.
    pub fn status(&self) -> MessageStatus {
        match self {
            Self::Outbound(m) => m.status,
            Self::Server(_) => MessageStatus::Sent,
        }
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Self::Outbound(m) => m.created_at,
            Self::Server(m) => m.created_at,
        }
    }

    /// Whether `key` identifies this record.
    pub fn matches(&self, key: &MessageKey) -> bool {
        match key {
            MessageKey::Id(id) => self.id() == Some(id),
            MessageKey::Temp(temp) => self.temp_id() == Some(temp),
        }
    }

    /// Borrow the outbound record, if still local.
    pub fn as_outbound(&self) -> Option<&OutboundMessage> {
        match self {
            Self::Outbound(m) => Some(m),
            Self::Server(_) => None,
        }
    }

    /// Borrow the server record, if confirmed.
    pub fn as_server(&self) -> Option<&ServerMessage> {
        match self {
            Self::Outbound(_) => None,
            Self::Server(m) => Some(m),
        }
    }
}

/// Position of the oldest loaded message, used as the `before` cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorPosition {
    /// Opaque cursor sent to the history endpoint (the message id).
    pub cursor: String,
    /// Creation time of that message, for ordering comparisons.
    pub created_at: DateTime<Utc>,
}

/// Per-conversation position markers for incremental history retrieval.
///
/// Merging never regresses: `oldest` only moves further back in time and
/// `newest_sequence_id` only grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCursor {
    /// Oldest server message currently loaded.
    pub oldest: Option<CursorPosition>,
    /// Highest server sequence number seen.
    pub newest_sequence_id: Option<i64>,
}

impl ConversationCursor {
    /// Compute markers from a message list (temp records are skipped).
    pub fn from_messages(messages: &[MessageRecord]) -> Self {
        let oldest = messages
            .iter()
            .filter_map(MessageRecord::as_server)
            .next()
            .map(|m| CursorPosition {
                cursor: m.id.0.clone(),
                created_at: m.created_at,
            });
        let newest_sequence_id = messages
            .iter()
            .filter_map(MessageRecord::as_server)
            .filter_map(|m| m.sequence)
            .max();
        Self {
            oldest,
            newest_sequence_id,
        }
    }

    /// Fold freshly computed markers in without moving backwards.
    ///
    /// Returns true if anything changed.
    pub fn merge(&mut self, computed: &Self) -> bool {
        let mut changed = false;
        if let Some(candidate) = &computed.oldest {
            let older = match &self.oldest {
                None => true,
                Some(current) => candidate.created_at < current.created_at,
            };
            if older {
                self.oldest = Some(candidate.clone());
                changed = true;
            }
        }
        if let Some(seq) = computed.newest_sequence_id {
            let grows = match self.newest_sequence_id {
                Some(current) => seq > current,
                None => true,
            };
            if grows {
                self.newest_sequence_id = Some(seq);
                changed = true;
            }
        }
        changed
    }
}

/// Conversation metadata carried by `conversation_created`/`updated` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// Display title.
    #[serde(default)]
    pub title: Option<String>,
    /// Lifecycle status as reported by the server (open, closed, ...).
    #[serde(default)]
    pub status: Option<String>,
    /// Preview of the latest message.
    #[serde(default, alias = "last_message")]
    pub last_message: Option<String>,
    /// Server-side unread counter.
    #[serde(default, alias = "unread_count")]
    pub unread_count: u32,
    /// Last activity.
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn server(id: &str, secs: i64, seq: Option<i64>) -> MessageRecord {
        MessageRecord::Server(ServerMessage {
            id: MessageId::from(id),
            temp_id: None,
            conversation_id: ConversationId::from("c1"),
            sender_type: SenderType::Customer,
            content: String::new(),
            created_at: DateTime::from_timestamp(secs, 0).unwrap_or_default(),
            read_at: None,
            sequence: seq,
        })
    }

    #[test]
    fn test_temp_id_format() {
        let id = TempId::generate();
        let parts: Vec<&str> = id.as_str().split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "tmp");
        assert_eq!(parts[2].len(), 8);
        assert_ne!(id, TempId::generate());
    }

    #[test]
    fn test_fingerprint_uses_content_prefix() {
        let long = "x".repeat(40);
        let a = OutboundMessage::new(ConversationId::from("c1"), format!("{long}a"));
        let b = OutboundMessage::new(ConversationId::from("c1"), format!("{long}b"));
        let other = OutboundMessage::new(ConversationId::from("c2"), format!("{long}a"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), other.fingerprint());
        assert_eq!(a.fingerprint(), format!("c1|{}", "x".repeat(32)));
    }

    #[test]
    fn test_send_error_code_from_status() {
        assert_eq!(SendErrorCode::from_status(408), SendErrorCode::Timeout);
        assert_eq!(SendErrorCode::from_status(429), SendErrorCode::RateLimit);
        assert_eq!(SendErrorCode::from_status(422), SendErrorCode::PayloadInvalid);
        assert_eq!(SendErrorCode::from_status(503), SendErrorCode::ServerError);
        assert_eq!(SendErrorCode::from_status(302), SendErrorCode::Unknown);
        assert_eq!(
            serde_json::to_value(SendErrorCode::NotConnected).unwrap(),
            json!("NOT_CONNECTED")
        );
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[test]
    fn test_server_message_accepts_snake_case_and_numeric_ids() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "id": 42,
            "conversation_id": 7,
            "temp_id": "tmp_abc_12345678",
            "sender_type": "customer",
            "content": "hi",
            "created_at": "2026-01-02T03:04:05Z",
            "read_at": null
        }))
        .unwrap();
        assert_eq!(msg.id.as_str(), "42");
        assert_eq!(msg.conversation_id.as_str(), "7");
        assert_eq!(msg.temp_id, Some(TempId::from("tmp_abc_12345678")));
        assert_eq!(msg.sender_type, SenderType::Customer);
        assert!(msg.read_at.is_none());
    }

    #[test]
    fn test_unknown_sender_type() {
        let msg: ServerMessage = serde_json::from_value(json!({
            "id": "m1", "conversationId": "c1", "senderType": "robot"
        }))
        .unwrap();
        assert_eq!(msg.sender_type, SenderType::Unknown);
    }

    #[test]
    fn test_record_matching() {
        let outbound = MessageRecord::Outbound(OutboundMessage::new("c1".into(), "hello"));
        let temp = outbound.temp_id().cloned().unwrap();
        assert!(outbound.matches(&MessageKey::Temp(temp)));
        assert!(!outbound.matches(&MessageKey::Id(MessageId::from("m1"))));
        assert_eq!(outbound.status(), MessageStatus::Pending);

        let confirmed = server("m1", 10, None);
        assert!(confirmed.matches(&MessageKey::Id(MessageId::from("m1"))));
        assert_eq!(confirmed.status(), MessageStatus::Sent);
    }

    // ========== Cursor Tests ==========

    #[test]
    fn test_cursor_from_messages_skips_temp_records() {
        let messages = vec![
            MessageRecord::Outbound(OutboundMessage::new("c1".into(), "draft")),
            server("m2", 20, Some(2)),
            server("m3", 30, Some(5)),
        ];
        let cursor = ConversationCursor::from_messages(&messages);
        assert_eq!(cursor.oldest.as_ref().map(|p| p.cursor.as_str()), Some("m2"));
        assert_eq!(cursor.newest_sequence_id, Some(5));
    }

    #[test]
    fn test_cursor_merge_never_regresses() {
        let mut cursor = ConversationCursor::from_messages(&[server("m1", 10, Some(9))]);
        let newer = ConversationCursor::from_messages(&[server("m5", 50, Some(3))]);
        assert!(!cursor.merge(&newer));
        assert_eq!(cursor.oldest.as_ref().map(|p| p.cursor.as_str()), Some("m1"));
        assert_eq!(cursor.newest_sequence_id, Some(9));

        let older = ConversationCursor::from_messages(&[server("m0", 5, Some(12))]);
        assert!(cursor.merge(&older));
        assert_eq!(cursor.oldest.as_ref().map(|p| p.cursor.as_str()), Some("m0"));
        assert_eq!(cursor.newest_sequence_id, Some(12));
    }
}

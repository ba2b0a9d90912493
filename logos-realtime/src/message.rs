//! JSON wire envelope for the workspace control channel.
//!
//! Wire format (UTF-8 text frame):
//! ```text
//! {
//!   "type":      "presence" | "chat/message" | <any other kind>,
//!   "payload":   <kind-specific JSON>,
//!   "room":      optional string,
//!   "timestamp": milliseconds since the Unix epoch,
//!   "id":        optional string, "<type>-<timestamp>-<suffix>",
//!   "retry":     optional bool, set on re-delivery attempts
//! }
//! ```
//!
//! Known kinds decode into typed [`MessageBody`] variants. Unknown kinds are
//! kept as [`MessageBody::Custom`] with their raw JSON payload so they can be
//! routed generically.

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::presence::PresenceRecord;

/// `type` of a presence frame.
pub const PRESENCE_KIND: &str = "presence";
/// `type` of a chat frame.
pub const CHAT_KIND: &str = "chat/message";

const ID_SUFFIX_LEN: usize = 9;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a message id from its kind, timestamp and a random suffix.
pub fn generate_message_id(kind: &str, timestamp: u64) -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(ID_SUFFIX_LEN)
        .map(char::from)
        .collect();
    format!("{kind}-{timestamp}-{suffix}")
}

/// Chat payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
}

impl ChatMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            channel_id: None,
            author_id: None,
        }
    }
}

/// Message kinds carried over the control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Presence(PresenceRecord),
    Chat(ChatMessage),
    /// Any kind this crate does not model; routed generically.
    Custom { kind: String, payload: Value },
}

impl MessageBody {
    /// The wire `type` string.
    pub fn kind(&self) -> &str {
        match self {
            MessageBody::Presence(_) => PRESENCE_KIND,
            MessageBody::Chat(_) => CHAT_KIND,
            MessageBody::Custom { kind, .. } => kind,
        }
    }
}

/// One application message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage", into = "RawMessage")]
pub struct Message {
    pub body: MessageBody,
    pub room: Option<String>,
    pub timestamp: Option<u64>,
    pub id: Option<String>,
    /// Re-delivery hint for server-side deduplication.
    pub retry: bool,
}

impl Message {
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            room: None,
            timestamp: None,
            id: None,
            retry: false,
        }
    }

    pub fn presence(record: PresenceRecord) -> Self {
        Self::new(MessageBody::Presence(record))
    }

    pub fn chat(content: impl Into<String>) -> Self {
        Self::new(MessageBody::Chat(ChatMessage::new(content)))
    }

    pub fn custom(kind: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageBody::Custom {
            kind: kind.into(),
            payload,
        })
    }

    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    /// Stamp a timestamp and id where absent. Existing values are kept.
    pub fn prepare(&mut self) {
        let timestamp = *self.timestamp.get_or_insert_with(now_millis);
        if self.id.is_none() {
            self.id = Some(generate_message_id(self.body.kind(), timestamp));
        }
    }

    /// Owned variant of [`Message::prepare`].
    pub fn prepared(mut self) -> Self {
        self.prepare();
        self
    }

    pub fn encode(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Encode(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, MessageError> {
        serde_json::from_str(text).map_err(|e| MessageError::Decode(e.to_string()))
    }
}

/// Untyped wire shape; typed conversion happens in `TryFrom`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    room: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    retry: bool,
}

impl TryFrom<RawMessage> for Message {
    type Error = MessageError;

    fn try_from(raw: RawMessage) -> Result<Self, Self::Error> {
        let invalid = |e: serde_json::Error| MessageError::InvalidPayload {
            kind: raw.kind.clone(),
            reason: e.to_string(),
        };
        let body = match raw.kind.as_str() {
            PRESENCE_KIND => MessageBody::Presence(
                serde_json::from_value(raw.payload.clone()).map_err(invalid)?,
            ),
            CHAT_KIND => {
                MessageBody::Chat(serde_json::from_value(raw.payload.clone()).map_err(invalid)?)
            }
            _ => MessageBody::Custom {
                kind: raw.kind.clone(),
                payload: raw.payload.clone(),
            },
        };
        Ok(Message {
            body,
            room: raw.room,
            timestamp: raw.timestamp,
            id: raw.id,
            retry: raw.retry,
        })
    }
}

impl From<Message> for RawMessage {
    fn from(message: Message) -> Self {
        let kind = message.body.kind().to_string();
        // Typed payloads are plain data structs; serialization cannot fail.
        let payload = match message.body {
            MessageBody::Presence(record) => serde_json::to_value(record).unwrap_or(Value::Null),
            MessageBody::Chat(chat) => serde_json::to_value(chat).unwrap_or(Value::Null),
            MessageBody::Custom { payload, .. } => payload,
        };
        RawMessage {
            kind,
            payload,
            room: message.room,
            timestamp: message.timestamp,
            id: message.id,
            retry: message.retry,
        }
    }
}

/// Envelope errors.
#[derive(Debug, Clone)]
pub enum MessageError {
    Encode(String),
    Decode(String),
    InvalidPayload { kind: String, reason: String },
}

impl std::fmt::Display for MessageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(e) => write!(f, "Message encode error: {e}"),
            Self::Decode(e) => write!(f, "Message decode error: {e}"),
            Self::InvalidPayload { kind, reason } => {
                write!(f, "Invalid payload for message type {kind}: {reason}")
            }
        }
    }
}

impl std::error::Error for MessageError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::PresenceStatus;
    use serde_json::json;

    #[test]
    fn test_prepare_stamps_timestamp_and_id() {
        let msg = Message::chat("hello").prepared();
        let ts = msg.timestamp.unwrap();
        let id = msg.id.clone().unwrap();

        assert!(ts > 0);
        assert!(id.starts_with(&format!("chat/message-{ts}-")));
        assert_eq!(id.len(), format!("chat/message-{ts}-").len() + ID_SUFFIX_LEN);
    }

    #[test]
    fn test_prepare_keeps_existing_fields() {
        let mut msg = Message::chat("hello");
        msg.timestamp = Some(42);
        msg.id = Some("fixed".into());
        msg.prepare();

        assert_eq!(msg.timestamp, Some(42));
        assert_eq!(msg.id.as_deref(), Some("fixed"));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = generate_message_id("x", 1);
        let b = generate_message_id("x", 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_presence_frame() {
        let text = json!({
            "type": "presence",
            "payload": {
                "userId": "u2",
                "status": "away",
                "lastSeen": 1_700_000_000_000u64,
                "workspaceId": "ws1"
            },
            "timestamp": 1_700_000_000_001u64
        })
        .to_string();

        let msg = Message::decode(&text).unwrap();
        match msg.body {
            MessageBody::Presence(record) => {
                assert_eq!(record.user_id, "u2");
                assert_eq!(record.status, PresenceStatus::Away);
                assert_eq!(record.workspace_id, "ws1");
                assert!(record.meta.is_none());
            }
            other => panic!("Expected presence body, got {other:?}"),
        }
        assert_eq!(msg.timestamp, Some(1_700_000_000_001));
        assert!(!msg.retry);
    }

    #[test]
    fn test_decode_unknown_kind_is_custom() {
        let text = r#"{"type":"workspace/renamed","payload":{"name":"Design"},"room":"ws1","timestamp":5}"#;
        let msg = Message::decode(text).unwrap();

        assert_eq!(msg.kind(), "workspace/renamed");
        assert_eq!(msg.room.as_deref(), Some("ws1"));
        match msg.body {
            MessageBody::Custom { payload, .. } => assert_eq!(payload["name"], "Design"),
            other => panic!("Expected custom body, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_bad_presence_payload() {
        let text = r#"{"type":"presence","payload":{"status":"online"},"timestamp":1}"#;
        let err = Message::decode(text).unwrap_err();
        assert!(err.to_string().contains("presence"), "{err}");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Message::decode("not json").is_err());
        assert!(Message::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_encode_wire_shape() {
        let mut msg = Message::chat("hi").with_room("general");
        msg.timestamp = Some(10);
        msg.id = Some("chat/message-10-abc".into());
        msg.retry = true;

        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "chat/message");
        assert_eq!(value["payload"]["content"], "hi");
        assert_eq!(value["room"], "general");
        assert_eq!(value["timestamp"], 10);
        assert_eq!(value["id"], "chat/message-10-abc");
        assert_eq!(value["retry"], true);
    }

    #[test]
    fn test_encode_omits_absent_optionals() {
        let msg = Message::custom("ping", Value::Null);
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();

        let obj = value.as_object().unwrap();
        assert!(!obj.contains_key("room"));
        assert!(!obj.contains_key("id"));
        assert!(!obj.contains_key("retry"));
    }
}

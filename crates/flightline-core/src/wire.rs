//! Peer channel message format
//!
//! Every channel message is either text or binary. Binary messages are file
//! chunks whose position is implied by arrival order. Text messages are one
//! of:
//!
//! ```text
//! {"name": "a.pdf", "type": "application/pdf", "size": 1024}   metadata
//! EOF                                                          end of file
//! {"kind": "chat", "text": "hi", "sentAt": 1700000000000}      chat
//! {"type": "stream-ended"}                                     media control
//! ```
//!
//! Anything else is a protocol violation.

use crate::channel::ChannelMessage;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// End-of-file marker
pub const EOF_MARKER: &str = "EOF";

/// MIME type used when the sender announces none
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// File announcement sent before the first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File name
    pub name: String,
    /// MIME type
    #[serde(rename = "type", default = "default_mime")]
    pub mime_type: String,
    /// Size in bytes
    pub size: u64,
}

fn default_mime() -> String {
    DEFAULT_MIME_TYPE.to_string()
}

impl FileMetadata {
    /// Encode as a text message
    pub fn to_text(&self) -> String {
        serde_json::json!({
            "name": self.name,
            "type": self.mime_type,
            "size": self.size,
        })
        .to_string()
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message text
    pub text: String,
    /// Send time in unix milliseconds
    #[serde(default)]
    pub sent_at: u64,
}

impl ChatMessage {
    /// Create a chat message stamped with the current time
    pub fn now(text: impl Into<String>) -> Self {
        let sent_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        Self {
            text: text.into(),
            sent_at,
        }
    }

    /// Encode as a text message
    pub fn to_text(&self) -> String {
        serde_json::json!({
            "kind": "chat",
            "text": self.text,
            "sentAt": self.sent_at,
        })
        .to_string()
    }
}

/// Decoded inbound peer message
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Start of a new inbound file
    Metadata(FileMetadata),
    /// End of the current inbound file
    Eof,
    /// Chat text
    Chat(ChatMessage),
    /// Remote media stream ended
    StreamEnded,
    /// Next chunk of the current inbound file
    Chunk(Bytes),
    /// Text that matches no known shape
    Malformed(String),
}

impl PeerMessage {
    /// Decode a channel message
    pub fn decode(message: ChannelMessage) -> Self {
        match message {
            ChannelMessage::Binary(bytes) => Self::Chunk(bytes),
            ChannelMessage::Text(text) => Self::parse_text(&text),
        }
    }

    /// Decode a text message
    pub fn parse_text(text: &str) -> Self {
        if text == EOF_MARKER {
            return Self::Eof;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return Self::Malformed(format!("not JSON: {e}")),
        };
        let Value::Object(fields) = &value else {
            return Self::Malformed("not a JSON object".to_string());
        };

        if fields.get("kind").and_then(Value::as_str) == Some("chat") {
            return match serde_json::from_value::<ChatMessage>(value) {
                Ok(chat) => Self::Chat(chat),
                Err(e) => Self::Malformed(format!("bad chat message: {e}")),
            };
        }

        if fields.get("type").and_then(Value::as_str) == Some("stream-ended") {
            return Self::StreamEnded;
        }

        if !fields.contains_key("name") || !fields.contains_key("size") {
            return Self::Malformed("missing file fields".to_string());
        }

        match serde_json::from_value::<FileMetadata>(value) {
            Ok(meta) => Self::Metadata(meta),
            Err(e) => Self::Malformed(format!("bad file metadata: {e}")),
        }
    }
}

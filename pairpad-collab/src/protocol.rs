//! JSON envelope protocol for room synchronization.
//!
//! Every frame on the wire is a single JSON object tagged by `type`:
//! ```text
//! ┌────────────┬───────────┬──────────────────────────────────────────┐
//! │ type       │ direction │ fields                                   │
//! ├────────────┼───────────┼──────────────────────────────────────────┤
//! │ init       │ S → C     │ code, language, roomId                   │
//! │ code_update│ S ↔ C     │ code, cursorPosition                     │
//! │ cursor_move│ S ↔ C     │ cursorPosition                           │
//! │ code_output│ S ↔ C     │ status, output?, error?                  │
//! │ user_count │ S → C     │ count                                    │
//! └────────────┴───────────┴──────────────────────────────────────────┘
//! ```
//!
//! Outbound envelopes are encoded once into a shared [`Frame`] so fan-out
//! never re-serializes per recipient.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Close code sent when a client targets a room the store does not know.
pub const CLOSE_ROOM_NOT_FOUND: u16 = 4004;
pub const CLOSE_ROOM_NOT_FOUND_REASON: &str = "room not found";

/// Close code sent when the room lookup itself failed.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_INTERNAL_ERROR_REASON: &str = "room lookup failed";

/// Pre-encoded JSON text shared by every recipient of one broadcast.
pub type Frame = Arc<str>;

/// Opaque short room identifier (the room's capability).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh 8-character id from a v4 UUID.
    pub fn generate() -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Envelope discriminator, mirrored from the `type` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Init,
    CodeUpdate,
    CursorMove,
    CodeOutput,
    UserCount,
}

impl MessageType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "init" => Some(Self::Init),
            "code_update" => Some(Self::CodeUpdate),
            "cursor_move" => Some(Self::CursorMove),
            "code_output" => Some(Self::CodeOutput),
            "user_count" => Some(Self::UserCount),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::CodeUpdate => "code_update",
            Self::CursorMove => "cursor_move",
            Self::CodeOutput => "code_output",
            Self::UserCount => "user_count",
        }
    }

    /// Whether a client is allowed to send this type while streaming.
    pub fn client_may_send(&self) -> bool {
        matches!(self, Self::CodeUpdate | Self::CursorMove | Self::CodeOutput)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution phase carried by `code_output`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    #[default]
    Running,
    Completed,
    Error,
}

/// A typed protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Snapshot sent once to a newly admitted client.
    Init {
        code: String,
        language: String,
        #[serde(rename = "roomId")]
        room_id: RoomId,
    },
    /// Full buffer replacement (last writer wins).
    CodeUpdate {
        #[serde(default)]
        code: String,
        #[serde(rename = "cursorPosition", default)]
        cursor_position: u64,
    },
    CursorMove {
        #[serde(rename = "cursorPosition", default)]
        cursor_position: u64,
    },
    /// Shared execution output panel.
    CodeOutput {
        #[serde(default)]
        status: OutputStatus,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        error: Option<String>,
    },
    UserCount {
        count: usize,
    },
}

impl Envelope {
    pub fn init(room_id: RoomId, code: impl Into<String>, language: impl Into<String>) -> Self {
        Self::Init {
            code: code.into(),
            language: language.into(),
            room_id,
        }
    }

    pub fn code_update(code: impl Into<String>, cursor_position: u64) -> Self {
        Self::CodeUpdate {
            code: code.into(),
            cursor_position,
        }
    }

    pub fn cursor_move(cursor_position: u64) -> Self {
        Self::CursorMove { cursor_position }
    }

    pub fn code_output(status: OutputStatus, output: Option<String>, error: Option<String>) -> Self {
        Self::CodeOutput {
            status,
            output,
            error,
        }
    }

    pub fn user_count(count: usize) -> Self {
        Self::UserCount { count }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Init { .. } => MessageType::Init,
            Self::CodeUpdate { .. } => MessageType::CodeUpdate,
            Self::CursorMove { .. } => MessageType::CursorMove,
            Self::CodeOutput { .. } => MessageType::CodeOutput,
            Self::UserCount { .. } => MessageType::UserCount,
        }
    }

    /// Serialize to a shareable JSON frame.
    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        let text = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        Ok(Arc::from(text))
    }

    /// Deserialize any envelope, including server-only types.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }

    /// Validate an inbound client frame.
    ///
    /// The `type` tag is checked before the body is interpreted. Anything a
    /// client may not send in the streaming state comes back as
    /// [`Inbound::Ignored`]; this never fails.
    pub fn parse_inbound(text: &str) -> Inbound {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return Inbound::Ignored(IgnoreReason::Malformed(e.to_string())),
        };

        let message_type = match value.get("type").and_then(Value::as_str) {
            None => return Inbound::Ignored(IgnoreReason::MissingType),
            Some(tag) => match MessageType::from_tag(tag) {
                Some(t) => t,
                None => return Inbound::Ignored(IgnoreReason::UnknownType(tag.to_string())),
            },
        };

        if !message_type.client_may_send() {
            return Inbound::Ignored(IgnoreReason::ServerOnly(message_type));
        }

        match serde_json::from_value(value) {
            Ok(envelope) => Inbound::Envelope(envelope),
            Err(e) => Inbound::Ignored(IgnoreReason::Malformed(e.to_string())),
        }
    }
}

/// Result of validating one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Envelope(Envelope),
    Ignored(IgnoreReason),
}

/// Why an inbound frame was dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum IgnoreReason {
    Malformed(String),
    MissingType,
    UnknownType(String),
    ServerOnly(MessageType),
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "malformed envelope: {e}"),
            Self::MissingType => write!(f, "envelope without type"),
            Self::UnknownType(t) => write!(f, "unknown envelope type '{t}'"),
            Self::ServerOnly(t) => write!(f, "'{t}' may only be sent by the server"),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Deserialization error: {0}")]
    Decode(#[source] serde_json::Error),
}

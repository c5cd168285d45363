//! JSON wire protocol for the room session coordinator.
//!
//! Wire format (one JSON envelope per WebSocket text frame):
//! ```text
//! client → server   {"event": "joinRoom", "seq": 3, "data": {"roomId": "…"}}
//! server → client   {"event": "userJoined", "data": {"userId": "…", "participants": […]}}
//! ack (seq echo)    {"event": "ack", "seq": 3, "data": {"success": true, …}}
//! ```
//!
//! Event names and payload field names are the compatibility contract
//! existing browser clients implement against: `createAndJoinRoom`,
//! `joinRoom`, `cursorMove`, `drawingUpdate`, `sendMessage` inbound;
//! `cursorUpdate`, `userJoined`, `drawingUpdate`, `newMessage`,
//! `notification` outbound. They must not be renamed.
//!
//! Payload schemas and their validation rules also live here: room
//! creation (name ≤ 100 chars) and chat messages (text 1..=500 chars).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;

/// Maximum length of a room display name, in characters.
pub const MAX_ROOM_NAME_LEN: usize = 100;

/// Maximum length of a chat message, in characters.
pub const MAX_MESSAGE_LEN: usize = 500;

/// Name assigned to a room created without one.
pub const DEFAULT_ROOM_NAME: &str = "Untitled Room";

/// Current time as milliseconds since the Unix epoch.
///
/// All timestamps on the wire and in the store use this representation.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Client → server
// ───────────────────────────────────────────────────────────────────

/// Envelope for an inbound client frame.
///
/// `seq` is present on events that expect an ack (`createAndJoinRoom`,
/// `joinRoom`, `sendMessage`); the server echoes it on the ack frame so
/// the client can correlate replies.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: ClientEvent,
}

impl ClientFrame {
    /// Parse a client frame from the text of a WebSocket frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DecodeError(e.to_string()))
    }
}

/// Client-emitted events, tagged by socket event name.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Live cursor position; fire-and-forget, never persisted.
    CursorMove { room_id: String, x: f64, y: f64 },
    /// Create a room and join it in one step.
    CreateAndJoinRoom(RoomDraft),
    /// Join an existing room and receive its current state.
    JoinRoom { room_id: String },
    /// Replace the room's drawing elements wholesale.
    DrawingUpdate { room_id: String, elements: Vec<Value> },
    /// Append a chat message to the room.
    SendMessage { room_id: String, text: String },
}

// ───────────────────────────────────────────────────────────────────
// Server → client
// ───────────────────────────────────────────────────────────────────

/// Envelope for an outbound server frame.
#[derive(Debug, Clone, Serialize)]
pub struct ServerFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(flatten)]
    pub event: ServerEvent,
}

impl ServerFrame {
    /// An ack frame echoing the client's `seq`.
    pub fn ack(seq: Option<u64>, ack: Ack) -> Self {
        Self {
            seq,
            event: ServerEvent::Ack(ack),
        }
    }

    /// A pushed event with no ack correlation.
    pub fn push(event: ServerEvent) -> Self {
        Self { seq: None, event }
    }

    /// Serialize to the text of a WebSocket frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::EncodeError(e.to_string()))
    }
}

/// Server-emitted events, tagged by socket event name.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    /// A peer's cursor moved (never echoed to its origin).
    CursorUpdate { user_id: String, x: f64, y: f64 },
    /// A principal joined the room.
    UserJoined {
        user_id: String,
        participants: Vec<String>,
    },
    /// The room's new element list, broadcast raw.
    DrawingUpdate(Vec<Value>),
    /// A chat message, broadcast to all members including the sender.
    NewMessage(Message),
    /// Out-of-band notification addressed to one principal
    /// (e.g. a room invite pushed by the invitation flow).
    Notification(Value),
    /// Callback reply, correlated via the envelope's `seq`.
    Ack(Ack),
    /// Terminal error sent before closing a rejected connection.
    Error { message: String },
}

/// Ack payloads. `success:false` carries the handler's error string;
/// success shapes vary per event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum Ack {
    /// `createAndJoinRoom` succeeded.
    RoomCreated {
        success: bool,
        room_id: String,
        storage_id: u64,
    },
    /// `joinRoom` succeeded; carries the room's current state.
    RoomJoined {
        success: bool,
        elements: Vec<Value>,
        participants: Vec<String>,
    },
    /// Any event failed.
    Failure { success: bool, error: String },
    /// Bare success (`sendMessage`).
    Ok { success: bool },
}

impl Ack {
    pub fn created(room_id: impl Into<String>, storage_id: u64) -> Self {
        Self::RoomCreated {
            success: true,
            room_id: room_id.into(),
            storage_id,
        }
    }

    pub fn joined(elements: Vec<Value>, participants: Vec<String>) -> Self {
        Self::RoomJoined {
            success: true,
            elements,
            participants,
        }
    }

    pub fn ok() -> Self {
        Self::Ok { success: true }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self::Failure {
            success: false,
            error: error.into(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Payload schemas
// ───────────────────────────────────────────────────────────────────

/// Client-supplied room creation payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomDraft {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_public: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<RoomData>,
}

impl RoomDraft {
    /// Validate against the room creation schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(name) = &self.name {
            let len = name.chars().count();
            if len > MAX_ROOM_NAME_LEN {
                return Err(ValidationError::RoomNameTooLong(len));
            }
        }
        Ok(())
    }

    /// The display name this draft resolves to.
    pub fn resolved_name(&self) -> &str {
        match self.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => DEFAULT_ROOM_NAME,
        }
    }
}

/// The drawing surface: an ordered list of opaque element records,
/// replaced wholesale on each update (last write wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoomData {
    #[serde(default)]
    pub elements: Vec<Value>,
}

/// A chat message, immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub user_id: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Build a message stamped with the current time.
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            timestamp: now_millis(),
        }
    }
}

/// Validate chat message text against the message schema.
pub fn validate_message_text(text: &str) -> Result<(), ValidationError> {
    let len = text.chars().count();
    if len == 0 {
        return Err(ValidationError::EmptyMessage);
    }
    if len > MAX_MESSAGE_LEN {
        return Err(ValidationError::MessageTooLong(len));
    }
    Ok(())
}

// ───────────────────────────────────────────────────────────────────
// Errors
// ───────────────────────────────────────────────────────────────────

/// Wire-level errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    /// Frame was not a well-formed event envelope.
    DecodeError(String),
    /// Outbound frame failed to serialize.
    EncodeError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DecodeError(e) => write!(f, "Decode error: {e}"),
            Self::EncodeError(e) => write!(f, "Encode error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Payload schema violations, returned synchronously to the caller
/// via its ack and never broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    RoomNameTooLong(usize),
    EmptyMessage,
    MessageTooLong(usize),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomNameTooLong(len) => {
                write!(f, "Room name must be at most {MAX_ROOM_NAME_LEN} characters (got {len})")
            }
            Self::EmptyMessage => write!(f, "Message text cannot be empty"),
            Self::MessageTooLong(len) => {
                write!(f, "Message text must be at most {MAX_MESSAGE_LEN} characters (got {len})")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

//! Event types for the Parley protocol.
//!
//! Every frame on the wire is an [`Envelope`]: a named event plus an arbitrary
//! payload. Inbound envelopes are parsed into the closed [`ClientEvent`] set,
//! collapsing legacy spellings (`typing`, `message`, `mark-read`, ...) into one
//! canonical kind. Outbound traffic is a [`ServerEvent`], serialized in the
//! same envelope shape.

use crate::ids::{ConnectionId, ConversationId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Current protocol version, announced in [`Welcome`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum length of a user or conversation identifier, in bytes.
pub const MAX_IDENTIFIER_LENGTH: usize = 256;

/// Default message type tag.
pub const DEFAULT_MESSAGE_TYPE: &str = "text";

/// A named event with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event payload (`null` when absent).
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Errors raised while turning an [`Envelope`] into a [`ClientEvent`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    /// A required field is absent or empty.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// The payload is structurally malformed.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The event name is not part of the protocol.
    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

/// Presence status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }
}

/// A chat message as relayed to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    /// Opaque client metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Payload of an inbound `send-message`. Only `conversation_id` and
/// `content` are required; the router fills in the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct SendMessage {
    pub conversation_id: ConversationId,
    pub content: String,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub timestamp: Option<u64>,
    pub recipient_id: Option<UserId>,
    pub metadata: Option<Value>,
}

/// A client-to-server event, in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Bind the connection to a user.
    Join { user_id: UserId },
    /// Subscribe to a conversation room.
    JoinConversation { conversation_id: ConversationId },
    /// Unsubscribe from a conversation room.
    LeaveConversation { conversation_id: ConversationId },
    /// Relay a chat message.
    SendMessage(SendMessage),
    /// The user started typing.
    TypingStart { conversation_id: ConversationId },
    /// The user stopped typing.
    TypingStop { conversation_id: ConversationId },
    /// Read receipt for a batch of messages.
    MarkMessagesRead {
        conversation_id: ConversationId,
        message_ids: Vec<String>,
    },
    /// Ask for a user's presence.
    CheckUserStatus { user_id: UserId },
    /// Ask for online users, globally or within one conversation.
    GetOnlineUsers {
        conversation_id: Option<ConversationId>,
    },
}

impl ClientEvent {
    /// Parse an envelope, validating its payload.
    ///
    /// # Errors
    ///
    /// Returns an [`EventError`] if the event name is unknown or the payload
    /// is missing required fields.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, EventError> {
        let Envelope { event, data } = envelope;

        let parsed = match event.as_str() {
            "join" => Self::Join {
                user_id: required_identifier(data, "userId")?,
            },
            "join-conversation" | "join-room" => Self::JoinConversation {
                conversation_id: required_identifier(data, "conversationId")?,
            },
            "leave-conversation" | "leave-room" => Self::LeaveConversation {
                conversation_id: required_identifier(data, "conversationId")?,
            },
            "send-message" | "message" => Self::SendMessage(parse_send_message(data)?),
            "typing-start" => Self::TypingStart {
                conversation_id: required_identifier(data, "conversationId")?,
            },
            "typing-stop" | "stop-typing" => Self::TypingStop {
                conversation_id: required_identifier(data, "conversationId")?,
            },
            "typing" => parse_typing_toggle(data)?,
            "mark-messages-read" | "mark-read" => parse_mark_read(data)?,
            "check-user-status" => Self::CheckUserStatus {
                user_id: required_identifier(data, "userId")?,
            },
            "get-online-users" => Self::GetOnlineUsers {
                conversation_id: optional_identifier(data, "conversationId")?,
            },
            _ => return Err(EventError::UnknownEvent(event)),
        };

        Ok(parsed)
    }

    /// Canonical event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::JoinConversation { .. } => "join-conversation",
            Self::LeaveConversation { .. } => "leave-conversation",
            Self::SendMessage(_) => "send-message",
            Self::TypingStart { .. } => "typing-start",
            Self::TypingStop { .. } => "typing-stop",
            Self::MarkMessagesRead { .. } => "mark-messages-read",
            Self::CheckUserStatus { .. } => "check-user-status",
            Self::GetOnlineUsers { .. } => "get-online-users",
        }
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn into_object(data: Value, event: &str) -> Result<Map<String, Value>, EventError> {
    match data {
        Value::Object(map) => Ok(map),
        other => Err(EventError::InvalidPayload(format!(
            "{event} expects an object, got {}",
            describe(&other)
        ))),
    }
}

/// Remove a string field. Missing and `null` both yield `None`.
fn take_str(map: &mut Map<String, Value>, key: &'static str) -> Result<Option<String>, EventError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(EventError::InvalidPayload(format!(
            "{key} must be a string, got {}",
            describe(&other)
        ))),
    }
}

/// Trim and validate an identifier. Blank identifiers yield `None`.
fn normalize_identifier(
    key: &'static str,
    raw: Option<String>,
) -> Result<Option<String>, EventError> {
    let Some(raw) = raw else {
        return Ok(None);
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.len() > MAX_IDENTIFIER_LENGTH {
        return Err(EventError::InvalidPayload(format!(
            "{key} exceeds {MAX_IDENTIFIER_LENGTH} bytes"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(EventError::InvalidPayload(format!(
            "{key} contains control characters"
        )));
    }

    Ok(Some(trimmed.to_string()))
}

/// Accept either a bare string or an object carrying `key`.
fn optional_identifier(data: Value, key: &'static str) -> Result<Option<String>, EventError> {
    let raw = match data {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Object(mut map) => take_str(&mut map, key)?,
        other => {
            return Err(EventError::InvalidPayload(format!(
                "expected a string or an object with {key}, got {}",
                describe(&other)
            )))
        }
    };
    normalize_identifier(key, raw)
}

fn required_identifier(data: Value, key: &'static str) -> Result<String, EventError> {
    optional_identifier(data, key)?.ok_or(EventError::MissingField(key))
}

fn parse_send_message(data: Value) -> Result<SendMessage, EventError> {
    let mut map = into_object(data, "send-message")?;

    let conversation_id = normalize_identifier("conversationId", take_str(&mut map, "conversationId")?)?
        .ok_or_else(|| EventError::InvalidPayload("conversationId is required".into()))?;
    let content = take_str(&mut map, "content")?
        .filter(|c| !c.is_empty())
        .ok_or_else(|| EventError::InvalidPayload("content is required".into()))?;

    let id = take_str(&mut map, "id")?.filter(|id| !id.trim().is_empty());
    let kind = take_str(&mut map, "type")?.filter(|t| !t.trim().is_empty());
    let recipient_id = normalize_identifier("recipientId", take_str(&mut map, "recipientId")?)?;

    let timestamp = match map.remove("timestamp") {
        None | Some(Value::Null) => None,
        Some(value) => Some(value.as_u64().ok_or_else(|| {
            EventError::InvalidPayload("timestamp must be Unix milliseconds".into())
        })?),
    };
    let metadata = map.remove("metadata").filter(|m| !m.is_null());

    Ok(SendMessage {
        conversation_id,
        content,
        id,
        kind,
        timestamp,
        recipient_id,
        metadata,
    })
}

fn parse_typing_toggle(data: Value) -> Result<ClientEvent, EventError> {
    let (is_typing, rest) = match data {
        Value::Object(mut map) => {
            let is_typing = match map.remove("isTyping") {
                None | Some(Value::Null) => true,
                Some(Value::Bool(b)) => b,
                Some(other) => {
                    return Err(EventError::InvalidPayload(format!(
                        "isTyping must be a boolean, got {}",
                        describe(&other)
                    )))
                }
            };
            (is_typing, Value::Object(map))
        }
        other => (true, other),
    };

    let conversation_id = required_identifier(rest, "conversationId")?;
    Ok(if is_typing {
        ClientEvent::TypingStart { conversation_id }
    } else {
        ClientEvent::TypingStop { conversation_id }
    })
}

fn parse_mark_read(data: Value) -> Result<ClientEvent, EventError> {
    let mut map = into_object(data, "mark-messages-read")?;

    let conversation_id = normalize_identifier("conversationId", take_str(&mut map, "conversationId")?)?
        .ok_or_else(|| EventError::InvalidPayload("conversationId is required".into()))?;

    let message_ids = match map.remove("messageIds") {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                Value::Number(n) => Ok(n.to_string()),
                other => Err(EventError::InvalidPayload(format!(
                    "messageIds entries must be strings, got {}",
                    describe(&other)
                ))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        None | Some(Value::Null) => {
            return Err(EventError::InvalidPayload("messageIds is required".into()))
        }
        Some(other) => {
            return Err(EventError::InvalidPayload(format!(
                "messageIds must be an array, got {}",
                describe(&other)
            )))
        }
    };

    Ok(ClientEvent::MarkMessagesRead {
        conversation_id,
        message_ids,
    })
}

/// Greeting sent as soon as a connection is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: ConnectionId,
    pub version: u8,
}

/// Confirmation of a successful `join`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Joined {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

/// List of online users, optionally scoped to one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUsers {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    pub user_ids: Vec<UserId>,
}

/// A user's presence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserStatus {
    pub user_id: UserId,
    pub status: PresenceStatus,
    /// Unix milliseconds of the user's last disconnect, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMember {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
}

/// Delivery acknowledgment for `send-message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSent {
    pub message_id: String,
    pub conversation_id: ConversationId,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub user_id: UserId,
    pub conversation_id: ConversationId,
    pub message_ids: Vec<String>,
}

/// Error reply, sent only to the originating connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReply {
    /// Stable kebab-case error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// The event that was rejected, if it could be read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
}

/// A server-to-client event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    Welcome(Welcome),
    Joined(Joined),
    OnlineUsers(OnlineUsers),
    UserStatus(UserStatus),
    UserJoinedConversation(ConversationMember),
    NewMessage(ChatMessage),
    /// Sent to the recipient's personal room when delivery policy asks
    /// for a separate notification.
    MessageNotification(ChatMessage),
    MessageSent(MessageSent),
    UserTyping(TypingIndicator),
    MessagesRead(ReadReceipt),
    Error(ErrorReply),
}

impl ServerEvent {
    /// Wire name of the event.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Welcome(_) => "welcome",
            Self::Joined(_) => "joined",
            Self::OnlineUsers(_) => "online-users",
            Self::UserStatus(_) => "user-status",
            Self::UserJoinedConversation(_) => "user-joined-conversation",
            Self::NewMessage(_) => "new-message",
            Self::MessageNotification(_) => "message-notification",
            Self::MessageSent(_) => "message-sent",
            Self::UserTyping(_) => "user-typing",
            Self::MessagesRead(_) => "messages-read",
            Self::Error(_) => "error",
        }
    }
}

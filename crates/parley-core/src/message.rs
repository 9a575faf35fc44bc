//! Chat message construction.
//!
//! Messages are never stored: the router fills in whatever the client left
//! out, relays the result and forgets it.

use parley_protocol::events::DEFAULT_MESSAGE_TYPE;
use parley_protocol::{ChatMessage, SendMessage, UserId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Atomic counter for ensuring unique IDs even within the same nanosecond.
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Current Unix time in milliseconds.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a unique message ID.
#[must_use]
pub fn generate_message_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg_{:x}{:04x}", timestamp, counter & 0xffff)
}

/// Build the relayed message from a client payload.
#[must_use]
pub fn compose(payload: SendMessage, sender_id: UserId) -> ChatMessage {
    ChatMessage {
        id: payload.id.unwrap_or_else(generate_message_id),
        conversation_id: payload.conversation_id,
        sender_id,
        content: payload.content,
        kind: payload
            .kind
            .unwrap_or_else(|| DEFAULT_MESSAGE_TYPE.to_string()),
        timestamp: payload.timestamp.unwrap_or_else(now_millis),
        recipient_id: payload.recipient_id,
        metadata: payload.metadata,
    }
}

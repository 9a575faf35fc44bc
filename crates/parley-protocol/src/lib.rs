//! # parley-protocol
//!
//! Wire protocol definitions for the Parley presence and chat relay.
//!
//! Clients and servers exchange named events. Each frame carries one
//! [`Envelope`] (`{"event": ..., "data": ...}`), either as JSON text or as
//! length-prefixed MessagePack.
//!
//! ## Event Kinds
//!
//! - `join` / `join-conversation` / `leave-conversation` - Identity and membership
//! - `send-message` / `mark-messages-read` - Chat traffic
//! - `typing-start` / `typing-stop` - Typing indicators
//! - `check-user-status` / `get-online-users` - Presence queries
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, ClientEvent};
//!
//! let envelope = codec::decode_json(r#"{"event":"join","data":"u1"}"#).unwrap();
//! let event = ClientEvent::from_envelope(envelope).unwrap();
//! assert_eq!(event, ClientEvent::Join { user_id: "u1".into() });
//! ```

pub mod codec;
pub mod events;
pub mod ids;

pub use codec::{decode_binary, decode_json, encode, Encoded, Encoding, ProtocolError};
pub use events::{
    ChatMessage, ClientEvent, ConversationMember, Envelope, ErrorReply, EventError, Joined,
    MessageSent, OnlineUsers, PresenceStatus, ReadReceipt, SendMessage, ServerEvent,
    TypingIndicator, UserStatus, Welcome, PROTOCOL_VERSION,
};
pub use ids::{ConnectionId, ConversationId, UserId};

//! # parley-core
//!
//! Connection state and event routing for the Parley relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Registry** - Bidirectional connection/user index
//! - **Rooms** - Personal and conversation rooms
//! - **Hub** - Per-connection outbound queues and fan-out
//! - **Presence** - Online/offline transitions and last-seen times
//! - **Typing** - Typing indicators with auto-clear
//! - **Router** - Connection lifecycle and event handling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│   Router    │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │
//!        │                   ▼                   ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │     Hub     │◀────│   Typing    │     │  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       │
//!        ▼                                       │
//! ┌─────────────┐                                │
//! │    Rooms    │◀───────────────────────────────┘
//! └─────────────┘
//! ```

pub mod hub;
pub mod message;
pub mod presence;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod typing;

pub use hub::{outbound_queue, Hub, Outbound, OutboundReceiver, OutboundSender};
pub use presence::PresenceTracker;
pub use registry::{Registry, RegistryError, RegistryStats};
pub use rooms::{Room, RoomStats, Rooms};
pub use router::{ConnectionState, RecipientPolicy, Router, RouterConfig, RouterError, RouterStats};
pub use typing::{TypingDebouncer, DEFAULT_TYPING_TIMEOUT};

//! # parley-transport
//!
//! Transport abstraction layer for the Parley relay.
//!
//! The server drives every connection through the `Connection`,
//! `FrameSink` and `FrameStream` traits, so the session loop does not care
//! which protocol carries the frames.
//!
//! - **WebSocket** - axum upgrade, JSON text or MessagePack binary frames
//!
//! ```rust,ignore
//! use parley_transport::{Connection, FrameStream, Inbound};
//!
//! async fn read_all(conn: impl Connection) {
//!     let (_sink, mut stream) = conn.split();
//!     while let Ok(Some(inbound)) = stream.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{Connection, FrameSink, FrameStream, Inbound, SharedEncoding, TransportError};

#[cfg(feature = "websocket")]
pub use websocket::{FrameDecoder, WebSocketConnection, DEFAULT_MAX_MESSAGE_SIZE};

//! Transport abstraction traits for Parley.
//!
//! A connection splits into a sink and a stream so the session can read and
//! write from separate tasks. The stream reports which encoding each inbound
//! frame used; the sink replies in whatever encoding was seen last.

use async_trait::async_trait;
use parley_protocol::codec::{Encoded, Encoding, ProtocolError};
use parley_protocol::{Envelope, ServerEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One inbound frame, decoded as far as the transport can take it.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A well-formed envelope and the encoding it arrived in.
    Event(Envelope, Encoding),
    /// A frame that could not be decoded. The connection stays usable.
    Malformed(String),
}

/// Encoding most recently used by the peer, shared by both halves.
#[derive(Debug, Clone, Default)]
pub struct SharedEncoding(Arc<AtomicU8>);

impl SharedEncoding {
    const JSON: u8 = 0;
    const MESSAGE_PACK: u8 = 1;

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current encoding.
    #[must_use]
    pub fn get(&self) -> Encoding {
        match self.0.load(Ordering::Relaxed) {
            Self::MESSAGE_PACK => Encoding::MessagePack,
            _ => Encoding::Json,
        }
    }

    /// Record the encoding of an inbound frame.
    pub fn set(&self, encoding: Encoding) {
        let raw = match encoding {
            Encoding::Json => Self::JSON,
            Encoding::MessagePack => Self::MESSAGE_PACK,
        };
        self.0.store(raw, Ordering::Relaxed);
    }
}

/// Writing half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send a pre-encoded frame.
    async fn send_encoded(&mut self, frame: Encoded) -> Result<(), TransportError>;

    /// Encoding the peer expects replies in.
    fn encoding(&self) -> Encoding;

    /// Encode and send an event in the peer's current encoding.
    ///
    /// Returns the encoded size in bytes.
    async fn send(&mut self, event: &ServerEvent) -> Result<usize, TransportError> {
        let frame = parley_protocol::encode(event, self.encoding())?;
        let size = frame.len();
        self.send_encoded(frame).await?;
        Ok(size)
    }

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Reading half of a connection.
#[async_trait]
pub trait FrameStream: Send {
    /// Receive the next frame.
    ///
    /// Returns `None` if the connection is closed cleanly.
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError>;
}

/// An accepted connection over a transport.
pub trait Connection: Send {
    type Sink: FrameSink + 'static;
    type Stream: FrameStream + 'static;

    /// Transport name (e.g. "websocket").
    fn transport(&self) -> &'static str;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Split into independently owned halves.
    fn split(self) -> (Self::Sink, Self::Stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_encoding_is_shared() {
        let reader = SharedEncoding::new();
        let writer = reader.clone();
        assert_eq!(writer.get(), Encoding::Json);

        reader.set(Encoding::MessagePack);
        assert_eq!(writer.get(), Encoding::MessagePack);

        reader.set(Encoding::Json);
        assert_eq!(writer.get(), Encoding::Json);
    }
}

//! WebSocket transport implementation.
//!
//! Adapts an upgraded axum [`WebSocket`] to the [`Connection`] traits. Text
//! frames carry one JSON envelope each; binary frames carry length-prefixed
//! MessagePack envelopes, possibly several per frame.

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parley_protocol::codec::{self, Encoded, Encoding, ProtocolError, LENGTH_PREFIX_SIZE};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

use crate::traits::{Connection, FrameSink, FrameStream, Inbound, SharedEncoding, TransportError};

/// Default maximum inbound message size.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Turns inbound WebSocket payloads into [`Inbound`] frames.
#[derive(Debug)]
pub struct FrameDecoder {
    read_buffer: BytesMut,
    max_message_size: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_message_size: usize) -> Self {
        Self {
            read_buffer: BytesMut::with_capacity(4096),
            max_message_size,
        }
    }

    /// Decode a text payload.
    pub fn text(&self, text: &str) -> Inbound {
        if text.len() > self.max_message_size {
            return self.too_large(text.len());
        }
        match codec::decode_json(text) {
            Ok(envelope) => Inbound::Event(envelope, Encoding::Json),
            Err(e) => Inbound::Malformed(e.to_string()),
        }
    }

    /// Append a binary payload and decode the first frame it completes.
    ///
    /// Frames may span several payloads; each is held to `max_message_size`
    /// by its declared length, not by the size of the payloads carrying it.
    ///
    /// Returns `None` if more data is needed.
    pub fn binary(&mut self, data: &[u8]) -> Option<Inbound> {
        if data.len() > self.max_message_size {
            return Some(self.too_large(data.len()));
        }
        self.read_buffer.extend_from_slice(data);
        self.next_buffered()
    }

    /// Decode the next complete frame already buffered.
    pub fn next_buffered(&mut self) -> Option<Inbound> {
        if let Some(prefix) = self.read_buffer.get(..LENGTH_PREFIX_SIZE) {
            let declared =
                u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
            if declared > self.max_message_size {
                self.read_buffer.clear();
                return Some(self.too_large(declared));
            }
        }

        match codec::decode_from(&mut self.read_buffer) {
            Ok(Some(envelope)) => Some(Inbound::Event(envelope, Encoding::MessagePack)),
            Ok(None) => None,
            Err(e @ ProtocolError::FrameTooLarge(_)) => {
                // The prefix is garbage, nothing after it can be trusted
                self.read_buffer.clear();
                Some(Inbound::Malformed(e.to_string()))
            }
            Err(e) => Some(Inbound::Malformed(e.to_string())),
        }
    }

    fn too_large(&self, size: usize) -> Inbound {
        warn!(
            "Message too large: {} bytes (max: {})",
            size, self.max_message_size
        );
        Inbound::Malformed(format!(
            "Message size {} exceeds maximum {}",
            size, self.max_message_size
        ))
    }
}

/// A WebSocket connection.
pub struct WebSocketConnection {
    socket: WebSocket,
    remote_addr: Option<SocketAddr>,
    max_message_size: usize,
}

impl WebSocketConnection {
    /// Wrap an upgraded socket.
    #[must_use]
    pub fn new(socket: WebSocket, max_message_size: usize) -> Self {
        Self {
            socket,
            remote_addr: None,
            max_message_size,
        }
    }

    /// Attach the peer address.
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

impl Connection for WebSocketConnection {
    type Sink = WebSocketSink;
    type Stream = WebSocketStream;

    fn transport(&self) -> &'static str {
        "websocket"
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    fn split(self) -> (WebSocketSink, WebSocketStream) {
        let (sender, receiver) = self.socket.split();
        let encoding = SharedEncoding::new();

        (
            WebSocketSink {
                sender,
                encoding: encoding.clone(),
                is_open: true,
            },
            WebSocketStream {
                receiver,
                encoding,
                decoder: FrameDecoder::new(self.max_message_size),
            },
        )
    }
}

/// Writing half of a [`WebSocketConnection`].
pub struct WebSocketSink {
    sender: SplitSink<WebSocket, Message>,
    encoding: SharedEncoding,
    is_open: bool,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_encoded(&mut self, frame: Encoded) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match frame {
            Encoded::Text(text) => Message::Text(text),
            Encoded::Binary(data) => Message::Binary(data.to_vec()),
        };
        self.sender
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn encoding(&self) -> Encoding {
        self.encoding.get()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(());
        }

        // The peer may already be gone; a failed close is not an error
        if let Err(e) = self.sender.send(Message::Close(None)).await {
            trace!("Close frame not sent: {}", e);
        }
        self.sender
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

/// Reading half of a [`WebSocketConnection`].
pub struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    encoding: SharedEncoding,
    decoder: FrameDecoder,
}

impl WebSocketStream {
    fn observe(&self, inbound: Inbound) -> Inbound {
        if let Inbound::Event(_, encoding) = &inbound {
            self.encoding.set(*encoding);
        }
        inbound
    }
}

#[async_trait]
impl FrameStream for WebSocketStream {
    async fn recv(&mut self) -> Result<Option<Inbound>, TransportError> {
        // First, try to decode from the existing buffer
        if let Some(inbound) = self.decoder.next_buffered() {
            return Ok(Some(self.observe(inbound)));
        }

        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    let inbound = self.decoder.text(&text);
                    return Ok(Some(self.observe(inbound)));
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Some(inbound) = self.decoder.binary(&data) {
                        return Ok(Some(self.observe(inbound)));
                    }
                    // Need more data, continue reading
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                    // Pongs are queued by the socket itself
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_protocol::Envelope;
    use serde_json::json;

    #[test]
    fn test_text_frames() {
        let decoder = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);

        let inbound = decoder.text(r#"{"event":"join","data":"u1"}"#);
        assert_eq!(
            inbound,
            Inbound::Event(Envelope::new("join", json!("u1")), Encoding::Json)
        );

        assert!(matches!(decoder.text("not json"), Inbound::Malformed(_)));
    }

    #[test]
    fn test_binary_frames_split_and_batched() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);
        let first = Envelope::new("join", json!("u1"));
        let second = Envelope::new("join-conversation", json!("c1"));

        let mut buf = BytesMut::new();
        codec::encode_into(&first, &mut buf).unwrap();
        codec::encode_into(&second, &mut buf).unwrap();

        // Half of the first frame is not enough
        let (head, tail) = buf.split_at(3);
        assert_eq!(decoder.binary(head), None);

        assert_eq!(
            decoder.binary(tail),
            Some(Inbound::Event(first, Encoding::MessagePack))
        );
        assert_eq!(
            decoder.next_buffered(),
            Some(Inbound::Event(second, Encoding::MessagePack))
        );
        assert_eq!(decoder.next_buffered(), None);
    }

    #[test]
    fn test_oversized_messages_are_malformed() {
        let mut decoder = FrameDecoder::new(16);

        let text = format!(r#"{{"event":"join","data":"{}"}}"#, "x".repeat(32));
        assert!(matches!(decoder.text(&text), Inbound::Malformed(_)));
        assert!(matches!(decoder.binary(&[0u8; 32]), Some(Inbound::Malformed(_))));
    }

    #[test]
    fn test_split_frame_over_limit_is_malformed() {
        let envelope = Envelope::new("send-message", json!({"content": "x".repeat(200)}));
        let mut buf = BytesMut::new();
        codec::encode_into(&envelope, &mut buf).unwrap();

        // Every chunk is under the limit, the frame is not
        let mut decoder = FrameDecoder::new(64);
        let mut chunks = buf.chunks(16);
        let first = chunks.next().unwrap();
        assert!(matches!(decoder.binary(first), Some(Inbound::Malformed(_))));
        for chunk in chunks {
            assert!(!matches!(decoder.binary(chunk), Some(Inbound::Event(..))));
        }

        // The same frame split the same way passes when it fits
        let mut decoder = FrameDecoder::new(buf.len() - LENGTH_PREFIX_SIZE);
        let mut decoded = None;
        for chunk in buf.chunks(16) {
            if let Some(inbound) = decoder.binary(chunk) {
                decoded = Some(inbound);
            }
        }
        assert_eq!(decoded, Some(Inbound::Event(envelope, Encoding::MessagePack)));
    }

    #[test]
    fn test_bad_length_prefix_resets_buffer() {
        let mut decoder = FrameDecoder::new(DEFAULT_MAX_MESSAGE_SIZE);

        let inbound = decoder.binary(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3]);
        assert!(matches!(inbound, Some(Inbound::Malformed(_))));
        assert_eq!(decoder.next_buffered(), None);
    }
}

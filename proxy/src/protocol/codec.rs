//! Framing for the PostgreSQL wire protocol
//!
//! The codecs only split the byte stream into complete frames; they never
//! reinterpret a frame's contents. A [`RawMessage`] keeps the exact bytes that
//! arrived so that relayed messages leave the gateway unchanged.

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{GatewayError, Result};

/// Protocol version 3.0
pub const PROTOCOL_VERSION_3: i32 = 196608;

/// Startup code of an SSLRequest
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Startup code of a GSSENCRequest
pub const GSSENC_REQUEST_CODE: i32 = 80877104;

/// Startup code of a CancelRequest
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

/// Largest startup packet a server accepts
pub const MAX_STARTUP_PACKET_LENGTH: usize = 10_000;

/// Largest regular message accepted (PostgreSQL's 1 GB limit)
pub const MAX_MESSAGE_LENGTH: usize = 1 << 30;

/// Largest client message accepted before authentication completes
pub const MAX_AUTH_MESSAGE_LENGTH: usize = 65_535;

// Buffer growth per partial frame; large frames grow as their bytes arrive
const RESERVE_CHUNK: usize = 64 * 1024;

/// One complete protocol frame
///
/// Startup-phase packets have no type byte; every other message does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    tag: Option<u8>,
    frame: Bytes,
}

impl RawMessage {
    /// Build a typed message from its body
    pub fn new(tag: u8, body: &[u8]) -> Self {
        let mut frame = BytesMut::with_capacity(5 + body.len());
        frame.put_u8(tag);
        frame.put_i32((4 + body.len()) as i32);
        frame.put_slice(body);
        Self {
            tag: Some(tag),
            frame: frame.freeze(),
        }
    }

    /// Build an untyped startup-phase packet from its body (code and parameters)
    pub fn untagged(body: &[u8]) -> Self {
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.put_i32((4 + body.len()) as i32);
        frame.put_slice(body);
        Self {
            tag: None,
            frame: frame.freeze(),
        }
    }

    /// Message type byte, `None` for startup-phase packets
    pub fn tag(&self) -> Option<u8> {
        self.tag
    }

    /// Payload after the type byte and length
    pub fn body(&self) -> &[u8] {
        match self.tag {
            Some(_) => &self.frame[5..],
            None => &self.frame[4..],
        }
    }

    /// The complete frame as received or built
    pub fn as_bytes(&self) -> &[u8] {
        &self.frame
    }

    /// Frame length in bytes
    pub fn len(&self) -> usize {
        self.frame.len()
    }

    /// Whether the frame is empty (never true for a decoded frame)
    pub fn is_empty(&self) -> bool {
        self.frame.is_empty()
    }
}

/// Decodes client-to-server frames
///
/// Starts in the startup phase and leaves it after the first startup packet
/// that is not an SSLRequest or GSSENCRequest. Until [`relaying`] is called,
/// messages longer than [`MAX_AUTH_MESSAGE_LENGTH`] are rejected.
///
/// [`relaying`]: FrontendCodec::relaying
#[derive(Debug, Clone)]
pub struct FrontendCodec {
    startup_phase: bool,
    max_message_length: usize,
}

impl FrontendCodec {
    /// Create a codec expecting a startup packet
    pub fn new() -> Self {
        Self {
            startup_phase: true,
            max_message_length: MAX_AUTH_MESSAGE_LENGTH,
        }
    }

    /// Create a codec for a connection whose startup packet was already read
    pub fn after_startup() -> Self {
        Self {
            startup_phase: false,
            max_message_length: MAX_AUTH_MESSAGE_LENGTH,
        }
    }

    /// Accept messages up to [`MAX_MESSAGE_LENGTH`] once the client is authenticated
    pub fn relaying(&mut self) {
        self.max_message_length = MAX_MESSAGE_LENGTH;
    }

    /// Whether the next frame is expected to be a startup-phase packet
    pub fn in_startup_phase(&self) -> bool {
        self.startup_phase
    }
}

impl Default for FrontendCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrontendCodec {
    type Item = RawMessage;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if !self.startup_phase {
            return decode_tagged(src, self.max_message_length);
        }

        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length (don't consume yet)
        let len = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if len < 8 || len as usize > MAX_STARTUP_PACKET_LENGTH {
            return Err(GatewayError::Protocol(format!("invalid startup packet length {}", len)));
        }
        let len = len as usize;

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len).freeze();
        let code = i32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if code != SSL_REQUEST_CODE && code != GSSENC_REQUEST_CODE {
            self.startup_phase = false;
        }

        Ok(Some(RawMessage { tag: None, frame }))
    }
}

impl Encoder<RawMessage> for FrontendCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

/// Decodes server-to-client frames
#[derive(Debug, Clone, Default)]
pub struct BackendCodec;

impl BackendCodec {
    /// Create a backend codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for BackendCodec {
    type Item = RawMessage;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        decode_tagged(src, MAX_MESSAGE_LENGTH)
    }
}

impl Encoder<RawMessage> for BackendCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(item.as_bytes());
        Ok(())
    }
}

fn decode_tagged(src: &mut BytesMut, max_length: usize) -> Result<Option<RawMessage>> {
    // Need at least 5 bytes (type + length)
    if src.len() < 5 {
        return Ok(None);
    }

    let tag = src[0];
    let len = i32::from_be_bytes([src[1], src[2], src[3], src[4]]);
    if len < 4 || len as usize > max_length {
        return Err(GatewayError::Protocol(format!(
            "invalid length {} for message type '{}'",
            len,
            tag.escape_ascii()
        )));
    }

    // Total message size = 1 (type byte) + length
    let len = 1 + len as usize;
    if src.len() < len {
        src.reserve((len - src.len()).min(RESERVE_CHUNK));
        return Ok(None);
    }

    Ok(Some(RawMessage {
        tag: Some(tag),
        frame: src.split_to(len).freeze(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn startup_packet(code: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_i32((8 + body.len()) as i32);
        buf.put_i32(code);
        buf.extend_from_slice(body);
        buf
    }

    #[test]
    fn test_startup_then_regular_frames() {
        let mut codec = FrontendCodec::new();
        let mut src = BytesMut::from(&startup_packet(PROTOCOL_VERSION_3, b"user\0bob\0\0")[..]);
        src.extend_from_slice(&RawMessage::new(b'Q', b"select 1\0").as_bytes()[..]);

        let startup = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(startup.tag(), None);
        assert_eq!(&startup.body()[4..], b"user\0bob\0\0");
        assert!(!codec.in_startup_phase());

        let query = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(query.tag(), Some(b'Q'));
        assert_eq!(query.body(), b"select 1\0");
        assert!(src.is_empty());
    }

    #[test]
    fn test_ssl_request_keeps_startup_phase() {
        let mut codec = FrontendCodec::new();
        let mut src = BytesMut::from(&startup_packet(SSL_REQUEST_CODE, b"")[..]);

        let request = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(request.len(), 8);
        assert!(codec.in_startup_phase());

        src.extend_from_slice(&startup_packet(GSSENC_REQUEST_CODE, b""));
        codec.decode(&mut src).unwrap().unwrap();
        assert!(codec.in_startup_phase());
    }

    #[test]
    fn test_partial_frames_wait_for_more_data() {
        let mut codec = BackendCodec::new();
        let frame = RawMessage::new(b'Z', b"I");
        let bytes = frame.as_bytes();

        let mut src = BytesMut::from(&bytes[..3]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&bytes[3..5]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&bytes[5..]);
        assert_eq!(codec.decode(&mut src).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_invalid_lengths_rejected() {
        let mut codec = FrontendCodec::new();
        let mut src = BytesMut::from(&[0u8, 0, 0, 4, 0, 0, 0, 0][..]);
        assert!(matches!(codec.decode(&mut src), Err(GatewayError::Protocol(_))));

        let mut codec = FrontendCodec::new();
        let mut src = BytesMut::new();
        src.put_i32((MAX_STARTUP_PACKET_LENGTH + 1) as i32);
        src.put_i32(PROTOCOL_VERSION_3);
        assert!(matches!(codec.decode(&mut src), Err(GatewayError::Protocol(_))));

        let mut codec = BackendCodec::new();
        let mut src = BytesMut::from(&[b'Z', 0, 0, 0, 3][..]);
        assert!(matches!(codec.decode(&mut src), Err(GatewayError::Protocol(_))));
    }

    fn oversized_header(tag: u8) -> BytesMut {
        let mut src = BytesMut::new();
        src.put_u8(tag);
        src.put_i32(MAX_MESSAGE_LENGTH as i32);
        src
    }

    #[test]
    fn test_large_message_rejected_before_authentication() {
        let mut codec = FrontendCodec::after_startup();
        let mut src = oversized_header(b'p');
        assert!(matches!(codec.decode(&mut src), Err(GatewayError::Protocol(_))));

        // Largest allowed password message is still only a partial frame here
        let mut src = BytesMut::new();
        src.put_u8(b'p');
        src.put_i32(MAX_AUTH_MESSAGE_LENGTH as i32);
        assert!(codec.decode(&mut src).unwrap().is_none());
    }

    #[test]
    fn test_large_header_does_not_reserve_claimed_length() {
        let mut codec = FrontendCodec::after_startup();
        codec.relaying();
        let mut src = oversized_header(b'Q');
        assert!(codec.decode(&mut src).unwrap().is_none());
        assert!(src.capacity() < 1024 * 1024);

        let mut src = oversized_header(b'D');
        assert!(BackendCodec::new().decode(&mut src).unwrap().is_none());
        assert!(src.capacity() < 1024 * 1024);
    }

    #[test]
    fn test_encode_is_verbatim() {
        let frame = RawMessage::new(b'D', b"\x00\x01\x00\x00\x00\x01x");
        let mut dst = BytesMut::new();
        BackendCodec::new().encode(frame.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], frame.as_bytes());
    }
}

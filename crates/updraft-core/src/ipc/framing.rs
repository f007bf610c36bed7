//! Length-prefixed frame codec for the installer sockets.
//!
//! Each frame is a 4-byte big-endian length prefix followed by the frame
//! body: a 4-byte little-endian message identifier and the payload. The
//! codec decodes straight to [`Message`] so link tasks never handle raw
//! frame bytes.
//!
//! The declared length is validated against [`MAX_FRAME_SIZE`] before any
//! allocation occurs, so a hostile peer cannot force memory exhaustion with
//! a large prefix.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::{ProtocolError, ProtocolResult, MAX_FRAME_SIZE};
use super::messages::Message;

/// Length of the frame header (u32 length prefix).
const HEADER_LEN: usize = 4;

/// Length of the message identifier inside the frame body.
const IDENT_LEN: usize = 4;

/// Frame codec for [`Message`] values, used with [`tokio_util::codec::Framed`].
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_size: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    /// Create a codec with the default maximum frame size.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a reduced maximum frame size.
    ///
    /// # Panics
    ///
    /// Panics if `max_size` exceeds [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn with_max_size(max_size: usize) -> Self {
        assert!(
            max_size <= MAX_FRAME_SIZE,
            "max_size {max_size} exceeds protocol limit {MAX_FRAME_SIZE}"
        );
        Self {
            max_frame_size: max_size,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> ProtocolResult<Option<Message>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek the length prefix without consuming it.
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        // Validate before allocating.
        if length > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }
        if length < IDENT_LEN {
            // A frame must at least carry a message identifier. Wait for
            // the full (short) frame so the error consumes it.
            if src.len() < HEADER_LEN + length {
                return Ok(None);
            }
            return Err(ProtocolError::TruncatedFrame { size: length });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let mut body = src.split_to(length);
        let id = body.get_i32_le();
        let payload = body.freeze();

        Ok(Some(Message { id, payload }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> ProtocolResult<()> {
        let body_len = IDENT_LEN + item.payload.len();
        if body_len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + body_len);
        #[allow(clippy::cast_possible_truncation)] // validated against max_frame_size
        dst.put_u32(body_len as u32);
        dst.put_i32_le(item.id);
        dst.extend_from_slice(&item.payload);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let mut codec = MessageCodec::new();
        let message = Message::new(7, Bytes::from_static(b"hello"));

        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();

        // 4-byte BE length covers identifier + payload.
        assert_eq!(&buf[..4], &[0, 0, 0, 9]);
        // Identifier is little-endian.
        assert_eq!(&buf[4..8], &[7, 0, 0, 0]);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_header_waits() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn decode_partial_body_waits() {
        let mut codec = MessageCodec::new();
        // Declares 10 body bytes, provides 5.
        let mut buf = BytesMut::from(&[0u8, 0, 0, 10, 1, 0, 0, 0, 9][..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 9);
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(8 * 1024 * 1024);
        buf.extend_from_slice(&[0u8; 64]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn decode_rejects_frame_shorter_than_identifier() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0, 0, 2, 1, 2][..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::TruncatedFrame { size: 2 })
        ));
    }

    #[test]
    fn decode_empty_payload() {
        let mut codec = MessageCodec::new();
        let message = Message::new(-3, Bytes::new());

        let mut buf = BytesMut::new();
        codec.encode(message.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + IDENT_LEN);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn decode_consecutive_frames() {
        let mut codec = MessageCodec::new();
        let first = Message::new(1, Bytes::from_static(b"a"));
        let second = Message::new(2, Bytes::from_static(b"bb"));

        let mut buf = BytesMut::new();
        codec.encode(first.clone(), &mut buf).unwrap();
        codec.encode(second.clone(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), first);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), second);
        assert!(buf.is_empty());
    }
}

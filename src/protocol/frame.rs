//! Binary frame protocol with length-prefixed payloads
//!
//! Frame format:
//! ```text
//! +---------+---------------+-------------+
//! | kind    | length        | payload     |
//! | (1 byte)| (4 bytes, BE) | (variable)  |
//! +---------+---------------+-------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};

/// Frame header size: 1 byte kind + 4 bytes length
pub const FRAME_HEADER_SIZE: usize = 5;

/// Default maximum frame payload size (1 MB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame kinds carried on the control stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Auth,
    AuthOk,
    AuthFailed,
    Goodbye,
    Message,
    /// A kind this build does not understand; the payload is still consumed
    Unknown(u8),
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x01 => FrameKind::Auth,
            0x02 => FrameKind::AuthOk,
            0x03 => FrameKind::AuthFailed,
            0x04 => FrameKind::Goodbye,
            0x10 => FrameKind::Message,
            other => FrameKind::Unknown(other),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameKind::Auth => 0x01,
            FrameKind::AuthOk => 0x02,
            FrameKind::AuthFailed => 0x03,
            FrameKind::Goodbye => 0x04,
            FrameKind::Message => 0x10,
            FrameKind::Unknown(other) => *other,
        }
    }

    /// Handshake and teardown frames
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            FrameKind::Auth | FrameKind::AuthOk | FrameKind::AuthFailed | FrameKind::Goodbye
        )
    }
}

/// A single protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame with the given kind and payload
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode this frame into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_size());
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// Encode this frame into a new Bytes
    pub fn encode_to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Try to decode a frame from a buffer.
    /// Returns Ok(Some(frame)) if successful, Ok(None) if more data needed.
    /// An oversized length is unrecoverable: the stream has lost framing.
    pub fn decode(buf: &mut BytesMut, max_size: usize) -> io::Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming
        let mut cursor = Cursor::new(&buf[..]);
        let kind = FrameKind::from_u8(cursor.get_u8());
        let payload_len = cursor.get_u32() as usize;

        if payload_len > max_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Frame payload too large: {} bytes (max: {})",
                    payload_len, max_size
                ),
            ));
        }

        let total_size = FRAME_HEADER_SIZE + payload_len;
        if buf.len() < total_size {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Frame { kind, payload }))
    }
}

/// Frame decoder for streaming use
#[derive(Debug)]
pub struct FrameCodec {
    buffer: BytesMut,
    max_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl FrameCodec {
    /// Create a new frame codec accepting payloads up to `max_size`
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_size,
        }
    }

    /// Feed data into the codec
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame
    pub fn decode_next(&mut self) -> io::Result<Option<Frame>> {
        Frame::decode(&mut self.buffer, self.max_size)
    }

    /// Get the current buffer length
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_roundtrip() {
        for kind in [
            FrameKind::Auth,
            FrameKind::AuthOk,
            FrameKind::AuthFailed,
            FrameKind::Goodbye,
            FrameKind::Message,
        ] {
            assert_eq!(FrameKind::from_u8(kind.as_u8()), kind);
        }
        assert_eq!(FrameKind::from_u8(0x7E), FrameKind::Unknown(0x7E));
    }

    #[test]
    fn test_frame_codec_streaming() {
        let mut codec = FrameCodec::default();

        let frame1 = Frame::new(FrameKind::Message, vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let frame2 = Frame::new(FrameKind::Goodbye, vec![11, 12, 13]);

        let mut data = BytesMut::new();
        frame1.encode(&mut data);
        frame2.encode(&mut data);

        // Header incomplete
        codec.feed(&data[..3]);
        assert!(codec.decode_next().unwrap().is_none());

        codec.feed(&data[3..]);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame1);
        assert_eq!(codec.decode_next().unwrap().unwrap(), frame2);
        assert!(codec.decode_next().unwrap().is_none());
        assert_eq!(codec.buffered_len(), 0);
    }

    #[test]
    fn test_unknown_kind_is_consumed() {
        let mut codec = FrameCodec::default();
        let mut data = BytesMut::new();
        Frame::new(FrameKind::Unknown(0x7E), "junk").encode(&mut data);
        Frame::new(FrameKind::Message, "{}").encode(&mut data);
        codec.feed(&data);

        let first = codec.decode_next().unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Unknown(0x7E));
        let second = codec.decode_next().unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Message);
    }

    #[test]
    fn test_frame_too_large() {
        let mut data = BytesMut::new();
        data.put_u8(FrameKind::Message.as_u8());
        data.put_u32(65);

        let mut codec = FrameCodec::new(64);
        codec.feed(&data);
        assert!(codec.decode_next().is_err());
    }
}

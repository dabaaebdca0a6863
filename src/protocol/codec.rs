//! Codec for encoding/decoding protocol payloads to/from frames
//!
//! This module provides the bridge between typed payloads and binary frames.

use super::frame::{Frame, FrameKind};
use super::handshake::{Auth, AuthFailed, AuthOk, Goodbye};
use super::message::Message;
use bytes::Bytes;
use std::io::{self, Error as IoError, ErrorKind};

/// Trait for payloads that can be encoded to frames
pub trait Encodable {
    /// Get the frame kind for this payload
    fn frame_kind(&self) -> FrameKind;

    /// Encode the payload to bytes
    fn encode_payload(&self) -> io::Result<Bytes>;

    /// Encode the complete frame
    fn encode_frame(&self) -> io::Result<Frame> {
        Ok(Frame::new(self.frame_kind(), self.encode_payload()?))
    }
}

/// Trait for payloads that can be decoded from frames
pub trait Decodable: Sized {
    /// Expected frame kind for this payload
    fn expected_frame_kind() -> FrameKind;

    /// Decode the payload
    fn decode_payload(payload: &[u8]) -> io::Result<Self>;

    /// Decode from a complete frame, validating the frame kind
    fn decode_frame(frame: &Frame) -> io::Result<Self> {
        if frame.kind != Self::expected_frame_kind() {
            return Err(IoError::new(
                ErrorKind::InvalidData,
                format!(
                    "Expected frame kind {:?}, got {:?}",
                    Self::expected_frame_kind(),
                    frame.kind
                ),
            ));
        }
        Self::decode_payload(&frame.payload)
    }
}

macro_rules! impl_codec {
    ($type:ty, $kind:expr) => {
        impl Encodable for $type {
            fn frame_kind(&self) -> FrameKind {
                $kind
            }

            fn encode_payload(&self) -> io::Result<Bytes> {
                serde_json::to_vec(self)
                    .map(Bytes::from)
                    .map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }

        impl Decodable for $type {
            fn expected_frame_kind() -> FrameKind {
                $kind
            }

            fn decode_payload(payload: &[u8]) -> io::Result<Self> {
                serde_json::from_slice(payload).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
            }
        }
    };
}

impl_codec!(Auth, FrameKind::Auth);
impl_codec!(AuthOk, FrameKind::AuthOk);
impl_codec!(AuthFailed, FrameKind::AuthFailed);
impl_codec!(Goodbye, FrameKind::Goodbye);
impl_codec!(Message, FrameKind::Message);

/// Any frame decoded into its typed payload
#[derive(Debug, Clone)]
pub enum DecodedFrame {
    Auth(Auth),
    AuthOk(AuthOk),
    AuthFailed(AuthFailed),
    Goodbye(Goodbye),
    Message(Message),
}

impl DecodedFrame {
    /// Decode a frame into a typed payload. Unknown kinds and malformed
    /// payloads fail without affecting the stream's framing.
    pub fn decode(frame: &Frame) -> io::Result<Self> {
        let payload = &frame.payload;

        match frame.kind {
            FrameKind::Auth => Ok(Self::Auth(Auth::decode_payload(payload)?)),
            FrameKind::AuthOk => Ok(Self::AuthOk(AuthOk::decode_payload(payload)?)),
            FrameKind::AuthFailed => Ok(Self::AuthFailed(AuthFailed::decode_payload(payload)?)),
            FrameKind::Goodbye => Ok(Self::Goodbye(Goodbye::decode_payload(payload)?)),
            FrameKind::Message => Ok(Self::Message(Message::decode_payload(payload)?)),
            FrameKind::Unknown(kind) => Err(IoError::new(
                ErrorKind::Unsupported,
                format!("Unknown frame kind: 0x{:02X}", kind),
            )),
        }
    }

    pub fn frame_kind(&self) -> FrameKind {
        match self {
            Self::Auth(_) => FrameKind::Auth,
            Self::AuthOk(_) => FrameKind::AuthOk,
            Self::AuthFailed(_) => FrameKind::AuthFailed,
            Self::Goodbye(_) => FrameKind::Goodbye,
            Self::Message(_) => FrameKind::Message,
        }
    }
}

/// Encode a payload directly to bytes (convenience function)
pub fn encode<T: Encodable>(msg: &T) -> io::Result<Bytes> {
    msg.encode_frame().map(|f| f.encode_to_bytes())
}

/// Decode a frame to a specific payload type (convenience function)
pub fn decode<T: Decodable>(frame: &Frame) -> io::Result<T> {
    T::decode_frame(frame)
}

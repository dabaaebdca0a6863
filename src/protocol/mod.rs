//! Protocol layer
//!
//! This module provides:
//! - Length-prefixed frame encoding/decoding
//! - The JSON message envelope and its typed payloads
//! - Handshake payloads and codec traits

pub mod codec;
pub mod frame;
pub mod handshake;
pub mod message;

pub use codec::{Decodable, DecodedFrame, Encodable, decode, encode};
pub use frame::{FRAME_HEADER_SIZE, Frame, FrameCodec, FrameKind, MAX_FRAME_SIZE};
pub use handshake::{Auth, AuthFailed, AuthOk, Goodbye, SERVICE_AUTH_METHOD, TOKEN_AUTH_METHOD};
pub use message::{
    Chat, ChatBody, ChatType, FrameType, MarkRead, Message, Method, Payload, Presence, Push,
    UserId,
};

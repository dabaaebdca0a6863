//! Wire message envelope exchanged between clients, servers and peers
//!
//! The JSON layout is `{frameType, id, transpondUid, ackSeq, method, formId, data}`.
//! `data` is interpreted by `method`; the send-time bookkeeping used by the
//! Ack/Retry engine lives on the struct but never reaches the wire.

use std::fmt;
use std::time::Instant;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::generate_message_id;

/// User identity as issued by the authenticator
pub type UserId = String;

/// Frame type of a message, serialized as its numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrameType {
    #[default]
    Data,
    Ping,
    Ack,
    NoAck,
    Transpond,
    Err,
}

impl FrameType {
    pub fn code(self) -> u8 {
        match self {
            FrameType::Data => 0x0,
            FrameType::Ping => 0x1,
            FrameType::Ack => 0x2,
            FrameType::NoAck => 0x3,
            FrameType::Transpond => 0x6,
            FrameType::Err => 0x9,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(FrameType::Data),
            0x1 => Some(FrameType::Ping),
            0x2 => Some(FrameType::Ack),
            0x3 => Some(FrameType::NoAck),
            0x6 => Some(FrameType::Transpond),
            0x9 => Some(FrameType::Err),
            _ => None,
        }
    }
}

impl Serialize for FrameType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for FrameType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        FrameType::from_code(code)
            .ok_or_else(|| de::Error::custom(format!("unknown frameType {}", code)))
    }
}

/// Application route named by a message
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
    /// No route (acks, pings, errors)
    Unspecified,
    UserOnline,
    ConversationChat,
    ConversationMarkChat,
    Push,
    Other(String),
}

impl Method {
    pub fn parse(method: &str) -> Self {
        match method {
            "" => Method::Unspecified,
            "user.online" => Method::UserOnline,
            "conversation.chat" => Method::ConversationChat,
            "conversation.markChat" => Method::ConversationMarkChat,
            "push" => Method::Push,
            other => Method::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Method::Unspecified => "",
            Method::UserOnline => "user.online",
            Method::ConversationChat => "conversation.chat",
            Method::ConversationMarkChat => "conversation.markChat",
            Method::Push => "push",
            Method::Other(other) => other,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conversation kind, serialized as its numeric code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatType {
    Group,
    #[default]
    Single,
}

impl Serialize for ChatType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(match self {
            ChatType::Group => 1,
            ChatType::Single => 2,
        })
    }
}

impl<'de> Deserialize<'de> for ChatType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(ChatType::Group),
            2 => Ok(ChatType::Single),
            other => Err(de::Error::custom(format!("unknown chatType {}", other))),
        }
    }
}

/// `user.online` payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    #[serde(default)]
    pub users: Vec<UserId>,
}

/// Chat message body
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBody {
    #[serde(default)]
    pub m_type: i32,
    #[serde(default)]
    pub content: String,
}

/// `conversation.chat` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    #[serde(default)]
    pub conversation_id: String,
    pub chat_type: ChatType,
    #[serde(default)]
    pub send_id: UserId,
    #[serde(default)]
    pub recv_id: UserId,
    #[serde(default)]
    pub msg: ChatBody,
    #[serde(default)]
    pub send_time: i64,
}

/// `conversation.markChat` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRead {
    #[serde(default)]
    pub conversation_id: String,
    pub chat_type: ChatType,
    #[serde(default)]
    pub send_id: UserId,
    #[serde(default)]
    pub recv_id: UserId,
    #[serde(default)]
    pub msg_ids: Vec<String>,
}

/// `push` payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Push {
    pub conversation_id: String,
    pub chat_type: ChatType,
    pub send_id: UserId,
    pub recv_id: UserId,
    pub recv_ids: Vec<UserId>,
    pub send_time: i64,
    pub msg_id: String,
    pub m_type: i32,
    pub content: String,
}

/// Typed `data` field
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Empty,
    Presence(Presence),
    Chat(Chat),
    MarkRead(MarkRead),
    Push(Push),
    /// Reason carried by an Err frame
    Error(String),
    /// Inner message of a Transpond frame
    Relay(Box<Message>),
    /// Data of a method this server has no schema for
    Opaque(serde_json::Value),
}

impl Payload {
    fn decode(
        frame_type: FrameType,
        method: &Method,
        data: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        if frame_type == FrameType::Transpond {
            let inner: Message = serde_json::from_value(data)?;
            if inner.frame_type == FrameType::Transpond {
                return Err(de::Error::custom("nested transpond frame"));
            }
            return Ok(Payload::Relay(Box::new(inner)));
        }

        if data.is_null() {
            return Ok(Payload::Empty);
        }

        if frame_type == FrameType::Err {
            return Ok(match data {
                serde_json::Value::String(reason) => Payload::Error(reason),
                other => Payload::Opaque(other),
            });
        }

        Ok(match method {
            Method::UserOnline => Payload::Presence(serde_json::from_value(data)?),
            Method::ConversationChat => Payload::Chat(serde_json::from_value(data)?),
            Method::ConversationMarkChat => Payload::MarkRead(serde_json::from_value(data)?),
            Method::Push => Payload::Push(serde_json::from_value(data)?),
            Method::Unspecified | Method::Other(_) => Payload::Opaque(data),
        })
    }
}

/// Wire envelope.
///
/// The frame type and relay target are fixed by the constructor: a
/// Transpond frame always carries its target and inner message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub(crate) frame_type: FrameType,
    pub id: String,
    /// End recipient; present exactly on Transpond frames
    pub(crate) transpond_uid: Option<UserId>,
    pub ack_seq: u64,
    pub method: Method,
    pub from_id: UserId,
    pub data: Payload,
    ack_time: Option<Instant>,
    err_count: u32,
}

impl Message {
    fn build(frame_type: FrameType, method: Method, from_id: UserId, data: Payload) -> Self {
        Self {
            frame_type,
            id: generate_message_id(),
            transpond_uid: None,
            ack_seq: 0,
            method,
            from_id,
            data,
            ack_time: None,
            err_count: 0,
        }
    }

    /// Data frame eligible for acknowledged delivery
    pub fn data(method: Method, from_id: impl Into<UserId>, data: Payload) -> Self {
        Self::build(FrameType::Data, method, from_id.into(), data)
    }

    /// Best-effort data frame
    pub fn no_ack(method: Method, from_id: impl Into<UserId>, data: Payload) -> Self {
        Self::build(FrameType::NoAck, method, from_id.into(), data)
    }

    pub fn ping() -> Self {
        Self::build(
            FrameType::Ping,
            Method::Unspecified,
            UserId::new(),
            Payload::Empty,
        )
    }

    /// Acknowledge message `id` at sequence `ack_seq`
    pub fn ack(id: impl Into<String>, ack_seq: u64) -> Self {
        let mut msg = Self::build(
            FrameType::Ack,
            Method::Unspecified,
            UserId::new(),
            Payload::Empty,
        );
        msg.id = id.into();
        msg.ack_seq = ack_seq;
        msg
    }

    pub fn error(reason: impl fmt::Display) -> Self {
        Self::build(
            FrameType::Err,
            Method::Unspecified,
            UserId::new(),
            Payload::Error(reason.to_string()),
        )
    }

    /// Wrap `inner` for relay to the process serving `target`
    pub fn transpond(target: impl Into<UserId>, inner: Message) -> Self {
        Self {
            frame_type: FrameType::Transpond,
            id: inner.id.clone(),
            transpond_uid: Some(target.into()),
            ack_seq: 0,
            method: inner.method.clone(),
            from_id: inner.from_id.clone(),
            data: Payload::Relay(Box::new(inner)),
            ack_time: None,
            err_count: 0,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// Relay target of a Transpond frame
    pub fn transpond_uid(&self) -> Option<&str> {
        self.transpond_uid.as_deref()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Split a Transpond frame into its target and inner message
    pub fn into_relayed(self) -> Option<(UserId, Message)> {
        match (self.frame_type, self.transpond_uid, self.data) {
            (FrameType::Transpond, Some(target), Payload::Relay(inner)) => Some((target, *inner)),
            _ => None,
        }
    }

    /// Only Data frames go through acknowledged delivery
    pub fn requires_ack(&self) -> bool {
        self.frame_type == FrameType::Data
    }

    /// When the last (re)send happened, if any
    pub fn ack_time(&self) -> Option<Instant> {
        self.ack_time
    }

    /// Consecutive unacknowledged sends
    pub fn err_count(&self) -> u32 {
        self.err_count
    }

    pub(crate) fn mark_sent(&mut self) {
        self.ack_time = Some(Instant::now());
    }

    pub(crate) fn record_failure(&mut self) -> u32 {
        self.err_count += 1;
        self.err_count
    }

    /// Encode to the JSON wire form
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from the JSON wire form
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRef<'a> {
    frame_type: FrameType,
    id: &'a str,
    transpond_uid: &'a str,
    ack_seq: u64,
    method: &'a str,
    form_id: &'a str,
    data: &'a Payload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    frame_type: FrameType,
    #[serde(default)]
    id: String,
    #[serde(default)]
    transpond_uid: String,
    #[serde(default)]
    ack_seq: u64,
    #[serde(default)]
    method: String,
    #[serde(default)]
    form_id: String,
    #[serde(default)]
    data: serde_json::Value,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        WireRef {
            frame_type: self.frame_type,
            id: &self.id,
            transpond_uid: self.transpond_uid.as_deref().unwrap_or_default(),
            ack_seq: self.ack_seq,
            method: self.method.as_str(),
            form_id: &self.from_id,
            data: &self.data,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = WireMessage::deserialize(deserializer)?;

        let transpond_uid = (!wire.transpond_uid.is_empty()).then_some(wire.transpond_uid);
        match (wire.frame_type == FrameType::Transpond, transpond_uid.is_some()) {
            (true, false) => return Err(de::Error::custom("transpond frame without transpondUid")),
            (false, true) => {
                return Err(de::Error::custom("transpondUid set on a non-transpond frame"));
            }
            _ => {}
        }

        let method = Method::parse(&wire.method);
        let data = Payload::decode(wire.frame_type, &method, wire.data)
            .map_err(|e| de::Error::custom(format!("invalid data for {:?}: {}", method, e)))?;

        Ok(Message {
            frame_type: wire.frame_type,
            id: wire.id,
            transpond_uid,
            ack_seq: wire.ack_seq,
            method,
            from_id: wire.form_id,
            data,
            ack_time: None,
            err_count: 0,
        })
    }
}

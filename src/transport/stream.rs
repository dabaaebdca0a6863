//! Framed reads and writes over a QUIC control stream

use quinn::{RecvStream, SendStream};

use crate::error::{RelayError, Result};
use crate::protocol::codec::{DecodedFrame, Encodable};
use crate::protocol::frame::{Frame, FrameCodec};

/// One item read off the control stream
#[derive(Debug)]
pub enum Inbound {
    Frame(DecodedFrame),
    /// Framing held but the payload could not be decoded
    Malformed(RelayError),
}

/// Reads length-prefixed frames from a receive stream
pub struct FrameReader {
    recv: RecvStream,
    codec: FrameCodec,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(recv: RecvStream, max_frame_size: usize) -> Self {
        Self {
            recv,
            codec: FrameCodec::new(max_frame_size),
            buf: vec![0u8; 4096],
        }
    }

    /// Next raw frame, `None` once the peer finished the stream.
    /// Errors are fatal to the stream.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self
                .codec
                .decode_next()
                .map_err(|e| RelayError::protocol(format!("Frame decode error: {}", e)))?
            {
                return Ok(Some(frame));
            }

            match self.recv.read(&mut self.buf).await {
                Ok(Some(n)) => self.codec.feed(&self.buf[..n]),
                Ok(None) => return Ok(None),
                Err(e) => {
                    return Err(RelayError::network(format!(
                        "Control stream read error: {}",
                        e
                    )));
                }
            }
        }
    }

    /// Next decoded frame
    pub async fn next(&mut self) -> Result<Option<Inbound>> {
        let Some(frame) = self.next_frame().await? else {
            return Ok(None);
        };

        Ok(Some(match DecodedFrame::decode(&frame) {
            Ok(decoded) => Inbound::Frame(decoded),
            Err(e) => Inbound::Malformed(RelayError::protocol(format!(
                "Malformed {:?} frame: {}",
                frame.kind, e
            ))),
        }))
    }
}

/// Writes length-prefixed frames to a send stream
pub struct FrameWriter {
    send: SendStream,
    max_frame_size: usize,
    frames_sent: u64,
}

impl FrameWriter {
    /// `max_frame_size` is the largest payload the receiving side accepts
    pub fn new(send: SendStream, max_frame_size: usize) -> Self {
        Self {
            send,
            max_frame_size,
            frames_sent: 0,
        }
    }

    /// Write one frame. A payload over the limit fails with
    /// `MessageTooLarge` before any byte reaches the stream, so the
    /// stream stays usable.
    pub async fn write<T: Encodable>(&mut self, payload: &T) -> Result<()> {
        let frame = encode_checked(payload, self.max_frame_size)?;
        self.send.write_all(&frame.encode_to_bytes()).await?;
        self.frames_sent += 1;
        Ok(())
    }

    /// Signal end of stream to the peer
    pub fn finish(&mut self) -> Result<()> {
        self.send.finish()?;
        Ok(())
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }
}

/// Encode `payload` into a frame no larger than `max_frame_size`
pub fn encode_checked<T: Encodable>(payload: &T, max_frame_size: usize) -> Result<Frame> {
    let frame = payload
        .encode_frame()
        .map_err(|e| RelayError::serialization(format!("Failed to encode frame: {}", e)))?;
    if frame.payload.len() > max_frame_size {
        return Err(RelayError::message_too_large(format!(
            "{:?} frame of {} bytes exceeds the {} byte limit",
            frame.kind,
            frame.payload.len(),
            max_frame_size
        )));
    }
    Ok(frame)
}

/// Tunnel framing.
///
/// Every frame is a 1-byte channel id, a 3-byte big-endian payload length
/// and the payload. Control channels carry one JSON message per frame; the
/// media channel carries encoded media packets.
use bytes::{Buf, Bytes, BytesMut};
use log::{trace, warn};
use thiserror::Error;
use vipcore::parser::Channel;

pub const FRAME_CHANNEL_SIZE: usize = 1;
pub const FRAME_LENGTH_SIZE: usize = 3;
pub const FRAME_HEADER_SIZE: usize = FRAME_CHANNEL_SIZE + FRAME_LENGTH_SIZE;
pub const FRAME_MAX_SIZE: usize = 1 << 24;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is too large (max: {max}, got: {got})")]
    TooLarge { max: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: Channel,
    pub payload: Bytes,
}

/// Encodes a payload into a frame for `channel`.
pub fn encode_frame(channel: Channel, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    let payload_len = payload.len();
    if payload_len >= FRAME_MAX_SIZE {
        return Err(FrameError::TooLarge {
            max: FRAME_MAX_SIZE,
            got: payload_len,
        });
    }

    let mut data = Vec::with_capacity(FRAME_HEADER_SIZE + payload_len);
    data.push(channel.as_u8());
    let len_bytes = u32::to_be_bytes(payload_len as u32);
    data.extend_from_slice(&len_bytes[1..]);
    data.extend_from_slice(payload);
    Ok(data)
}

/// Buffers incoming bytes and extracts complete frames.
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame, or `None` until more data arrives.
    /// Frames on unknown channels are skipped.
    pub fn decode_frame(&mut self) -> Option<Frame> {
        loop {
            if self.buffer.len() < FRAME_HEADER_SIZE {
                return None;
            }

            let channel_id = self.buffer[0];
            let frame_len = ((self.buffer[1] as usize) << 16)
                | ((self.buffer[2] as usize) << 8)
                | (self.buffer[3] as usize);

            if self.buffer.len() < FRAME_HEADER_SIZE + frame_len {
                return None;
            }

            self.buffer.advance(FRAME_HEADER_SIZE);
            let payload = self.buffer.split_to(frame_len).freeze();
            match Channel::from_u8(channel_id) {
                Some(channel) => {
                    trace!("<-- Decoded {channel:?} frame: {} bytes", payload.len());
                    return Some(Frame { channel, payload });
                }
                None => {
                    warn!("Dropping frame on unknown channel {channel_id}");
                }
            }
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

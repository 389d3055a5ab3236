//! Audio and video packets as carried on the media channel.
//!
//! Layout (big-endian header, little-endian PCM):
//! `kind:u8 seq:u16 timestamp:u32` followed by
//! * audio: `AUDIO_FRAME_SAMPLES` signed 16-bit samples
//! * video: `flags:u8 width:u16 height:u16` and the encoded frame bytes

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// 8 kHz mono.
pub const AUDIO_SAMPLE_RATE: u32 = 8000;
/// One 40 ms frame.
pub const AUDIO_FRAME_SAMPLES: usize = 320;

const KIND_AUDIO: u8 = 0;
const KIND_VIDEO: u8 = 1;
const HEADER_LEN: usize = 7;
const VIDEO_HEADER_LEN: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),
    #[error("unknown packet kind {0}")]
    UnknownKind(u8),
    #[error("audio payload must be {expected} samples, got {got}")]
    FrameSize { expected: usize, got: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub seq: u16,
    /// RTP timestamp in sample units.
    pub timestamp: u32,
    pub samples: [i16; AUDIO_FRAME_SAMPLES],
}

impl AudioPacket {
    pub fn new(seq: u16, timestamp: u32, samples: [i16; AUDIO_FRAME_SAMPLES]) -> Self {
        Self {
            seq,
            timestamp,
            samples,
        }
    }

    pub fn from_slice(seq: u16, timestamp: u32, samples: &[i16]) -> Result<Self, PacketError> {
        let samples: [i16; AUDIO_FRAME_SAMPLES] =
            samples.try_into().map_err(|_| PacketError::FrameSize {
                expected: AUDIO_FRAME_SAMPLES,
                got: samples.len(),
            })?;
        Ok(Self::new(seq, timestamp, samples))
    }

    pub fn silence(seq: u16, timestamp: u32) -> Self {
        Self::new(seq, timestamp, [0; AUDIO_FRAME_SAMPLES])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VideoPacket {
    pub seq: u16,
    pub timestamp: u32,
    pub keyframe: bool,
    pub width: u16,
    pub height: u16,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaPacket {
    Audio(AudioPacket),
    Video(VideoPacket),
}

impl MediaPacket {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Audio(audio) => {
                let mut buf = BytesMut::with_capacity(HEADER_LEN + AUDIO_FRAME_SAMPLES * 2);
                buf.put_u8(KIND_AUDIO);
                buf.put_u16(audio.seq);
                buf.put_u32(audio.timestamp);
                for sample in audio.samples {
                    buf.put_i16_le(sample);
                }
                buf.freeze()
            }
            Self::Video(video) => {
                let mut buf =
                    BytesMut::with_capacity(HEADER_LEN + VIDEO_HEADER_LEN + video.data.len());
                buf.put_u8(KIND_VIDEO);
                buf.put_u16(video.seq);
                buf.put_u32(video.timestamp);
                buf.put_u8(video.keyframe as u8);
                buf.put_u16(video.width);
                buf.put_u16(video.height);
                buf.put_slice(&video.data);
                buf.freeze()
            }
        }
    }

    pub fn decode(mut data: Bytes) -> Result<Self, PacketError> {
        if data.len() < HEADER_LEN {
            return Err(PacketError::TooShort(data.len()));
        }
        let kind = data.get_u8();
        let seq = data.get_u16();
        let timestamp = data.get_u32();
        match kind {
            KIND_AUDIO => {
                if data.len() != AUDIO_FRAME_SAMPLES * 2 {
                    return Err(PacketError::FrameSize {
                        expected: AUDIO_FRAME_SAMPLES,
                        got: data.len() / 2,
                    });
                }
                let mut samples = [0i16; AUDIO_FRAME_SAMPLES];
                for sample in samples.iter_mut() {
                    *sample = data.get_i16_le();
                }
                Ok(Self::Audio(AudioPacket::new(seq, timestamp, samples)))
            }
            KIND_VIDEO => {
                if data.len() < VIDEO_HEADER_LEN {
                    return Err(PacketError::TooShort(HEADER_LEN + data.len()));
                }
                let keyframe = data.get_u8() & 1 == 1;
                let width = data.get_u16();
                let height = data.get_u16();
                Ok(Self::Video(VideoPacket {
                    seq,
                    timestamp,
                    keyframe,
                    width,
                    height,
                    data,
                }))
            }
            other => Err(PacketError::UnknownKind(other)),
        }
    }
}

pub mod echo;
pub mod jitter;
pub mod packet;
pub mod ring;
pub mod video;

pub use echo::{DefaultEchoCanceller, EchoCanceller, EchoState};
pub use jitter::{JitterBuffer, JitterBufferConfig, JitterStats};
pub use packet::{
    AUDIO_FRAME_SAMPLES, AUDIO_SAMPLE_RATE, AudioPacket, MediaPacket, PacketError, VideoPacket,
};
pub use ring::{
    AUDIO_RING_CAPACITY, CircularBuffer, FrameRead, SampleReader, SampleRing, SampleWriter,
    UnalignedChunk,
};
pub use video::{
    DecodedFrame, DecoderKind, FrameFlags, FrameInfo, SoftwareDecoder, VideoDecoder,
    select_decoder,
};

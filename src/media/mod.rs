//! Per-call media: the audio pipeline, the video decode worker and the
//! [`MediaSession`] tying both to a unit's call.

pub mod audio;
pub mod session;
pub mod video;

pub use audio::{AudioPipeline, AudioPipelineConfig};
pub use session::{MediaSession, MediaSessionConfig, NOT_ON_SOURCE_AFTER};
pub use video::VideoWorker;

use vipcore::media::{AUDIO_FRAME_SAMPLES, DecodedFrame};

/// A full-duplex audio device working in 40 ms frames.
///
/// Both calls block for about one frame period, which is what paces the
/// mic and speaker threads. Returning `false` means the device is gone and
/// ends the thread.
pub trait AudioDevice: Send + Sync {
    fn capture(&self, frame: &mut [i16; AUDIO_FRAME_SAMPLES]) -> bool;
    fn play(&self, frame: &[i16; AUDIO_FRAME_SAMPLES]) -> bool;
}

/// Receives decoded video frames on the decode thread.
pub trait FrameSink: Send + Sync {
    fn on_frame(&self, frame: DecodedFrame);
}

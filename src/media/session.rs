use super::audio::{AudioPipeline, AudioPipelineConfig};
use super::video::VideoWorker;
use super::{AudioDevice, FrameSink};
use crate::engine::CallEngine;
use crate::engine::call_engine::now;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use vipcore::media::{DecoderKind, VideoDecoder, select_decoder};
use vipcore::types::UnitKey;

/// Without a decoded frame for this long the session reports that the
/// unit is not on source.
pub const NOT_ON_SOURCE_AFTER: Duration = Duration::from_secs(5);

const VIDEO_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Default)]
pub struct MediaSessionConfig {
    pub audio: AudioPipelineConfig,
}

/// Media of one call: the audio pipeline plus, for video units, a feeder
/// thread moving received frames into the decode worker.
pub struct MediaSession {
    engine: Arc<CallEngine>,
    unit: UnitKey,
    audio: Arc<AudioPipeline>,
    video: Mutex<Option<Arc<VideoWorker>>>,
    feeder: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
    started_at: Mutex<Option<Instant>>,
}

impl MediaSession {
    pub fn new(engine: Arc<CallEngine>, unit: UnitKey, config: MediaSessionConfig) -> Self {
        Self {
            audio: AudioPipeline::new(engine.clone(), unit, config.audio),
            engine,
            unit,
            video: Mutex::new(None),
            feeder: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            started_at: Mutex::new(None),
        }
    }

    pub fn unit(&self) -> UnitKey {
        self.unit
    }

    pub fn audio(&self) -> &Arc<AudioPipeline> {
        &self.audio
    }

    /// Starts audio on `device` and, when `sink` is given, video decoding
    /// with the unit's decoder. `platform` is the hardware decoder, if the
    /// host has one.
    pub fn start(
        &self,
        device: Arc<dyn AudioDevice>,
        sink: Option<Arc<dyn FrameSink>>,
        platform: Option<Box<dyn VideoDecoder>>,
    ) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        *self.started_at.lock().expect("Mutex should not be poisoned") = Some(now());
        self.audio.start(device)?;

        if let Some(sink) = sink {
            let kind = self
                .engine
                .decoder_kind(self.unit)
                .unwrap_or(DecoderKind::Software);
            let decoder = select_decoder(kind, platform);
            let worker = Arc::new(VideoWorker::spawn(
                self.engine.clone(),
                self.unit,
                decoder,
                sink,
            )?);
            *self.video.lock().expect("Mutex should not be poisoned") = Some(worker.clone());

            let engine = self.engine.clone();
            let running = self.running.clone();
            let unit = self.unit;
            let feeder = std::thread::Builder::new()
                .name(format!("video-feed-{unit}"))
                .spawn(move || {
                    while running.load(Ordering::SeqCst) {
                        while let Some(packet) = engine.get_video_frame(unit) {
                            worker.submit(packet);
                        }
                        std::thread::sleep(VIDEO_POLL_INTERVAL);
                    }
                })?;
            *self.feeder.lock().expect("Mutex should not be poisoned") = Some(feeder);
        }
        info!(target: "Media/Session", "{}: media started", self.unit);
        Ok(())
    }

    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.audio.stop();
        if let Some(feeder) = self
            .feeder
            .lock()
            .expect("Mutex should not be poisoned")
            .take()
        {
            let _ = feeder.join();
        }
        // The feeder held the other reference; dropping ours joins the worker.
        self.video
            .lock()
            .expect("Mutex should not be poisoned")
            .take();
        debug!(target: "Media/Session", "{}: media stopped", self.unit);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn toggle_mute(&self) -> bool {
        self.audio.toggle_mute()
    }

    pub fn is_muted(&self) -> bool {
        self.audio.is_muted()
    }

    /// Whether the unit is delivering video. Audio-only sessions are always
    /// on source; a video session gets [`NOT_ON_SOURCE_AFTER`] from start
    /// or from its last decoded frame.
    pub fn is_on_source(&self) -> bool {
        self.is_on_source_at(now())
    }

    pub fn is_on_source_at(&self, at: Instant) -> bool {
        let video = self.video.lock().expect("Mutex should not be poisoned");
        let Some(worker) = video.as_ref() else {
            return true;
        };
        let reference = worker
            .last_decoded()
            .or(*self.started_at.lock().expect("Mutex should not be poisoned"));
        reference.is_none_or(|t| at.saturating_duration_since(t) < NOT_ON_SOURCE_AFTER)
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CallTimers;
    use crate::test_utils::{CollectingFrameSink, FakeAudioDevice, MockNativeEngine};
    use bytes::Bytes;
    use vipcore::CoreEventBus;
    use vipcore::media::{AUDIO_FRAME_SAMPLES, VideoPacket};
    use vipcore::types::{UnitFlags, UnitType};

    fn setup(flags: UnitFlags) -> (Arc<MockNativeEngine>, MediaSession) {
        let native = Arc::new(MockNativeEngine::new());
        let engine = CallEngine::new(native.clone(), CoreEventBus::new(), CallTimers::default());
        engine.start().unwrap();
        let sys = engine.create_base_system().unwrap();
        let unit = engine.create_unit(sys, UnitType::Vip, flags).unwrap();
        let session = MediaSession::new(
            engine,
            UnitKey::new(sys, unit),
            MediaSessionConfig::default(),
        );
        (native, session)
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_audio_flows_both_ways() {
        let (native, session) = setup(UnitFlags::AUDIO);
        let device = Arc::new(FakeAudioDevice::new([100; AUDIO_FRAME_SAMPLES]));
        session.start(device.clone(), None, None).unwrap();

        wait_for(|| native.sent_audio().len() >= 3 && device.played_frames() >= 3);
        session.stop();
        assert!(native.sent_audio().len() >= 3);
        assert!(device.played_frames() >= 3);
        assert!(session.is_on_source());
    }

    #[test]
    fn test_video_goes_off_source_without_frames() {
        let (native, session) = setup(UnitFlags::AUDIO | UnitFlags::VIDEO | UnitFlags::SOFTWARE_DECODE);
        let sink = Arc::new(CollectingFrameSink::default());
        let device = Arc::new(FakeAudioDevice::new([0; AUDIO_FRAME_SAMPLES]));
        session.start(device, Some(sink.clone()), None).unwrap();

        let started = now();
        assert!(session.is_on_source_at(started));
        assert!(!session.is_on_source_at(started + NOT_ON_SOURCE_AFTER + Duration::from_secs(1)));

        native.push_video(
            session.unit(),
            VideoPacket {
                seq: 0,
                timestamp: 0,
                keyframe: true,
                width: 2,
                height: 2,
                data: Bytes::from_static(&[16, 16, 16, 16, 128, 128]),
            },
        );
        wait_for(|| !sink.frames().is_empty());
        assert_eq!(sink.frames().len(), 1);
        assert!(session.is_on_source_at(now()));
        session.stop();
    }

    #[test]
    fn test_mute_toggles() {
        let (_native, session) = setup(UnitFlags::AUDIO);
        assert!(!session.is_muted());
        assert!(session.toggle_mute());
        assert!(session.is_muted());
        assert!(!session.toggle_mute());
    }
}

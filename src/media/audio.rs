//! Audio path of a call.
//!
//! Three threads share the path and each ring half has one owner. The mic
//! thread only writes captured frames into the mic ring and the speaker
//! thread only plays what it reads from the speaker ring. The pump thread
//! does the engine work between them: echo cancellation, mute, sending
//! packets, and feeding the jitter buffer into the speaker ring.

use super::AudioDevice;
use crate::engine::CallEngine;
use crate::engine::call_engine::now;
use log::{debug, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use vipcore::media::{
    AUDIO_FRAME_SAMPLES, AUDIO_RING_CAPACITY, AudioPacket, DefaultEchoCanceller, EchoCanceller,
    EchoState, FrameRead, JitterBuffer, JitterBufferConfig, JitterStats, SampleReader, SampleRing,
    SampleWriter,
};
use vipcore::types::UnitKey;

/// How often the pump thread services both rings.
pub const PUMP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct AudioPipelineConfig {
    pub jitter: JitterBufferConfig,
    /// Capacity of each sample ring, in samples.
    pub ring_capacity: usize,
    /// Run the echo canceller on both paths.
    pub echo_cancellation: bool,
}

impl Default for AudioPipelineConfig {
    fn default() -> Self {
        Self {
            jitter: JitterBufferConfig::default(),
            ring_capacity: AUDIO_RING_CAPACITY,
            echo_cancellation: true,
        }
    }
}

type Frame = [i16; AUDIO_FRAME_SAMPLES];

pub struct AudioPipeline {
    engine: Arc<CallEngine>,
    unit: UnitKey,
    config: AudioPipelineConfig,
    // Touched by the pump thread and by control calls, never by the device threads.
    jitter: Mutex<JitterBuffer>,
    echo: Mutex<DefaultEchoCanceller>,
    muted: AtomicBool,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// The three owners of one audio path, as handed out by
/// [`AudioPipeline::open`].
#[derive(Debug)]
pub struct AudioPath {
    /// Written by the capture side.
    pub mic: SampleWriter,
    pub pump: AudioPump,
    /// Read by the playback side.
    pub speaker: SampleReader,
}

impl AudioPipeline {
    pub fn new(engine: Arc<CallEngine>, unit: UnitKey, config: AudioPipelineConfig) -> Arc<Self> {
        Arc::new(Self {
            engine,
            unit,
            jitter: Mutex::new(JitterBuffer::new(config.jitter.clone())),
            echo: Mutex::new(DefaultEchoCanceller::default()),
            config,
            muted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn unit(&self) -> UnitKey {
        self.unit
    }

    /// Creates fresh mic and speaker rings and splits them between the
    /// capture side, the pump and the playback side.
    pub fn open(self: &Arc<Self>) -> AudioPath {
        let (mic, mic_out) = SampleRing::new(self.config.ring_capacity).split();
        let (speaker_in, speaker) = SampleRing::new(self.config.ring_capacity).split();
        AudioPath {
            mic,
            pump: AudioPump {
                pipeline: self.clone(),
                mic: mic_out,
                speaker: speaker_in,
                tx_seq: 0,
                tx_timestamp: 0,
            },
            speaker,
        }
    }

    /// Spawns the mic, speaker and pump threads on `device`.
    pub fn start(self: &Arc<Self>, device: Arc<dyn AudioDevice>) -> std::io::Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.spawn_threads(device, self.open()) {
            self.stop();
            return Err(e);
        }
        info!(target: "Media/Audio", "{}: audio started", self.unit);
        Ok(())
    }

    fn spawn_threads(
        self: &Arc<Self>,
        device: Arc<dyn AudioDevice>,
        path: AudioPath,
    ) -> std::io::Result<()> {
        let AudioPath {
            mut mic,
            mut pump,
            mut speaker,
        } = path;
        let spawn = |name: String, body: Box<dyn FnOnce() + Send>| -> std::io::Result<()> {
            let handle = std::thread::Builder::new().name(name).spawn(body)?;
            self.threads
                .lock()
                .expect("Mutex should not be poisoned")
                .push(handle);
            Ok(())
        };

        let (pipeline, capture) = (self.clone(), device.clone());
        spawn(
            format!("mic-{}", self.unit),
            Box::new(move || pipeline.mic_loop(capture.as_ref(), &mut mic)),
        )?;
        let pipeline = self.clone();
        spawn(
            format!("spk-{}", self.unit),
            Box::new(move || pipeline.speaker_loop(device.as_ref(), &mut speaker)),
        )?;
        let pipeline = self.clone();
        spawn(
            format!("audio-pump-{}", self.unit),
            Box::new(move || {
                while pipeline.is_running() {
                    pump.pump_uplink();
                    pump.pump_downlink(now());
                    std::thread::sleep(PUMP_INTERVAL);
                }
            }),
        )
    }

    /// Stops all three threads and waits for them. The device must return
    /// from its blocking calls for the join to finish.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let threads: Vec<_> = self
            .threads
            .lock()
            .expect("Mutex should not be poisoned")
            .drain(..)
            .collect();
        for thread in threads {
            if thread.join().is_err() {
                warn!(target: "Media/Audio", "{}: audio thread panicked", self.unit);
            }
        }
        self.jitter
            .lock()
            .expect("Mutex should not be poisoned")
            .reset();
        info!(target: "Media/Audio", "{}: audio stopped", self.unit);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flips the mic mute and returns the new state. Muted capture is
    /// replaced by silence, so the peer keeps receiving packets.
    pub fn toggle_mute(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn echo_state(&self) -> EchoState {
        self.echo
            .lock()
            .expect("Mutex should not be poisoned")
            .state()
    }

    /// Restarts echo calibration, e.g. after the audio route changed.
    pub fn reset_echo(&self) {
        self.echo
            .lock()
            .expect("Mutex should not be poisoned")
            .reset();
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter
            .lock()
            .expect("Mutex should not be poisoned")
            .stats()
    }

    fn mic_loop(&self, device: &dyn AudioDevice, mic: &mut SampleWriter) {
        let mut frame = [0i16; AUDIO_FRAME_SAMPLES];
        while self.is_running() {
            if !device.capture(&mut frame) {
                debug!(target: "Media/Audio", "{}: capture device closed", self.unit);
                break;
            }
            if let Ok(dropped) = mic.add_samples(&frame)
                && dropped > 0
            {
                trace!(target: "Media/Audio", "{}: mic ring full", self.unit);
            }
        }
    }

    fn speaker_loop(&self, device: &dyn AudioDevice, speaker: &mut SampleReader) {
        let mut frame = [0i16; AUDIO_FRAME_SAMPLES];
        while self.is_running() {
            speaker.get_samples(&mut frame);
            if !device.play(&frame) {
                debug!(target: "Media/Audio", "{}: playback device closed", self.unit);
                break;
            }
        }
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for AudioPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPipeline")
            .field("unit", &self.unit)
            .field("running", &self.is_running())
            .field("muted", &self.is_muted())
            .finish_non_exhaustive()
    }
}

/// Engine side of an audio path. Drains the mic ring into packets and
/// refills the speaker ring from the jitter buffer.
pub struct AudioPump {
    pipeline: Arc<AudioPipeline>,
    mic: SampleReader,
    speaker: SampleWriter,
    tx_seq: u16,
    tx_timestamp: u32,
}

impl AudioPump {
    /// Sends every whole frame waiting on the mic ring, after echo
    /// cancellation and mute. Returns how many packets the engine took.
    pub fn pump_uplink(&mut self) -> usize {
        let pipeline = &self.pipeline;
        let mut frame = [0i16; AUDIO_FRAME_SAMPLES];
        let mut sent = 0;
        while self.mic.get_samples(&mut frame) == FrameRead::Frame {
            if pipeline.config.echo_cancellation {
                pipeline
                    .echo
                    .lock()
                    .expect("Mutex should not be poisoned")
                    .process_mic(&mut frame);
            }
            if pipeline.is_muted() {
                frame.fill(0);
            }
            let seq = self.tx_seq;
            let packet = AudioPacket::new(seq, self.tx_timestamp, frame);
            self.tx_seq = seq.wrapping_add(1);
            self.tx_timestamp = self.tx_timestamp.wrapping_add(AUDIO_FRAME_SAMPLES as u32);
            match pipeline.engine.send_audio_packet(pipeline.unit, &packet) {
                Ok(()) => sent += 1,
                Err(e) => {
                    trace!(target: "Media/Audio", "{}: packet {seq} dropped: {e}", pipeline.unit)
                }
            }
        }
        sent
    }

    /// Moves received packets into the jitter buffer and writes what is
    /// due, through the echo canceller's speaker path, into the speaker
    /// ring. Returns how many frames were queued for playback.
    pub fn pump_downlink(&mut self, now: Instant) -> usize {
        let pipeline = &self.pipeline;
        let mut jitter = pipeline.jitter.lock().expect("Mutex should not be poisoned");
        while let Some(packet) = pipeline.engine.get_audio_packet(pipeline.unit) {
            jitter.push(packet, now);
        }
        let mut queued = 0;
        while self.speaker.frames_free() > 0 {
            let Some(packet) = jitter.pop(now) else {
                break;
            };
            let mut frame: Frame = packet.samples;
            if pipeline.config.echo_cancellation {
                pipeline
                    .echo
                    .lock()
                    .expect("Mutex should not be poisoned")
                    .process_speaker(&mut frame);
            }
            if self.speaker.add_samples(&frame) == Ok(0) {
                queued += 1;
            }
        }
        queued
    }
}

impl std::fmt::Debug for AudioPump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioPump")
            .field("unit", &self.pipeline.unit)
            .field("tx_seq", &self.tx_seq)
            .finish_non_exhaustive()
    }
}

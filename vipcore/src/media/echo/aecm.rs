//! Mobile echo control: a delay-agnostic NLMS canceller followed by
//! routing-dependent residual suppression, voice activity detection and a
//! simple noise suppressor.

use super::{EchoCanceller, EchoState, ReferenceHistory, to_i16};
use crate::media::packet::AUDIO_FRAME_SAMPLES;

/// Audio route, which sets how hard residual echo is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RoutingMode {
    QuietEarpieceOrHeadset,
    Earpiece,
    LoudEarpiece,
    #[default]
    Speakerphone,
    LoudSpeakerphone,
}

impl RoutingMode {
    /// Gain applied to the residual while only the far end is talking.
    pub fn residual_gain(self) -> f32 {
        match self {
            Self::QuietEarpieceOrHeadset => 0.5,
            Self::Earpiece => 0.35,
            Self::LoudEarpiece => 0.25,
            Self::Speakerphone => 0.15,
            Self::LoudSpeakerphone => 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MobileEchoConfig {
    pub routing: RoutingMode,
    /// Echo tail covered by the adaptive filter, in samples.
    pub filter_len: usize,
    pub nlms_step: f32,
    pub noise_suppression: bool,
    /// Frame energy over the noise floor that counts as voice.
    pub vad_ratio: f32,
    pub vad_hangover_frames: u32,
}

impl Default for MobileEchoConfig {
    fn default() -> Self {
        Self {
            routing: RoutingMode::default(),
            filter_len: 512, // 64 ms
            nlms_step: 0.5,
            noise_suppression: true,
            vad_ratio: 3.0,
            vad_hangover_frames: 5,
        }
    }
}

/// Lowest noise floor tracked, as mean square (RMS 100).
const MIN_NOISE_FLOOR: f32 = 1.0e4;

/// Energy detector with a tracked noise floor and hangover.
#[derive(Debug, Clone)]
pub struct VoiceActivityDetector {
    ratio: f32,
    hangover_frames: u32,
    noise_floor: f32,
    hangover: u32,
}

impl VoiceActivityDetector {
    pub fn new(ratio: f32, hangover_frames: u32) -> Self {
        Self {
            ratio,
            hangover_frames,
            noise_floor: MIN_NOISE_FLOOR,
            hangover: 0,
        }
    }

    pub fn noise_floor(&self) -> f32 {
        self.noise_floor
    }

    pub fn analyze(&mut self, frame: &[i16]) -> bool {
        let energy = mean_square(frame);
        if energy > self.noise_floor * self.ratio {
            self.hangover = self.hangover_frames;
            return true;
        }
        if self.hangover > 0 {
            self.hangover -= 1;
            return true;
        }
        self.noise_floor = (0.95 * self.noise_floor + 0.05 * energy).max(MIN_NOISE_FLOOR);
        false
    }
}

fn mean_square(frame: &[i16]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|&s| (s as f32) * (s as f32)).sum::<f32>() / frame.len() as f32
}

pub struct MobileEchoControl {
    config: MobileEchoConfig,
    reference: ReferenceHistory,
    taps: Vec<f32>,
    mic_pos: u64,
    far_vad: VoiceActivityDetector,
    near_vad: VoiceActivityDetector,
    far_active: bool,
}

impl MobileEchoControl {
    pub fn new(config: MobileEchoConfig) -> Self {
        Self {
            reference: ReferenceHistory::new(config.filter_len + 8 * AUDIO_FRAME_SAMPLES),
            taps: vec![0.0; config.filter_len],
            mic_pos: 0,
            far_vad: VoiceActivityDetector::new(config.vad_ratio, config.vad_hangover_frames),
            near_vad: VoiceActivityDetector::new(config.vad_ratio, config.vad_hangover_frames),
            far_active: false,
            config,
        }
    }

    pub fn set_routing(&mut self, routing: RoutingMode) {
        self.config.routing = routing;
    }

    pub fn far_end_active(&self) -> bool {
        self.far_active
    }
}

impl Default for MobileEchoControl {
    fn default() -> Self {
        Self::new(MobileEchoConfig::default())
    }
}

impl EchoCanceller for MobileEchoControl {
    fn process_speaker(&mut self, frame: &mut [i16]) {
        self.far_active = self.far_vad.analyze(frame);
        for &sample in frame.iter() {
            self.reference.push(sample as f32);
        }
    }

    fn process_mic(&mut self, frame: &mut [i16]) {
        for sample in frame.iter_mut() {
            let m = self.mic_pos as i64;
            self.mic_pos += 1;
            let mut estimate = 0.0;
            let mut energy = 0.0;
            for (j, w) in self.taps.iter().enumerate() {
                let x = self.reference.at(m - j as i64);
                estimate += w * x;
                energy += x * x;
            }
            let error = *sample as f32 - estimate;
            if energy > 0.0 {
                let step = self.config.nlms_step * error / (energy + 1.0);
                for j in 0..self.taps.len() {
                    let x = self.reference.at(m - j as i64);
                    self.taps[j] += step * x;
                }
            }
            *sample = to_i16(error);
        }

        let near_active = self.near_vad.analyze(frame);
        if near_active {
            return;
        }
        let mut gain = 1.0;
        if self.far_active {
            gain *= self.config.routing.residual_gain();
        }
        if self.config.noise_suppression {
            let energy = mean_square(frame).max(1.0);
            gain *= (1.0 - self.near_vad.noise_floor() / energy).max(0.3);
        }
        for sample in frame.iter_mut() {
            *sample = to_i16(*sample as f32 * gain);
        }
    }

    fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    fn state(&self) -> EchoState {
        EchoState::Run
    }
}

impl std::fmt::Debug for MobileEchoControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MobileEchoControl")
            .field("routing", &self.config.routing)
            .field("far_active", &self.far_active)
            .finish()
    }
}

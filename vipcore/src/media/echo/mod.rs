//! Acoustic echo cancellation.
//!
//! Two implementations share the [`EchoCanceller`] interface. Which one a
//! build uses is fixed at compile time through [`DefaultEchoCanceller`]:
//! the `aecm` feature selects [`MobileEchoControl`], otherwise the
//! probe-calibrated [`FirEchoCanceller`] is used.

mod aecm;
mod fir;
mod mls;

pub use aecm::{MobileEchoConfig, MobileEchoControl, RoutingMode, VoiceActivityDetector};
pub use fir::{FirEchoCanceller, FirEchoConfig};
pub use mls::{MLS_LENGTH, mls_sequence};

/// Phase of an echo canceller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EchoState {
    /// Letting the microphone settle after the stream opens.
    MicStartupWait,
    /// Playing the probe sequence into the acoustic path.
    PerfectSequence,
    /// Probe still playing; microphone samples saved for correlation.
    CrossCorrelationSavingSamples,
    FirCalculating,
    /// Speaker gain rising back to unity with cancellation active.
    VolumeRampUp,
    Run,
}

/// Processes one audio frame at a time on each path.
///
/// `process_speaker` is given the far-end frame just before playback and
/// may rewrite it (probe injection, gain). `process_mic` removes the echo
/// of what was played from the captured frame in place.
pub trait EchoCanceller: Send {
    fn process_speaker(&mut self, frame: &mut [i16]);

    fn process_mic(&mut self, frame: &mut [i16]);

    /// Restarts calibration from scratch.
    fn reset(&mut self);

    fn state(&self) -> EchoState;
}

#[cfg(not(feature = "aecm"))]
pub type DefaultEchoCanceller = FirEchoCanceller;
#[cfg(feature = "aecm")]
pub type DefaultEchoCanceller = MobileEchoControl;

/// Speaker history addressed by absolute sample index.
#[derive(Debug, Clone)]
pub(crate) struct ReferenceHistory {
    samples: Vec<f32>,
    written: u64,
}

impl ReferenceHistory {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            samples: vec![0.0; capacity.max(1)],
            written: 0,
        }
    }

    pub(crate) fn push(&mut self, sample: f32) {
        let cap = self.samples.len() as u64;
        self.samples[(self.written % cap) as usize] = sample;
        self.written += 1;
    }

    /// Number of samples pushed so far, i.e. the index of the next one.
    pub(crate) fn position(&self) -> u64 {
        self.written
    }

    /// Sample at absolute `index`, or silence if not yet written or evicted.
    pub(crate) fn at(&self, index: i64) -> f32 {
        let cap = self.samples.len() as i64;
        let written = self.written as i64;
        if index < 0 || index >= written || written - index > cap {
            return 0.0;
        }
        self.samples[(index % cap) as usize]
    }

    pub(crate) fn clear(&mut self) {
        self.samples.fill(0.0);
        self.written = 0;
    }
}

pub(crate) fn to_i16(value: f32) -> i16 {
    value.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

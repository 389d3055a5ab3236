use super::mls::{MLS_LENGTH, mls_sequence};
use super::{EchoCanceller, EchoState, ReferenceHistory, to_i16};
use crate::media::packet::AUDIO_FRAME_SAMPLES;

#[derive(Debug, Clone)]
pub struct FirEchoConfig {
    /// Microphone frames to skip before probing.
    pub startup_frames: usize,
    /// Peak level of the probe chips.
    pub probe_amplitude: f32,
    /// Probe periods averaged into the correlation.
    pub probe_periods: usize,
    /// FIR taps kept from the measured impulse response, starting at its peak.
    pub filter_len: usize,
    /// Speaker frames over which gain returns to unity.
    pub ramp_frames: usize,
    /// NLMS step size during `Run`. Zero keeps the measured taps fixed.
    pub nlms_step: f32,
}

impl Default for FirEchoConfig {
    fn default() -> Self {
        Self {
            startup_frames: 10, // 400 ms
            probe_amplitude: 3000.0,
            probe_periods: 2,
            filter_len: 128,
            ramp_frames: 10,
            nlms_step: 0.05,
        }
    }
}

/// Time-domain canceller calibrated with an MLS probe.
///
/// Delay and impulse response are measured once per [`reset`](EchoCanceller::reset):
/// the probe is played, one full period is let through to fill the acoustic
/// path, then microphone samples are folded per probe phase and
/// cross-correlated against the sequence. The strongest tap gives the delay
/// and the FIR window starts there.
pub struct FirEchoCanceller {
    config: FirEchoConfig,
    state: EchoState,
    visited: Vec<EchoState>,
    reference: ReferenceHistory,
    mic_pos: u64,
    startup_seen: usize,
    probe_start: Option<u64>,
    probe_emitted: u64,
    folded: Vec<f32>,
    saved: usize,
    delay: Option<usize>,
    taps: Vec<f32>,
    ramp_done: usize,
}

impl FirEchoCanceller {
    pub fn new(config: FirEchoConfig) -> Self {
        let history = MLS_LENGTH + config.filter_len + 8 * AUDIO_FRAME_SAMPLES;
        Self {
            state: EchoState::MicStartupWait,
            visited: vec![EchoState::MicStartupWait],
            reference: ReferenceHistory::new(history),
            mic_pos: 0,
            startup_seen: 0,
            probe_start: None,
            probe_emitted: 0,
            folded: vec![0.0; MLS_LENGTH],
            saved: 0,
            delay: None,
            taps: Vec::new(),
            ramp_done: 0,
            config,
        }
    }

    /// Estimated acoustic delay in samples, once calibrated.
    pub fn estimated_delay(&self) -> Option<usize> {
        self.delay
    }

    pub fn taps(&self) -> &[f32] {
        &self.taps
    }

    /// States entered since construction or the last reset, in order.
    pub fn visited_states(&self) -> &[EchoState] {
        &self.visited
    }

    fn enter(&mut self, state: EchoState) {
        log::debug!(target: "Media/Echo", "{:?} -> {:?}", self.state, state);
        self.state = state;
        self.visited.push(state);
    }

    fn calculate_fir(&mut self) {
        let chips = mls_sequence();
        let n = MLS_LENGTH;
        let periods = self.config.probe_periods.max(1) as f32;
        let amplitude = self.config.probe_amplitude;

        let y: Vec<f32> = self.folded.iter().map(|v| v / periods).collect();
        let sum_y: f32 = y.iter().sum();
        // Circular autocorrelation of the probe is N at lag 0 and -1
        // elsewhere, so R[k] = A((N+1)h[k] - sum(h)) and sum(y) = A*sum(h).
        let response: Vec<f32> = (0..n)
            .map(|k| {
                let r: f32 = (0..n).map(|i| y[i] * chips[(i + n - k) % n]).sum();
                (r + sum_y) / ((n as f32 + 1.0) * amplitude)
            })
            .collect();

        let delay = response
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
            .map(|(k, _)| k)
            .unwrap_or(0);

        self.taps = (0..self.config.filter_len)
            .map(|j| response.get(delay + j).copied().unwrap_or(0.0))
            .collect();
        self.delay = Some(delay);
        log::info!(target: "Media/Echo", "echo delay estimated at {delay} samples");
    }

    fn cancel(&mut self, m: u64, y: f32, adapt: bool) -> f32 {
        let Some(delay) = self.delay else { return y };
        let base = m as i64 - delay as i64;
        let mut estimate = 0.0;
        let mut energy = 0.0;
        for (j, w) in self.taps.iter().enumerate() {
            let x = self.reference.at(base - j as i64);
            estimate += w * x;
            energy += x * x;
        }
        let error = y - estimate;
        if adapt && self.config.nlms_step > 0.0 && energy > 0.0 {
            let step = self.config.nlms_step * error / (energy + 1.0);
            for j in 0..self.taps.len() {
                let x = self.reference.at(base - j as i64);
                self.taps[j] += step * x;
            }
        }
        error
    }
}

impl Default for FirEchoCanceller {
    fn default() -> Self {
        Self::new(FirEchoConfig::default())
    }
}

impl EchoCanceller for FirEchoCanceller {
    fn process_speaker(&mut self, frame: &mut [i16]) {
        match self.state {
            EchoState::MicStartupWait | EchoState::FirCalculating => {
                frame.fill(0);
            }
            EchoState::PerfectSequence | EchoState::CrossCorrelationSavingSamples => {
                if self.probe_start.is_none() {
                    self.probe_start = Some(self.reference.position());
                }
                let chips = mls_sequence();
                for sample in frame.iter_mut() {
                    let chip = chips[(self.probe_emitted % MLS_LENGTH as u64) as usize];
                    *sample = to_i16(chip * self.config.probe_amplitude);
                    self.probe_emitted += 1;
                }
            }
            EchoState::VolumeRampUp => {
                self.ramp_done += 1;
                let gain = self.ramp_done as f32 / self.config.ramp_frames.max(1) as f32;
                for sample in frame.iter_mut() {
                    *sample = to_i16(*sample as f32 * gain.min(1.0));
                }
                if self.ramp_done >= self.config.ramp_frames {
                    self.enter(EchoState::Run);
                }
            }
            EchoState::Run => {}
        }
        for &sample in frame.iter() {
            self.reference.push(sample as f32);
        }
    }

    fn process_mic(&mut self, frame: &mut [i16]) {
        if self.state == EchoState::FirCalculating {
            self.calculate_fir();
            self.enter(EchoState::VolumeRampUp);
            if self.config.ramp_frames == 0 {
                self.enter(EchoState::Run);
            }
        }

        if self.state == EchoState::MicStartupWait {
            self.startup_seen += 1;
            self.mic_pos += frame.len() as u64;
            if self.startup_seen >= self.config.startup_frames {
                self.enter(EchoState::PerfectSequence);
            }
            return;
        }

        let needed = MLS_LENGTH * self.config.probe_periods.max(1);
        for sample in frame.iter_mut() {
            let m = self.mic_pos;
            self.mic_pos += 1;
            match self.state {
                EchoState::PerfectSequence => {
                    if let Some(p0) = self.probe_start
                        && m >= p0 + MLS_LENGTH as u64
                    {
                        self.enter(EchoState::CrossCorrelationSavingSamples);
                    }
                    if self.state == EchoState::CrossCorrelationSavingSamples
                        && let Some(p0) = self.probe_start
                    {
                        self.folded[((m - p0) % MLS_LENGTH as u64) as usize] += *sample as f32;
                        self.saved += 1;
                    }
                    *sample = 0;
                }
                EchoState::CrossCorrelationSavingSamples => {
                    if self.saved < needed
                        && let Some(p0) = self.probe_start
                    {
                        self.folded[((m - p0) % MLS_LENGTH as u64) as usize] += *sample as f32;
                        self.saved += 1;
                        if self.saved == needed {
                            self.enter(EchoState::FirCalculating);
                        }
                    }
                    *sample = 0;
                }
                EchoState::FirCalculating => *sample = 0,
                EchoState::VolumeRampUp => {
                    *sample = to_i16(self.cancel(m, *sample as f32, false));
                }
                EchoState::Run => {
                    *sample = to_i16(self.cancel(m, *sample as f32, true));
                }
                EchoState::MicStartupWait => {}
            }
        }
    }

    fn reset(&mut self) {
        log::debug!(target: "Media/Echo", "reset, recalibrating");
        *self = Self::new(self.config.clone());
    }

    fn state(&self) -> EchoState {
        self.state
    }
}

impl std::fmt::Debug for FirEchoCanceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirEchoCanceller")
            .field("state", &self.state)
            .field("delay", &self.delay)
            .field("taps", &self.taps.len())
            .finish()
    }
}

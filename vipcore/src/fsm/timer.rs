//! Per-state dwell timers.

use crate::types::call::{CallFsmStatus, CallTimeParam};
use std::time::{Duration, Instant};

/// Phase of a call that has a maximum dwell time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DwellPhase {
    Alerting,
    Connecting,
    Connected,
    /// Local release sent, waiting for the peer to confirm.
    Closing,
}

impl DwellPhase {
    pub fn for_status(status: CallFsmStatus) -> Option<Self> {
        match status {
            CallFsmStatus::InAlerting | CallFsmStatus::OutAlerting => Some(Self::Alerting),
            CallFsmStatus::OutInitiated => Some(Self::Connecting),
            CallFsmStatus::Connected => Some(Self::Connected),
            CallFsmStatus::Idle | CallFsmStatus::Closed => None,
        }
    }

    pub fn limit(self, params: &CallTimeParam) -> Duration {
        match self {
            Self::Alerting => params.alerting,
            Self::Connecting => params.connecting,
            Self::Connected => params.connected,
            Self::Closing => params.closing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DwellTimer {
    params: CallTimeParam,
    phase: Option<DwellPhase>,
    deadline: Option<Instant>,
}

impl DwellTimer {
    pub fn new(params: CallTimeParam) -> Self {
        Self {
            params,
            phase: None,
            deadline: None,
        }
    }

    /// Starts timing `phase` from `now`. A zero limit leaves the timer disarmed.
    pub fn arm(&mut self, phase: DwellPhase, now: Instant) {
        let limit = phase.limit(&self.params);
        self.phase = Some(phase);
        self.deadline = (!limit.is_zero()).then(|| now + limit);
    }

    pub fn disarm(&mut self) {
        self.phase = None;
        self.deadline = None;
    }

    pub fn phase(&self) -> Option<DwellPhase> {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn params(&self) -> &CallTimeParam {
        &self.params
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_limit_never_expires() {
        let mut timer = DwellTimer::new(CallTimeParam::DISABLED);
        let now = Instant::now();
        timer.arm(DwellPhase::Connected, now);
        assert_eq!(timer.phase(), Some(DwellPhase::Connected));
        assert_eq!(timer.deadline(), None);
        assert!(!timer.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn expires_at_deadline() {
        let params = CallTimeParam {
            alerting: Duration::from_secs(30),
            ..CallTimeParam::DISABLED
        };
        let mut timer = DwellTimer::new(params);
        let now = Instant::now();
        timer.arm(DwellPhase::Alerting, now);
        assert!(!timer.is_expired(now + Duration::from_secs(29)));
        assert!(timer.is_expired(now + Duration::from_secs(30)));
        timer.disarm();
        assert!(!timer.is_expired(now + Duration::from_secs(31)));
    }

    #[test]
    fn phase_mapping() {
        assert_eq!(
            DwellPhase::for_status(CallFsmStatus::OutInitiated),
            Some(DwellPhase::Connecting)
        );
        assert_eq!(DwellPhase::for_status(CallFsmStatus::Closed), None);
    }
}

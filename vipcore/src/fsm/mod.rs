//! Per-call state machine.
//!
//! A [`CallFsm`] is created already alerting (inbound) or initiated
//! (outbound) and ends in `Closed` exactly once. Every status transition
//! produces a [`StatusChange`]; inputs received after `Closed` are ignored.

mod timer;

pub use timer::{DwellPhase, DwellTimer};

use crate::types::call::{
    CallDirection, CallFsmStatus, CallTimeParam, CallType, ConnError, DivertInfo, MediaRequest,
    OutDivertActionResult, ReleaseCause,
};
use crate::types::events::{Event, EventPayload, RtspEvent, StatusChange};
use crate::types::unit::{FsmKey, LogicalAddress, UnitCapability, UnitType};
use std::time::Instant;

/// Which status-change event a call reports through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsmFlavour {
    Vip,
    Rtsp,
}

impl FsmFlavour {
    pub fn for_unit_type(unit_type: UnitType) -> Self {
        if unit_type.uses_rtsp_fsm() {
            Self::Rtsp
        } else {
            Self::Vip
        }
    }
}

/// Inputs accepted by [`CallFsm::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmInput {
    OutAlerting,
    CapReport {
        capabilities: UnitCapability,
        answered: bool,
    },
    Connected,
    Released {
        cause: ReleaseCause,
    },
    Diverted {
        direction: CallDirection,
        address: LogicalAddress,
        result: OutDivertActionResult,
    },
    TimerExpired,
    ConnectionError {
        error: ConnError,
    },
    MediaRequest {
        request: MediaRequest,
    },
    Rtsp(RtspEvent),
    /// Local user accepted the incoming call.
    LocalAnswer,
    /// Local user hung up.
    LocalRelease {
        cause: ReleaseCause,
    },
}

impl FsmInput {
    /// Maps an inbound event payload to an FSM input. Payloads that do not
    /// drive an existing call (new calls, status changes, tunnel events)
    /// return `None`, as do firmware reports of a status the call can only
    /// be created in.
    pub fn from_payload(payload: &EventPayload) -> Option<Self> {
        Some(match payload {
            EventPayload::OutAlerting => Self::OutAlerting,
            EventPayload::CapReport {
                capabilities,
                answered,
            } => Self::CapReport {
                capabilities: *capabilities,
                answered: *answered,
            },
            EventPayload::Connected => Self::Connected,
            EventPayload::VipCallRelease { cause } => Self::Released { cause: *cause },
            EventPayload::VipDiverted {
                direction,
                address,
                result,
            } => Self::Diverted {
                direction: *direction,
                address: address.clone(),
                result: *result,
            },
            EventPayload::TimerExpired => Self::TimerExpired,
            EventPayload::ConnectionError { error } => Self::ConnectionError { error: *error },
            EventPayload::HandleMediaReq { request } => Self::MediaRequest { request: *request },
            EventPayload::RtspFsmEvent { event } => Self::Rtsp(*event),
            EventPayload::UnitStatusReport { status, cause } => match status {
                CallFsmStatus::Closed => Self::Released {
                    cause: cause.unwrap_or(ReleaseCause::Unknown),
                },
                CallFsmStatus::Connected => Self::Connected,
                CallFsmStatus::OutAlerting => Self::OutAlerting,
                CallFsmStatus::Idle | CallFsmStatus::InAlerting | CallFsmStatus::OutInitiated => {
                    return None;
                }
            },
            EventPayload::IncomingCall { .. }
            | EventPayload::TunnelOpened
            | EventPayload::TunnelClosed { .. }
            | EventPayload::CallFsmStatusChange(_)
            | EventPayload::RtspFsmStatusChange(_) => return None,
        })
    }
}

/// Side effects requested by the FSM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsmOutput {
    /// Publish this status change on the bus.
    StatusChange(StatusChange),
    /// Forward a media control request to the media pipeline.
    Media(MediaRequest),
    /// The media path reported a failure and should be renegotiated.
    Renegotiate(ConnError),
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Parameters describing a new call.
#[derive(Debug, Clone)]
pub struct CallSetup {
    pub call_type: CallType,
    pub main_address: LogicalAddress,
    pub sub_address: LogicalAddress,
    pub capabilities: UnitCapability,
    pub times: CallTimeParam,
    pub flavour: FsmFlavour,
}

#[derive(Debug, Clone)]
pub struct CallFsm {
    key: FsmKey,
    flavour: FsmFlavour,
    status: CallFsmStatus,
    direction: CallDirection,
    call_type: CallType,
    main_address: LogicalAddress,
    sub_address: LogicalAddress,
    capabilities: UnitCapability,
    answer_pending: bool,
    /// Cause of a local release that is waiting for peer confirmation.
    closing: Option<ReleaseCause>,
    pending_divert: Option<DivertInfo>,
    release_cause: Option<ReleaseCause>,
    timer: DwellTimer,
}

impl CallFsm {
    /// Creates an inbound call, moving straight to `InAlerting`.
    pub fn new_incoming(key: FsmKey, setup: CallSetup, now: Instant) -> (Self, StatusChange) {
        Self::create(key, setup, CallDirection::In, CallFsmStatus::InAlerting, now)
    }

    /// Creates an outbound call, moving straight to `OutInitiated`.
    pub fn new_outgoing(key: FsmKey, setup: CallSetup, now: Instant) -> (Self, StatusChange) {
        Self::create(key, setup, CallDirection::Out, CallFsmStatus::OutInitiated, now)
    }

    fn create(
        key: FsmKey,
        setup: CallSetup,
        direction: CallDirection,
        initial: CallFsmStatus,
        now: Instant,
    ) -> (Self, StatusChange) {
        let mut fsm = Self {
            key,
            flavour: setup.flavour,
            status: CallFsmStatus::Idle,
            direction,
            call_type: setup.call_type,
            main_address: setup.main_address,
            sub_address: setup.sub_address,
            capabilities: setup.capabilities,
            answer_pending: false,
            closing: None,
            pending_divert: None,
            release_cause: None,
            timer: DwellTimer::new(setup.times),
        };
        let change = fsm.transition(initial, None, None, now);
        (fsm, change)
    }

    pub fn key(&self) -> FsmKey {
        self.key
    }

    pub fn status(&self) -> CallFsmStatus {
        self.status
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn call_type(&self) -> CallType {
        self.call_type
    }

    pub fn capabilities(&self) -> UnitCapability {
        self.capabilities
    }

    pub fn main_address(&self) -> &LogicalAddress {
        &self.main_address
    }

    pub fn release_cause(&self) -> Option<ReleaseCause> {
        self.release_cause
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// A local release was sent and the peer has not confirmed yet.
    pub fn is_closing(&self) -> bool {
        self.closing.is_some()
    }

    pub fn answer_pending(&self) -> bool {
        self.answer_pending
    }

    pub fn pending_divert(&self) -> Option<&DivertInfo> {
        self.pending_divert.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_closed() && self.timer.is_expired(now)
    }

    /// Wraps a status change into the bus event for this call's flavour.
    pub fn status_event(&self, change: StatusChange) -> Event {
        let payload = match self.flavour {
            FsmFlavour::Vip => EventPayload::CallFsmStatusChange(change),
            FsmFlavour::Rtsp => EventPayload::RtspFsmStatusChange(change),
        };
        Event::fsm(self.key, payload)
    }

    pub fn handle(
        &mut self,
        input: FsmInput,
        now: Instant,
    ) -> Result<Vec<FsmOutput>, InvalidTransition> {
        if self.is_closed() {
            log::trace!(target: "Fsm", "{} already closed, ignoring {:?}", self.key, input);
            return Ok(Vec::new());
        }

        use CallFsmStatus as S;
        let outputs = match (self.status, input) {
            (S::OutInitiated, FsmInput::OutAlerting) => {
                vec![self.change_to(S::OutAlerting, now)]
            }
            (S::OutAlerting, FsmInput::OutAlerting) => Vec::new(),

            (
                S::OutInitiated | S::OutAlerting,
                FsmInput::CapReport {
                    capabilities,
                    answered: true,
                },
            ) => {
                self.capabilities = capabilities;
                vec![self.change_to(S::Connected, now)]
            }
            (
                S::InAlerting | S::OutInitiated | S::OutAlerting | S::Connected,
                FsmInput::CapReport { capabilities, .. },
            ) => {
                self.capabilities = capabilities;
                Vec::new()
            }

            (S::OutInitiated | S::OutAlerting, FsmInput::Connected) => {
                vec![self.change_to(S::Connected, now)]
            }
            (S::InAlerting, FsmInput::Connected) if self.answer_pending => {
                vec![self.change_to(S::Connected, now)]
            }
            (S::Connected, FsmInput::Connected) => Vec::new(),

            (S::InAlerting, FsmInput::LocalAnswer) => {
                self.answer_pending = true;
                Vec::new()
            }

            (_, FsmInput::Released { cause }) => vec![self.close(cause, None, now)],

            (_, FsmInput::LocalRelease { cause }) => {
                if self.closing.is_some() {
                    Vec::new()
                } else if self.timer.params().closing.is_zero() {
                    vec![self.close(cause, None, now)]
                } else {
                    self.closing = Some(cause);
                    self.timer.arm(DwellPhase::Closing, now);
                    Vec::new()
                }
            }

            (
                _,
                FsmInput::Diverted {
                    direction,
                    address,
                    result,
                },
            ) => {
                let info = DivertInfo {
                    direction,
                    address,
                    result,
                };
                match result {
                    OutDivertActionResult::Completed => {
                        self.pending_divert = None;
                        vec![self.close(ReleaseCause::Diverted, Some(info), now)]
                    }
                    OutDivertActionResult::Failed => {
                        self.pending_divert = None;
                        vec![self.notify(Some(info))]
                    }
                    OutDivertActionResult::None => {
                        self.pending_divert = Some(info.clone());
                        vec![self.notify(Some(info))]
                    }
                }
            }

            (_, FsmInput::TimerExpired) => {
                // A pending local release keeps its own cause.
                let cause = self.closing.unwrap_or(ReleaseCause::Timeout);
                vec![self.close(cause, None, now)]
            }

            (_, FsmInput::ConnectionError { error }) => vec![FsmOutput::Renegotiate(error)],
            (_, FsmInput::MediaRequest { request }) => vec![FsmOutput::Media(request)],

            (S::OutInitiated, FsmInput::Rtsp(RtspEvent::Ready)) => {
                vec![self.change_to(S::OutAlerting, now)]
            }
            (S::OutInitiated | S::OutAlerting | S::InAlerting, FsmInput::Rtsp(RtspEvent::Playing)) => {
                vec![self.change_to(S::Connected, now)]
            }
            (S::OutAlerting | S::Connected, FsmInput::Rtsp(RtspEvent::Ready))
            | (S::Connected, FsmInput::Rtsp(RtspEvent::Playing)) => Vec::new(),
            (_, FsmInput::Rtsp(RtspEvent::Teardown { cause })) => {
                vec![self.close(cause, None, now)]
            }
            (_, FsmInput::Rtsp(RtspEvent::Error)) => {
                vec![self.close(ReleaseCause::MediaError, None, now)]
            }

            (current, input) => {
                return Err(InvalidTransition {
                    current_state: format!("{current:?}"),
                    attempted: format!("{input:?}"),
                });
            }
        };
        Ok(outputs)
    }

    fn change_to(&mut self, status: CallFsmStatus, now: Instant) -> FsmOutput {
        FsmOutput::StatusChange(self.transition(status, None, None, now))
    }

    fn close(
        &mut self,
        cause: ReleaseCause,
        divert: Option<DivertInfo>,
        now: Instant,
    ) -> FsmOutput {
        self.release_cause = Some(cause);
        self.closing = None;
        self.answer_pending = false;
        FsmOutput::StatusChange(self.transition(CallFsmStatus::Closed, Some(cause), divert, now))
    }

    /// Status change that keeps the current status, used for divert progress.
    fn notify(&self, divert: Option<DivertInfo>) -> FsmOutput {
        FsmOutput::StatusChange(self.snapshot(self.status, None, divert))
    }

    fn transition(
        &mut self,
        status: CallFsmStatus,
        cause: Option<ReleaseCause>,
        divert: Option<DivertInfo>,
        now: Instant,
    ) -> StatusChange {
        let change = self.snapshot(status, cause, divert);
        log::debug!(target: "Fsm", "{}: {} -> {}", self.key, self.status, status);
        self.status = status;
        match DwellPhase::for_status(status) {
            Some(phase) => self.timer.arm(phase, now),
            None => self.timer.disarm(),
        }
        change
    }

    fn snapshot(
        &self,
        status: CallFsmStatus,
        cause: Option<ReleaseCause>,
        divert: Option<DivertInfo>,
    ) -> StatusChange {
        StatusChange {
            status,
            previous: self.status,
            direction: self.direction,
            call_type: self.call_type,
            capabilities: self.capabilities,
            main_address: self.main_address.clone(),
            sub_address: self.sub_address.clone(),
            cause,
            divert,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::unit::{FsmId, SysId, UnitId, UnitKey};
    use std::time::Duration;

    fn key() -> FsmKey {
        UnitKey::new(SysId(1), UnitId(1)).fsm(FsmId(1))
    }

    fn setup(times: CallTimeParam) -> CallSetup {
        CallSetup {
            call_type: CallType::AudioVideo,
            main_address: LogicalAddress::new("00010002"),
            sub_address: LogicalAddress::default(),
            capabilities: UnitCapability::NONE,
            times,
            flavour: FsmFlavour::Vip,
        }
    }

    fn statuses(outputs: &[FsmOutput]) -> Vec<CallFsmStatus> {
        outputs
            .iter()
            .filter_map(|o| match o {
                FsmOutput::StatusChange(c) => Some(c.status),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn outgoing_flow() {
        let now = Instant::now();
        let (mut fsm, first) = CallFsm::new_outgoing(key(), setup(CallTimeParam::default()), now);
        assert_eq!(first.previous, CallFsmStatus::Idle);
        assert_eq!(first.status, CallFsmStatus::OutInitiated);

        let out = fsm.handle(FsmInput::OutAlerting, now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::OutAlerting]);

        let caps = UnitCapability::AUDIO_IN | UnitCapability::DOOR_OPEN;
        let out = fsm
            .handle(
                FsmInput::CapReport {
                    capabilities: caps,
                    answered: true,
                },
                now,
            )
            .unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::Connected]);
        assert_eq!(fsm.capabilities(), caps);

        let out = fsm
            .handle(
                FsmInput::Released {
                    cause: ReleaseCause::Normal,
                },
                now,
            )
            .unwrap();
        match &out[..] {
            [FsmOutput::StatusChange(change)] => {
                assert!(change.is_terminal());
                assert_eq!(change.cause, Some(ReleaseCause::Normal));
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn unanswered_cap_report_only_records() {
        let now = Instant::now();
        let (mut fsm, _) = CallFsm::new_incoming(key(), setup(CallTimeParam::default()), now);
        let out = fsm
            .handle(
                FsmInput::CapReport {
                    capabilities: UnitCapability::VIDEO_OUT,
                    answered: false,
                },
                now,
            )
            .unwrap();
        assert!(out.is_empty());
        assert_eq!(fsm.status(), CallFsmStatus::InAlerting);
        assert!(fsm.capabilities().contains(UnitCapability::VIDEO_OUT));
    }

    #[test]
    fn incoming_needs_local_answer_before_connected() {
        let now = Instant::now();
        let (mut fsm, _) = CallFsm::new_incoming(key(), setup(CallTimeParam::default()), now);
        assert!(fsm.handle(FsmInput::Connected, now).is_err());
        assert!(fsm.handle(FsmInput::LocalAnswer, now).unwrap().is_empty());
        assert!(fsm.answer_pending());
        assert_eq!(fsm.status(), CallFsmStatus::InAlerting);
        let out = fsm.handle(FsmInput::Connected, now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::Connected]);
    }

    #[test]
    fn closed_is_reached_once() {
        let now = Instant::now();
        let (mut fsm, _) = CallFsm::new_outgoing(key(), setup(CallTimeParam::default()), now);
        let inputs = [
            FsmInput::Released {
                cause: ReleaseCause::UserBusy,
            },
            FsmInput::Released {
                cause: ReleaseCause::Normal,
            },
            FsmInput::TimerExpired,
            FsmInput::Connected,
        ];
        let mut terminal = 0;
        for input in inputs {
            let out = fsm.handle(input, now).unwrap();
            terminal += statuses(&out)
                .iter()
                .filter(|s| **s == CallFsmStatus::Closed)
                .count();
        }
        assert_eq!(terminal, 1);
        assert_eq!(fsm.release_cause(), Some(ReleaseCause::UserBusy));
    }

    #[test]
    fn timer_expiry_closes_with_timeout() {
        let now = Instant::now();
        let times = CallTimeParam {
            alerting: Duration::from_secs(20),
            ..CallTimeParam::DISABLED
        };
        let (mut fsm, _) = CallFsm::new_incoming(key(), setup(times), now);
        assert!(!fsm.is_expired(now + Duration::from_secs(19)));
        assert!(fsm.is_expired(now + Duration::from_secs(20)));
        fsm.handle(FsmInput::TimerExpired, now).unwrap();
        assert_eq!(fsm.release_cause(), Some(ReleaseCause::Timeout));
        assert!(!fsm.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn local_release_waits_for_confirmation() {
        let now = Instant::now();
        let times = CallTimeParam {
            closing: Duration::from_secs(5),
            ..CallTimeParam::DISABLED
        };
        let (mut fsm, _) = CallFsm::new_outgoing(key(), setup(times), now);
        let out = fsm
            .handle(
                FsmInput::LocalRelease {
                    cause: ReleaseCause::Normal,
                },
                now,
            )
            .unwrap();
        assert!(out.is_empty());
        assert!(fsm.is_closing());
        assert!(fsm.is_expired(now + Duration::from_secs(5)));

        let out = fsm.handle(FsmInput::TimerExpired, now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::Closed]);
        assert_eq!(fsm.release_cause(), Some(ReleaseCause::Normal));
    }

    #[test]
    fn local_release_without_closing_timer_closes_at_once() {
        let now = Instant::now();
        let (mut fsm, _) = CallFsm::new_outgoing(key(), setup(CallTimeParam::DISABLED), now);
        let out = fsm
            .handle(
                FsmInput::LocalRelease {
                    cause: ReleaseCause::Cancelled,
                },
                now,
            )
            .unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::Closed]);
    }

    #[test]
    fn divert_progress() {
        let now = Instant::now();
        let (mut fsm, _) = CallFsm::new_outgoing(key(), setup(CallTimeParam::default()), now);
        let divert = |result| FsmInput::Diverted {
            direction: CallDirection::Out,
            address: LogicalAddress::new("00020001"),
            result,
        };

        let out = fsm.handle(divert(OutDivertActionResult::None), now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::OutInitiated]);
        assert!(fsm.pending_divert().is_some());

        let out = fsm.handle(divert(OutDivertActionResult::Failed), now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::OutInitiated]);
        assert!(fsm.pending_divert().is_none());

        let out = fsm
            .handle(divert(OutDivertActionResult::Completed), now)
            .unwrap();
        match &out[..] {
            [FsmOutput::StatusChange(change)] => {
                assert_eq!(change.status, CallFsmStatus::Closed);
                assert_eq!(change.cause, Some(ReleaseCause::Diverted));
                assert_eq!(
                    change.divert.as_ref().map(|d| d.result),
                    Some(OutDivertActionResult::Completed)
                );
            }
            other => panic!("unexpected outputs {other:?}"),
        }
    }

    #[test]
    fn media_control_does_not_change_status() {
        let now = Instant::now();
        let (mut fsm, _) = CallFsm::new_outgoing(key(), setup(CallTimeParam::default()), now);
        let out = fsm
            .handle(
                FsmInput::MediaRequest {
                    request: MediaRequest::KeyFrame,
                },
                now,
            )
            .unwrap();
        assert_eq!(out, vec![FsmOutput::Media(MediaRequest::KeyFrame)]);
        let out = fsm
            .handle(
                FsmInput::ConnectionError {
                    error: ConnError::UnexpectedMsg,
                },
                now,
            )
            .unwrap();
        assert_eq!(out, vec![FsmOutput::Renegotiate(ConnError::UnexpectedMsg)]);
        assert_eq!(fsm.status(), CallFsmStatus::OutInitiated);
    }

    #[test]
    fn rtsp_flow_uses_rtsp_status_events() {
        let now = Instant::now();
        let mut s = setup(CallTimeParam::default());
        s.flavour = FsmFlavour::Rtsp;
        let (mut fsm, first) = CallFsm::new_outgoing(key(), s, now);
        assert!(matches!(
            fsm.status_event(first).payload,
            EventPayload::RtspFsmStatusChange(_)
        ));
        let out = fsm.handle(FsmInput::Rtsp(RtspEvent::Ready), now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::OutAlerting]);
        let out = fsm.handle(FsmInput::Rtsp(RtspEvent::Playing), now).unwrap();
        assert_eq!(statuses(&out), vec![CallFsmStatus::Connected]);
        fsm.handle(FsmInput::Rtsp(RtspEvent::Error), now).unwrap();
        assert_eq!(fsm.release_cause(), Some(ReleaseCause::MediaError));
    }
}

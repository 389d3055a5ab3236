use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::unit::{LogicalAddress, UnitType};

/// Status of a call FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallFsmStatus {
    /// Transient construction state, never reported upward.
    Idle,
    /// Incoming call ringing locally.
    #[serde(alias = "waitIn")]
    InAlerting,
    /// Outgoing call requested, waiting for the peer.
    #[serde(alias = "waitOut")]
    OutInitiated,
    /// Outgoing call ringing at the peer.
    OutAlerting,
    Connected,
    Closed,
}

impl CallFsmStatus {
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    pub const fn is_alerting(&self) -> bool {
        matches!(self, Self::InAlerting | Self::OutAlerting)
    }
}

impl fmt::Display for CallFsmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::InAlerting => "inAlerting",
            Self::OutInitiated => "outInitiated",
            Self::OutAlerting => "outAlerting",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallType {
    #[default]
    Audio,
    AudioVideo,
    /// Video only, e.g. a camera preview.
    VideoOnly,
    /// Monitoring session started locally without ringing the peer.
    Monitor,
}

impl CallType {
    pub const fn has_video(&self) -> bool {
        matches!(self, Self::AudioVideo | Self::VideoOnly | Self::Monitor)
    }

    pub const fn has_audio(&self) -> bool {
        matches!(self, Self::Audio | Self::AudioVideo)
    }
}

/// Why a call ended. Passed through unchanged from the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReleaseCause {
    Normal,
    UserBusy,
    Rejected,
    Diverted,
    DeviceNotFound,
    SystemBusy,
    Timeout,
    MalformedMessage,
    CtpDisconnected,
    NoAnswer,
    Cancelled,
    AnsweredElsewhere,
    NotAuthorized,
    MediaError,
    TunnelError,
    #[serde(other)]
    Unknown,
}

impl ReleaseCause {
    pub const ALL: [ReleaseCause; 16] = [
        Self::Normal,
        Self::UserBusy,
        Self::Rejected,
        Self::Diverted,
        Self::DeviceNotFound,
        Self::SystemBusy,
        Self::Timeout,
        Self::MalformedMessage,
        Self::CtpDisconnected,
        Self::NoAnswer,
        Self::Cancelled,
        Self::AnsweredElsewhere,
        Self::NotAuthorized,
        Self::MediaError,
        Self::TunnelError,
        Self::Unknown,
    ];

    /// Numeric code used by the native engine.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::UserBusy => 1,
            Self::Rejected => 2,
            Self::Diverted => 3,
            Self::DeviceNotFound => 4,
            Self::SystemBusy => 5,
            Self::Timeout => 6,
            Self::MalformedMessage => 7,
            Self::CtpDisconnected => 8,
            Self::NoAnswer => 9,
            Self::Cancelled => 10,
            Self::AnsweredElsewhere => 11,
            Self::NotAuthorized => 12,
            Self::MediaError => 13,
            Self::TunnelError => 14,
            Self::Unknown => 15,
        }
    }

    pub fn from_code(code: i32) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|cause| cause.code() == code)
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for ReleaseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Outcome of diverting an outgoing call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutDivertActionResult {
    #[default]
    None,
    Failed,
    Completed,
}

/// Divert information attached to a status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivertInfo {
    pub direction: CallDirection,
    pub address: LogicalAddress,
    pub result: OutDivertActionResult,
}

/// Transport-level failure reported on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnError {
    UnexpectedMsg,
    CtpDisconnected,
}

impl fmt::Display for ConnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedMsg => f.write_str("unexpected message"),
            Self::CtpDisconnected => f.write_str("ctp disconnected"),
        }
    }
}

/// Media-path control requests that do not change call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MediaRequest {
    KeyFrame,
    StartAudio,
    StopAudio,
    StartVideo,
    StopVideo,
}

/// Maximum time a call may dwell in each phase. `Duration::ZERO` disables a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallTimeParam {
    pub alerting: Duration,
    pub connecting: Duration,
    pub connected: Duration,
    pub closing: Duration,
}

impl CallTimeParam {
    pub const DISABLED: Self = Self {
        alerting: Duration::ZERO,
        connecting: Duration::ZERO,
        connected: Duration::ZERO,
        closing: Duration::ZERO,
    };

    pub const fn for_unit_type(unit_type: UnitType) -> Self {
        match unit_type {
            UnitType::Vip => Self {
                alerting: Duration::from_secs(45),
                connecting: Duration::from_secs(15),
                connected: Duration::from_secs(120),
                closing: Duration::from_secs(5),
            },
            UnitType::Safe => Self {
                alerting: Duration::from_secs(60),
                connecting: Duration::from_secs(15),
                connected: Duration::from_secs(300),
                closing: Duration::from_secs(5),
            },
            UnitType::Tvcc | UnitType::Rtsp | UnitType::Playback => Self {
                alerting: Duration::from_secs(10),
                connecting: Duration::from_secs(10),
                connected: Duration::ZERO,
                closing: Duration::from_secs(3),
            },
        }
    }
}

impl Default for CallTimeParam {
    fn default() -> Self {
        Self::for_unit_type(UnitType::Vip)
    }
}

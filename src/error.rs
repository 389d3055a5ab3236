//! Error types for the runtime crate.
//!
//! Call progress never fails through these types: every call ends with a
//! status change carrying a [`vipcore::types::ReleaseCause`]. These errors
//! cover connection-global failures, immediate engine rejections, tunnel
//! setup and local media operations.

use thiserror::Error;
use vipcore::media::UnalignedChunk;
use vipcore::types::ConnError;

pub use crate::framing::FrameError;
pub use crate::tunnel::stun::StunError;
pub use vipcore::fsm::InvalidTransition;
pub use vipcore::p2p::ParamsError;

/// Native engine accepted the request.
pub const ENGINE_OK: i32 = 0;
/// The call was already closed; nothing was done.
pub const ENGINE_ALREADY_CLOSED: i32 = 1;

pub type EngineResult<T> = Result<T, EngineError>;

/// Connection-level failures reported through `CgCallback::on_error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CmgError {
    #[error("{0}")]
    Generic(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("activation code rejected")]
    ActivationCode,
}

/// Immediate rejection from an engine call, mapped from the native
/// engine's negative return codes.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq, Hash)]
pub enum EngineError {
    #[error("native engine error")]
    Generic,
    #[error("engine not started")]
    NotStarted,
    #[error("unknown system")]
    UnknownSystem,
    #[error("unknown unit")]
    UnknownUnit,
    #[error("unknown call")]
    UnknownFsm,
    #[error("operation not valid in the current call state")]
    InvalidState,
    #[error("engine busy")]
    Busy,
    #[error("transport unavailable")]
    Transport,
    #[error("operation not supported by the unit")]
    Unsupported,
    #[error("native engine returned {0}")]
    Native(i32),
}

impl EngineError {
    /// Maps a native return code. Non-negative codes are not errors.
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            c if c >= 0 => return None,
            -1 => Self::Generic,
            -2 => Self::NotStarted,
            -3 => Self::UnknownSystem,
            -4 => Self::UnknownUnit,
            -5 => Self::UnknownFsm,
            -6 => Self::InvalidState,
            -7 => Self::Busy,
            -8 => Self::Transport,
            -9 => Self::Unsupported,
            other => Self::Native(other),
        };
        Some(err)
    }

    pub fn code(self) -> i32 {
        match self {
            Self::Generic => -1,
            Self::NotStarted => -2,
            Self::UnknownSystem => -3,
            Self::UnknownUnit => -4,
            Self::UnknownFsm => -5,
            Self::InvalidState => -6,
            Self::Busy => -7,
            Self::Transport => -8,
            Self::Unsupported => -9,
            Self::Native(code) => code,
        }
    }

    /// Turns a native return code into a result carrying the success code.
    pub fn check(code: i32) -> EngineResult<i32> {
        match Self::from_code(code) {
            Some(err) => Err(err),
            None => Ok(code),
        }
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel setup timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    #[error("SDP exchange failed: {0}")]
    Signaling(String),

    #[error("rendezvous rejected the activation code")]
    Unauthorized,

    #[error("no usable candidates after filtering")]
    NoCandidates,

    #[error("negotiation failed: {0}")]
    NegotiationFailed(ConnError),

    #[error("invalid parameters: {0}")]
    InvalidParameters(#[from] ParamsError),

    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("audio chunk of {0} samples is not frame aligned")]
    UnalignedChunk(usize),

    #[error("a recording is already active on this unit")]
    RecordingActive,

    #[error("no recording is active on this unit")]
    NoRecording,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<UnalignedChunk> for MediaError {
    fn from(err: UnalignedChunk) -> Self {
        Self::UnalignedChunk(err.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_codes_map_both_ways() {
        for code in -9..=-1 {
            let err = EngineError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert_eq!(EngineError::from_code(-42), Some(EngineError::Native(-42)));
        assert_eq!(EngineError::Native(-42).code(), -42);
    }

    #[test]
    fn non_negative_codes_are_success() {
        assert_eq!(EngineError::from_code(ENGINE_OK), None);
        assert_eq!(EngineError::from_code(ENGINE_ALREADY_CLOSED), None);
        assert_eq!(EngineError::check(ENGINE_ALREADY_CLOSED), Ok(1));
        assert_eq!(EngineError::check(-7), Err(EngineError::Busy));
    }
}

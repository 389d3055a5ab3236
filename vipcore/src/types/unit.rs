//! Addressing for systems, units and call FSM instances.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub const fn new(value: u32) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u32> for $name {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Identifier of a call subsystem, one per active backend connection.
    SysId
);
define_id!(
    /// Identifier of a unit inside a system.
    UnitId
);
define_id!(
    /// Identifier of a call FSM instance, scoped to a unit.
    FsmId
);

/// `(sysId, unitId)` pair addressing a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub sys_id: SysId,
    pub unit_id: UnitId,
}

impl UnitKey {
    pub const fn new(sys_id: SysId, unit_id: UnitId) -> Self {
        Self { sys_id, unit_id }
    }

    pub const fn fsm(self, fsm_id: FsmId) -> FsmKey {
        FsmKey {
            sys_id: self.sys_id,
            unit_id: self.unit_id,
            fsm_id,
        }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sys_id, self.unit_id)
    }
}

/// `(sysId, unitId, fsmId)` triple addressing one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FsmKey {
    pub sys_id: SysId,
    pub unit_id: UnitId,
    pub fsm_id: FsmId,
}

impl FsmKey {
    pub const fn unit(self) -> UnitKey {
        UnitKey {
            sys_id: self.sys_id,
            unit_id: self.unit_id,
        }
    }
}

impl fmt::Display for FsmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.sys_id, self.unit_id, self.fsm_id)
    }
}

/// Kind of endpoint a unit represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnitType {
    /// VIP intercom (door station, indoor panel).
    Vip,
    /// Safe / alarm panel.
    Safe,
    /// TVCC camera.
    Tvcc,
    /// Generic RTSP stream.
    Rtsp,
    /// Recorded footage playback.
    Playback,
}

impl UnitType {
    pub const ALL: [UnitType; 5] = [
        Self::Vip,
        Self::Safe,
        Self::Tvcc,
        Self::Rtsp,
        Self::Playback,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Vip => "vip",
            Self::Safe => "safe",
            Self::Tvcc => "tvcc",
            Self::Rtsp => "rtsp",
            Self::Playback => "playback",
        }
    }

    /// Units whose call progress is reported with RTSP status events.
    pub const fn uses_rtsp_fsm(&self) -> bool {
        matches!(self, Self::Rtsp | Self::Tvcc | Self::Playback)
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! define_flags {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $bit:expr),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: Self = Self(0);
            $($(#[$fmeta])* pub const $flag: Self = Self(1 << $bit);)*

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self {
                self.union(rhs)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) {
                self.0 |= rhs.0;
            }
        }
    };
}

define_flags!(
    /// Flags supplied when a unit is created.
    UnitFlags {
        AUDIO = 0,
        VIDEO = 1,
        /// Decode video in software rather than with the platform decoder.
        SOFTWARE_DECODE = 2,
        /// Unit may receive calls without a preceding push.
        AUTO_ANSWER = 3,
        RECORDING = 4,
    }
);

define_flags!(
    /// Capabilities a peer reports during call setup.
    UnitCapability {
        AUDIO_IN = 0,
        AUDIO_OUT = 1,
        VIDEO_IN = 2,
        VIDEO_OUT = 3,
        DOOR_OPEN = 4,
        ACTUATOR = 5,
        DIVERT = 6,
        VIDEO_SOURCE_SWITCH = 7,
    }
);

/// Logical address of a peer in the VIP addressing scheme (e.g. `"00010002"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalAddress(pub String);

impl LogicalAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LogicalAddress {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

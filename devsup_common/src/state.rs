//! Device lifecycle states.
//!
//! The discriminant order is also the priority order used when a node
//! aggregates the states of its subtree: the highest-priority state wins,
//! so a single faulty child makes the whole subtree report `Fault`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational state of a device.
///
/// Exactly one state is active per state machine. `Unknown` is held until the
/// machine settles, `Fault` is a trap state left only through recovery.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum State {
    /// Initial state before any transition completes.
    #[default]
    Unknown = 0,
    /// Device powered off.
    Off = 1,
    /// Transient: powering off (also used while recovering from fault).
    SwitchingOff = 2,
    /// Transient: powering on.
    Initializing = 3,
    /// Device powered on and idle.
    On = 4,
    /// Transient: ending acquisition.
    Stopping = 5,
    /// Transient: beginning acquisition.
    Starting = 6,
    /// Device acquiring / operating.
    Running = 7,
    /// Driver-reported failure; requires explicit recovery.
    Fault = 8,
}

impl State {
    /// Every state, in priority order.
    pub const ALL: [State; 9] = [
        State::Unknown,
        State::Off,
        State::SwitchingOff,
        State::Initializing,
        State::On,
        State::Stopping,
        State::Starting,
        State::Running,
        State::Fault,
    ];

    /// Convert from raw `u8`. Returns `None` for invalid values.
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Off),
            2 => Some(Self::SwitchingOff),
            3 => Some(Self::Initializing),
            4 => Some(Self::On),
            5 => Some(Self::Stopping),
            6 => Some(Self::Starting),
            7 => Some(Self::Running),
            8 => Some(Self::Fault),
            _ => None,
        }
    }

    /// Convert from the integer carried by the `setState`/`getState` channels.
    #[inline]
    pub fn from_i32(value: i32) -> Option<Self> {
        u8::try_from(value).ok().and_then(Self::from_u8)
    }

    /// Upper-case label, as exposed in the channel enumeration.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Off => "OFF",
            Self::SwitchingOff => "SWITCHING_OFF",
            Self::Initializing => "INITIALIZING",
            Self::On => "ON",
            Self::Stopping => "STOPPING",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Fault => "FAULT",
        }
    }

    /// True for the intermediate states entered while a callback runs.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::SwitchingOff | Self::Initializing | Self::Stopping | Self::Starting
        )
    }

    /// Labels of every state, indexed by discriminant.
    pub fn labels() -> Vec<String> {
        Self::ALL.iter().map(|s| s.name().to_string()).collect()
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

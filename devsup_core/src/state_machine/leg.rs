//! The fixed transition table.
//!
//! ```text
//!            settle                 switchOn
//!  UNKNOWN ─────────► OFF ──► INITIALIZING ──► ON ──► STARTING ──► RUNNING
//!                      ▲                        │ ▲       start        │
//!                      │       switchOff        │ │        stop        │
//!                      └──── SWITCHING_OFF ◄────┘ └──── STOPPING ◄─────┘
//!                      ▲
//!                      │  recover
//!   FAULT ─────────────┘ (via SWITCHING_OFF)      any ──► FAULT
//! ```

use devsup_common::state::State;

/// A callback-backed leg: source, transient and destination state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Leg {
    /// `OFF → INITIALIZING → ON`
    SwitchOn = 0,
    /// `ON → SWITCHING_OFF → OFF`
    SwitchOff = 1,
    /// `ON → STARTING → RUNNING`
    Start = 2,
    /// `RUNNING → STOPPING → ON`
    Stop = 3,
    /// `FAULT → SWITCHING_OFF → OFF`
    Recover = 4,
}

impl Leg {
    /// Every leg.
    pub const ALL: [Leg; 5] = [
        Leg::SwitchOn,
        Leg::SwitchOff,
        Leg::Start,
        Leg::Stop,
        Leg::Recover,
    ];

    /// State the leg starts from.
    pub const fn source(self) -> State {
        match self {
            Self::SwitchOn => State::Off,
            Self::SwitchOff | Self::Start => State::On,
            Self::Stop => State::Running,
            Self::Recover => State::Fault,
        }
    }

    /// State observable while the callback runs.
    pub const fn transient(self) -> State {
        match self {
            Self::SwitchOn => State::Initializing,
            Self::SwitchOff | Self::Recover => State::SwitchingOff,
            Self::Start => State::Starting,
            Self::Stop => State::Stopping,
        }
    }

    /// State reached when the callback succeeds.
    pub const fn destination(self) -> State {
        match self {
            Self::SwitchOn | Self::Stop => State::On,
            Self::SwitchOff | Self::Recover => State::Off,
            Self::Start => State::Running,
        }
    }

    /// Command name of the leg.
    pub const fn name(self) -> &'static str {
        match self {
            Self::SwitchOn => "switchOn",
            Self::SwitchOff => "switchOff",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Recover => "recover",
        }
    }

    /// Leg leaving `from` that a request for `to` selects. A request may name
    /// the transient or the destination state.
    pub fn resolve(from: State, to: State) -> Option<Leg> {
        Self::ALL
            .into_iter()
            .find(|leg| leg.source() == from && (leg.transient() == to || leg.destination() == to))
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Where a leg settles when its callback fails but the rollback hook succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RollbackTarget {
    /// Back to the state the leg started from.
    #[default]
    Source,
    /// Forward to the leg's destination.
    Destination,
}

impl RollbackTarget {
    /// Concrete state for `leg`.
    pub const fn state_for(self, leg: Leg) -> State {
        match self {
            Self::Source => leg.source(),
            Self::Destination => leg.destination(),
        }
    }
}

/// Classified edge of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Edge {
    /// `UNKNOWN → OFF`, no callback.
    Settle,
    /// `any → FAULT`, no callback.
    Fault,
    /// Callback-backed leg.
    Leg(Leg),
}

pub(crate) fn classify(from: State, to: State) -> Option<Edge> {
    if to == State::Fault {
        return (from != State::Fault).then_some(Edge::Fault);
    }
    if from == State::Unknown && to == State::Off {
        return Some(Edge::Settle);
    }
    Leg::resolve(from, to).map(Edge::Leg)
}

/// States that may be requested from `state`.
pub fn legal_transitions_from(state: State) -> Vec<State> {
    State::ALL
        .into_iter()
        .filter(|to| classify(state, *to).is_some())
        .collect()
}

//! Timestamps attached to every channel value.
//!
//! [`Timestamp`] counts from the UNIX epoch. Control systems commonly use an
//! unsigned 32-bit seconds counter starting at 1990-01-01 ([`EpicsTime`]);
//! conversion in either direction fails with [`TimeConversionError`] when the
//! instant cannot be represented.

use crate::error::TimeConversionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Seconds between 1970-01-01 and 1990-01-01.
pub const EPICS_EPOCH_OFFSET_SECS: i64 = 631_152_000;

/// Instant relative to the UNIX epoch, nanosecond resolution.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp {
    secs: i64,
    nanos: u32,
}

impl Timestamp {
    /// Build a timestamp, carrying excess nanoseconds into seconds.
    ///
    /// Saturates at the latest representable instant.
    pub const fn new(secs: i64, nanos: u32) -> Self {
        match secs.checked_add((nanos / NANOS_PER_SEC) as i64) {
            Some(secs) => Self {
                secs,
                nanos: nanos % NANOS_PER_SEC,
            },
            None => Self {
                secs: i64::MAX,
                nanos: NANOS_PER_SEC - 1,
            },
        }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                let d = e.duration();
                if d.subsec_nanos() == 0 {
                    Self::new(-(d.as_secs() as i64), 0)
                } else {
                    Self::new(-(d.as_secs() as i64) - 1, NANOS_PER_SEC - d.subsec_nanos())
                }
            }
        }
    }

    /// Whole seconds since the UNIX epoch.
    #[inline]
    pub const fn secs(&self) -> i64 {
        self.secs
    }

    /// Nanoseconds past [`Self::secs`], always below one second.
    #[inline]
    pub const fn nanos(&self) -> u32 {
        self.nanos
    }

    /// Convert to the control-system epoch.
    ///
    /// # Errors
    ///
    /// `TimeConversionError::OutOfRange` if the instant lies before
    /// 1990-01-01 or beyond the 32-bit seconds counter.
    pub fn to_epics(&self) -> Result<EpicsTime, TimeConversionError> {
        let secs = self.secs - EPICS_EPOCH_OFFSET_SECS;
        let secs = u32::try_from(secs).map_err(|_| TimeConversionError::OutOfRange {
            secs: self.secs,
            nanos: self.nanos,
            target: "EPICS",
        })?;
        Ok(EpicsTime {
            secs,
            nanos: self.nanos,
        })
    }

    /// Convert from the control-system epoch.
    ///
    /// # Errors
    ///
    /// `TimeConversionError::InvalidNanoseconds` if the nanosecond field is
    /// not below one second.
    pub fn from_epics(time: EpicsTime) -> Result<Self, TimeConversionError> {
        if time.nanos >= NANOS_PER_SEC {
            return Err(TimeConversionError::InvalidNanoseconds(time.nanos));
        }
        Ok(Self {
            secs: i64::from(time.secs) + EPICS_EPOCH_OFFSET_SECS,
            nanos: time.nanos,
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.secs, self.nanos)
    }
}

/// Instant counted from 1990-01-01, as used by EPICS-style control systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpicsTime {
    /// Seconds past 1990-01-01.
    pub secs: u32,
    /// Nanoseconds past `secs`.
    pub nanos: u32,
}

//! Prelude module for common re-exports.
//!
//! ```rust
//! use devsup_common::prelude::*;
//! ```

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, HostConfig, SharedConfig};
pub use crate::params::Parameters;

// ─── Lifecycle & Channels ───────────────────────────────────────────
pub use crate::state::State;
pub use crate::time::{EpicsTime, Timestamp};
pub use crate::value::{DataKind, Direction, PvType, ScanPolicy, Value};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::error::{
    DenyReason, DriverError, Error, FactoryError, NodeError, PvError, StateMachineError,
    TimeConversionError,
};

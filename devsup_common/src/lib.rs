//! devsup Common Library
//!
//! Shared vocabulary for every devsup crate: the device lifecycle states,
//! channel value kinds, timestamps, construction parameters, the error
//! enums surfaced by the engine, and TOML configuration loading.
//!
//! # Module Structure
//!
//! - [`state`] - Device lifecycle states and their priority order
//! - [`value`] - Channel data kinds, values, direction and scan policy
//! - [`time`] - Timestamps and control-system epoch conversion
//! - [`params`] - Flat string-keyed construction parameters
//! - [`error`] - Error enums for state machines, channels, nodes and the factory
//! - [`config`] - Configuration loading traits and types
//! - [`consts`] - Naming and module-ABI constants
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use devsup_common::prelude::*;
//!
//! let value = 42.5f64.into_value();
//! assert_eq!(value.kind(), DataKind::Float64);
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod consts;
pub mod error;
pub mod params;
pub mod prelude;
pub mod state;
pub mod time;
pub mod value;

pub use error::{Error, Result};

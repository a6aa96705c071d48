//! # devsup Core Library
//!
//! Device-support engine: typed data channels, lifecycle state machines and
//! a registry that allocates driver instances, either compiled in or loaded
//! from shared libraries at runtime.
//!
//! # Module Structure
//!
//! - [`pv`] - Typed, directional channels (variable and delegate)
//! - [`node`] - Device tree, naming, commands, port wiring
//! - [`state_machine`] - Lifecycle engine with rollback and async workers
//! - [`data_acquisition`] - Generic acquisition node
//! - [`interface`] - Boundary towards the control-system adapter
//! - [`driver`] - Driver traits and module entry points
//! - [`module`] - Shared-library loading and search paths
//! - [`registry`] - Driver registry and live-instance tracking
//! - [`log`] - Per-node log filtering
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        DriverRegistry                            │
//! │   drivers: name ─► (allocate, deallocate)   ◄── lib*.so modules  │
//! │   instances: DeviceHandle ─► Box<dyn Device>                     │
//! └──────────────┬───────────────────────────────────────────────────┘
//!                │ allocate / initialize
//!                ▼
//!        ┌───────────────┐  port   ┌──────────────────────────┐
//!        │  root (Port)  │────────►│ ControlSystemInterface   │
//!        └──┬─────────┬──┘         └──────────────────────────┘
//!           │         │
//!     ┌─────▼───┐  ┌──▼──────────────┐
//!     │  Pv ... │  │  StateMachine   │──► worker thread (async mode)
//!     └─────────┘  │  setState/      │
//!                  │  getState/...   │
//!                  └─────────────────┘
//! ```

#![deny(missing_docs)]

pub mod data_acquisition;
pub mod driver;
pub mod interface;
pub mod log;
pub mod module;
pub mod node;
pub mod pv;
pub mod registry;
pub mod state_machine;

#[doc(hidden)]
pub mod __private {
    pub use devsup_common::config::LogLevel;
    pub use tracing;
}

// Re-export key types for convenience
pub use crate::data_acquisition::DataAcquisition;
pub use crate::driver::{Device, Driver};
pub use crate::interface::{ControlSystemInterface, InterfaceFactory};
pub use crate::node::Node;
pub use crate::pv::Pv;
pub use crate::registry::{DeviceHandle, DriverRegistry};
pub use crate::state_machine::{StateMachine, TransitionHandle};
pub use devsup_common;

//! # devsup Simulation Drivers
//!
//! Drivers backed by simulated hardware, for exercising hosts and control
//! system adapters without a lab.
//!
//! # Module Structure
//!
//! - [`thermometer`] - Temperature probe with a heater setpoint and a
//!   waveform acquisition node
//!
//! Built as a `cdylib`, the crate is a loadable driver module exporting the
//! `thermo` driver:
//!
//! ```bash
//! cargo build -p devsup_sim --release
//! devsupd --driver-path target/release -c devsupd.toml
//! ```

#![deny(missing_docs)]

pub mod thermometer;

pub use crate::thermometer::Thermometer;

devsup_core::export_driver!(Thermometer);

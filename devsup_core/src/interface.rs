//! Boundary towards the control-system interface adapter.
//!
//! The adapter that publishes channels on a control network lives outside
//! this crate. Each port node obtains one [`ControlSystemInterface`] from the
//! registry's [`InterfaceFactory`] when its device is initialized; every
//! channel below the port is registered with it, and values pushed by the
//! driver are forwarded to it (after decimation).

use crate::pv::{Pv, PvInfo};
use devsup_common::time::Timestamp;
use devsup_common::value::Value;
use parking_lot::Mutex;
use std::sync::Arc;

/// Adapter-side view of one port.
pub trait ControlSystemInterface: Send + Sync {
    /// A channel became available. The adapter may keep the `Arc` to read
    /// and write it later.
    fn register_pv(&self, pv: &Arc<Pv>);

    /// A channel is going away.
    fn deregister_pv(&self, pv: &Pv);

    /// Every channel of the port has been registered.
    fn registration_terminated(&self) {}

    /// The driver pushed a new value on an input channel.
    fn push(&self, pv: &Pv, timestamp: Timestamp, value: &Value);
}

/// Creates one interface per port.
pub trait InterfaceFactory: Send + Sync {
    /// Interface for the port with the given full name.
    fn create(&self, port: &str) -> Arc<dyn ControlSystemInterface>;
}

/// Interface that discards everything. Used when no adapter is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInterface;

impl ControlSystemInterface for NullInterface {
    fn register_pv(&self, _pv: &Arc<Pv>) {}

    fn deregister_pv(&self, _pv: &Pv) {}

    fn push(&self, _pv: &Pv, _timestamp: Timestamp, _value: &Value) {}
}

/// Factory handing out [`NullInterface`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInterfaceFactory;

impl InterfaceFactory for NullInterfaceFactory {
    fn create(&self, _port: &str) -> Arc<dyn ControlSystemInterface> {
        Arc::new(NullInterface)
    }
}

/// A value pushed through a [`RecordingInterface`].
#[derive(Debug, Clone, PartialEq)]
pub struct PushedSample {
    /// Channel full name.
    pub pv: String,
    /// Timestamp supplied by the driver.
    pub timestamp: Timestamp,
    /// Value supplied by the driver.
    pub value: Value,
}

/// In-memory interface that records registrations and pushes.
///
/// Meant for tests and for diagnostics tooling.
#[derive(Debug, Default)]
pub struct RecordingInterface {
    port: String,
    registered: Mutex<Vec<PvInfo>>,
    samples: Mutex<Vec<PushedSample>>,
    terminated: Mutex<bool>,
}

impl RecordingInterface {
    /// Empty recorder for `port`.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            ..Self::default()
        }
    }

    /// Port full name.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Currently registered channels.
    pub fn registered(&self) -> Vec<PvInfo> {
        self.registered.lock().clone()
    }

    /// Every pushed sample, oldest first.
    pub fn samples(&self) -> Vec<PushedSample> {
        self.samples.lock().clone()
    }

    /// Pushed samples of one channel.
    pub fn samples_of(&self, pv: &str) -> Vec<PushedSample> {
        self.samples
            .lock()
            .iter()
            .filter(|s| s.pv == pv)
            .cloned()
            .collect()
    }

    /// True once `registration_terminated` has been called.
    pub fn is_terminated(&self) -> bool {
        *self.terminated.lock()
    }
}

impl ControlSystemInterface for RecordingInterface {
    fn register_pv(&self, pv: &Arc<Pv>) {
        self.registered.lock().push(pv.info());
    }

    fn deregister_pv(&self, pv: &Pv) {
        let name = pv.full_name();
        self.registered.lock().retain(|info| info.name != name);
    }

    fn registration_terminated(&self) {
        *self.terminated.lock() = true;
    }

    fn push(&self, pv: &Pv, timestamp: Timestamp, value: &Value) {
        self.samples.lock().push(PushedSample {
            pv: pv.full_name(),
            timestamp,
            value: value.clone(),
        });
    }
}

/// Factory creating [`RecordingInterface`]s and keeping a handle on each.
#[derive(Debug, Default)]
pub struct RecordingInterfaceFactory {
    created: Mutex<Vec<Arc<RecordingInterface>>>,
}

impl RecordingInterfaceFactory {
    /// Empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Interface created for `port`, if any.
    pub fn interface(&self, port: &str) -> Option<Arc<RecordingInterface>> {
        self.created.lock().iter().find(|i| i.port() == port).cloned()
    }

    /// Every interface created so far.
    pub fn interfaces(&self) -> Vec<Arc<RecordingInterface>> {
        self.created.lock().clone()
    }
}

impl InterfaceFactory for RecordingInterfaceFactory {
    fn create(&self, port: &str) -> Arc<dyn ControlSystemInterface> {
        let interface = Arc::new(RecordingInterface::new(port));
        self.created.lock().push(interface.clone());
        interface
    }
}

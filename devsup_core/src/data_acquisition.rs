//! Generic data-acquisition node.
//!
//! ```text
//! <name>
//! ├── Data            input  T    interrupt, max_elements
//! ├── Frequency       output f64  Hz
//! ├── Duration        output f64  s
//! ├── Amplitude       output f64
//! ├── Offset          output f64
//! ├── Decimation      output i32  applied to Data on start
//! ├── SamplingMode    output i32  SINGLE | CONTINUOUS
//! ├── Ground          output i32  OFF | ON
//! └── StateMachine    asynchronous by default
//! ```
//!
//! Starting the node records the start timestamp and copies `Decimation`
//! onto the `Data` channel before the driver's own start callback runs.

use crate::node::Node;
use crate::pv::Pv;
use crate::state_machine::{Leg, StateMachine, StateMachineBuilder, TransitionFn};
use devsup_common::error::{DriverError, NodeError, PvError};
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use devsup_common::value::{PvType, ScanPolicy};
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

/// Acquisition sampling mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum SamplingMode {
    /// One acquisition per start.
    #[default]
    Single = 0,
    /// Acquire until stopped.
    Continuous = 1,
}

impl SamplingMode {
    /// Enumeration labels, indexed by value.
    pub const LABELS: [&'static str; 2] = ["SINGLE", "CONTINUOUS"];

    /// Decode a channel value.
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Single),
            1 => Some(Self::Continuous),
            _ => None,
        }
    }
}

/// Input grounding switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum Ground {
    /// Input floating.
    #[default]
    Off = 0,
    /// Input grounded.
    On = 1,
}

impl Ground {
    /// Enumeration labels, indexed by value.
    pub const LABELS: [&'static str; 2] = ["OFF", "ON"];

    /// Decode a channel value.
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Off),
            1 => Some(Self::On),
            _ => None,
        }
    }
}

/// Snapshot of the acquisition parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquisitionSettings {
    /// Sampling frequency (Hz).
    pub frequency: f64,
    /// Acquisition duration (s).
    pub duration: f64,
    /// Input amplitude.
    pub amplitude: f64,
    /// Input offset.
    pub offset: f64,
    /// Interface decimation factor.
    pub decimation: u32,
    /// Sampling mode.
    pub sampling_mode: SamplingMode,
    /// Grounding switch.
    pub ground: Ground,
}

/// Data-acquisition node publishing samples of type `T`.
pub struct DataAcquisition<T: PvType> {
    node: Arc<Node>,
    data: Arc<Pv>,
    frequency: Arc<Pv>,
    duration: Arc<Pv>,
    amplitude: Arc<Pv>,
    offset: Arc<Pv>,
    decimation: Arc<Pv>,
    sampling_mode: Arc<Pv>,
    ground: Arc<Pv>,
    state_machine: Arc<StateMachine>,
    start_time: Arc<Mutex<Option<Timestamp>>>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: PvType> DataAcquisition<T> {
    /// Start configuring a node named `name`.
    pub fn builder(name: impl Into<String>) -> DataAcquisitionBuilder<T> {
        DataAcquisitionBuilder {
            name: name.into(),
            max_elements: None,
            machine: StateMachine::builder().asynchronous(true),
            on_start: None,
            _kind: PhantomData,
        }
    }

    /// The node; attach it under a port with [`Node::add_node`].
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    /// The node's state machine.
    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state_machine
    }

    /// Current local state.
    pub fn state(&self) -> State {
        self.state_machine.state()
    }

    /// `Data` channel.
    pub fn data(&self) -> &Arc<Pv> {
        &self.data
    }

    /// `Frequency` channel.
    pub fn frequency(&self) -> &Arc<Pv> {
        &self.frequency
    }

    /// `Duration` channel.
    pub fn duration(&self) -> &Arc<Pv> {
        &self.duration
    }

    /// `Amplitude` channel.
    pub fn amplitude(&self) -> &Arc<Pv> {
        &self.amplitude
    }

    /// `Offset` channel.
    pub fn offset(&self) -> &Arc<Pv> {
        &self.offset
    }

    /// `Decimation` channel.
    pub fn decimation(&self) -> &Arc<Pv> {
        &self.decimation
    }

    /// `SamplingMode` channel.
    pub fn sampling_mode(&self) -> &Arc<Pv> {
        &self.sampling_mode
    }

    /// `Ground` channel.
    pub fn ground(&self) -> &Arc<Pv> {
        &self.ground
    }

    /// Timestamp of the last successful start request.
    pub fn start_time(&self) -> Option<Timestamp> {
        *self.start_time.lock()
    }

    /// Current values of every parameter channel.
    pub fn settings(&self) -> Result<AcquisitionSettings, PvError> {
        let sampling_mode = self.sampling_mode.read_as::<i32>()?.1;
        let ground = self.ground.read_as::<i32>()?.1;
        Ok(AcquisitionSettings {
            frequency: self.frequency.read_as::<f64>()?.1,
            duration: self.duration.read_as::<f64>()?.1,
            amplitude: self.amplitude.read_as::<f64>()?.1,
            offset: self.offset.read_as::<f64>()?.1,
            decimation: read_decimation(&self.decimation)?,
            sampling_mode: SamplingMode::from_i32(sampling_mode).unwrap_or_default(),
            ground: Ground::from_i32(ground).unwrap_or_default(),
        })
    }

    /// Publish acquired samples on `Data`.
    pub fn push(&self, timestamp: Timestamp, data: T) -> Result<(), PvError> {
        self.data.push_as(timestamp, data)
    }
}

fn read_decimation(pv: &Pv) -> Result<u32, PvError> {
    let (_, factor) = pv.read_as::<i32>()?;
    Ok(u32::try_from(factor).unwrap_or(1).max(1))
}

/// Builder for [`DataAcquisition`].
#[must_use = "call build() to obtain the node"]
pub struct DataAcquisitionBuilder<T: PvType> {
    name: String,
    max_elements: Option<usize>,
    machine: StateMachineBuilder,
    on_start: Option<TransitionFn>,
    _kind: PhantomData<fn() -> T>,
}

impl<T: PvType> DataAcquisitionBuilder<T> {
    /// Maximum element count of `Data`.
    pub fn max_elements(mut self, max: usize) -> Self {
        self.max_elements = Some(max);
        self
    }

    /// Run transition callbacks on the caller's thread instead.
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.machine = self.machine.asynchronous(asynchronous);
        self
    }

    /// Callback of the `start` leg, run after decimation is applied.
    pub fn on_start<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(f));
        self
    }

    /// Callback of any other leg.
    pub fn on_transition<F>(mut self, leg: Leg, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        if leg == Leg::Start {
            self.on_start = Some(Arc::new(f));
        } else {
            self.machine = self.machine.on_transition(leg, f);
        }
        self
    }

    /// Adjust the underlying state-machine builder (rollback hooks, predicate).
    pub fn configure_state_machine<F>(mut self, f: F) -> Self
    where
        F: FnOnce(StateMachineBuilder) -> StateMachineBuilder,
    {
        self.machine = f(self.machine);
        self
    }

    /// Create the node with its channels and state machine.
    ///
    /// # Errors
    ///
    /// Only fails on channel name clashes inside the node, which cannot
    /// happen for the fixed channel set.
    pub fn build(self) -> Result<DataAcquisition<T>, NodeError> {
        let node = Node::new(self.name);

        let mut data = Pv::variable_in::<T>("Data")
            .scan(ScanPolicy::Interrupt)
            .description("Acquired samples");
        if let Some(max) = self.max_elements {
            data = data.max_elements(max);
        }
        let data = node.add_pv(data.build())?;

        let frequency = node.add_pv(
            Pv::variable_out::<f64>("Frequency")
                .units("Hz")
                .description("Sampling frequency")
                .build(),
        )?;
        let duration = node.add_pv(
            Pv::variable_out::<f64>("Duration")
                .units("s")
                .description("Acquisition duration")
                .build(),
        )?;
        let amplitude = node.add_pv(
            Pv::variable_out::<f64>("Amplitude")
                .description("Input amplitude")
                .build(),
        )?;
        let offset = node.add_pv(
            Pv::variable_out::<f64>("Offset")
                .description("Input offset")
                .build(),
        )?;
        let decimation = node.add_pv(
            Pv::variable_out::<i32>("Decimation")
                .initial(1)
                .description("Forward one sample out of N to the control system")
                .build(),
        )?;
        let sampling_mode = node.add_pv(
            Pv::variable_out::<i32>("SamplingMode")
                .enumeration(SamplingMode::LABELS)
                .build(),
        )?;
        let ground = node.add_pv(
            Pv::variable_out::<i32>("Ground")
                .enumeration(Ground::LABELS)
                .build(),
        )?;

        let start_time = Arc::new(Mutex::new(None));
        let begin = {
            let owner = Arc::downgrade(&node);
            let data = data.clone();
            let decimation = decimation.clone();
            let start_time = start_time.clone();
            let user = self.on_start;
            move || -> Result<(), DriverError> {
                let now = owner
                    .upgrade()
                    .map_or_else(Timestamp::now, |node| node.timestamp());
                *start_time.lock() = Some(now);
                let factor =
                    read_decimation(&decimation).map_err(|e| DriverError::new(e.to_string()))?;
                data.set_decimation(factor);
                user.as_ref().map_or(Ok(()), |f| f())
            }
        };
        let state_machine = node.add_state_machine(self.machine.on_start(begin).build())?;

        Ok(DataAcquisition {
            node,
            data,
            frequency,
            duration,
            amplitude,
            offset,
            decimation,
            sampling_mode,
            ground,
            state_machine,
            start_time,
            _kind: PhantomData,
        })
    }
}

//! Simulated temperature probe.
//!
//! ```text
//! <instance> (port)
//! ├── StateMachine        setState / getState / getGlobalState
//! ├── Temperature         f64 in   delegate, periodic 1 s
//! ├── setpoint            f64 out  delegate, writable in ON / RUNNING
//! ├── setpointWrites      i32 in   delegate
//! └── Acquisition         DataAcquisition<Vec<f64>>
//!     ├── StateMachine
//!     └── Data, Frequency, Duration, Amplitude, Offset, ...
//! ```
//!
//! The probe reads ambient temperature while idle and tracks the setpoint
//! while running. `calibrate <offset>` shifts every reading.
//!
//! # Parameters
//!
//! | Key | Default | Meaning |
//! |-----|---------|---------|
//! | `ambient` | `20.0` | Ambient temperature (degC) |
//! | `asynchronous` | `true` | Run transition callbacks on worker threads |
//! | `samples` | `1024` | Maximum acquisition length |
//! | `fail_on` | - | Leg whose callback fails (`switchOn`, `start`, ...) |

use devsup_common::error::{DriverError, Error, NodeError};
use devsup_common::params::Parameters;
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use devsup_common::value::ScanPolicy;
use devsup_core::data_acquisition::DataAcquisition;
use devsup_core::driver::{Device, Driver};
use devsup_core::node::Node;
use devsup_core::pv::Pv;
use devsup_core::state_machine::{Leg, StateMachine};
use parking_lot::Mutex;
use std::f64::consts::TAU;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info};

/// Name the driver registers under.
pub const DRIVER_NAME: &str = "thermo";

const DEFAULT_AMBIENT: f64 = 20.0;
const DEFAULT_SAMPLES: usize = 1024;
const TEMPERATURE_SCAN: Duration = Duration::from_secs(1);

// ─── Simulated hardware ─────────────────────────────────────────────

#[derive(Debug)]
struct Sensor {
    ambient: f64,
    setpoint: f64,
    setpoint_time: Timestamp,
    calibration: f64,
    powered: bool,
    heating: bool,
    writes: i32,
}

impl Sensor {
    fn new(ambient: f64) -> Self {
        Self {
            ambient,
            setpoint: ambient,
            setpoint_time: Timestamp::default(),
            calibration: 0.0,
            powered: false,
            heating: false,
            writes: 0,
        }
    }

    fn apply(&mut self, leg: Leg) {
        match leg {
            Leg::SwitchOn => self.powered = true,
            Leg::Start => self.heating = true,
            Leg::Stop => self.heating = false,
            Leg::SwitchOff | Leg::Recover => {
                self.heating = false;
                self.powered = false;
            }
        }
    }

    fn reading(&self) -> f64 {
        let base = if self.heating {
            self.setpoint
        } else {
            self.ambient
        };
        base + self.calibration
    }
}

/// Allocation parameters.
#[derive(Debug, Clone, PartialEq)]
struct Settings {
    ambient: f64,
    asynchronous: bool,
    samples: usize,
    fail_on: Option<Leg>,
}

impl Settings {
    fn from_parameters(parameters: &Parameters) -> Result<Self, DriverError> {
        let invalid = |e: devsup_common::config::ConfigError| DriverError::new(e.to_string());
        let fail_on = match parameters.get("fail_on") {
            None => None,
            Some(name) => Some(
                Leg::ALL
                    .into_iter()
                    .find(|leg| leg.name() == name)
                    .ok_or_else(|| DriverError::new(format!("fail_on: unknown leg '{name}'")))?,
            ),
        };
        Ok(Self {
            ambient: parameters.get_or("ambient", DEFAULT_AMBIENT).map_err(invalid)?,
            asynchronous: parameters.get_or("asynchronous", true).map_err(invalid)?,
            samples: parameters.get_or("samples", DEFAULT_SAMPLES).map_err(invalid)?,
            fail_on,
        })
    }
}

fn wiring(e: NodeError) -> DriverError {
    DriverError::new(format!("cannot build device tree: {e}"))
}

// ─── Driver ─────────────────────────────────────────────────────────

/// Simulated thermometer device.
pub struct Thermometer {
    root: Arc<Node>,
    state_machine: Arc<StateMachine>,
    acquisition: Arc<DataAcquisition<Vec<f64>>>,
    sensor: Arc<Mutex<Sensor>>,
}

impl Thermometer {
    /// Lifecycle machine of the probe.
    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.state_machine
    }

    /// Waveform acquisition node.
    pub fn acquisition(&self) -> &Arc<DataAcquisition<Vec<f64>>> {
        &self.acquisition
    }

    /// Current simulated reading (degC).
    pub fn temperature(&self) -> f64 {
        self.sensor.lock().reading()
    }

    fn build_state_machine(
        instance: &str,
        settings: &Settings,
        sensor: &Arc<Mutex<Sensor>>,
    ) -> Arc<StateMachine> {
        let mut machine = StateMachine::builder().asynchronous(settings.asynchronous);
        for leg in Leg::ALL {
            let sensor = sensor.clone();
            let instance = instance.to_string();
            let fail = settings.fail_on == Some(leg);
            machine = machine.on_transition(leg, move || {
                if fail {
                    return Err(DriverError::new(format!("simulated {} failure", leg.name())));
                }
                sensor.lock().apply(leg);
                debug!(instance = %instance, leg = leg.name(), "sensor updated");
                Ok(())
            });
        }
        machine.build()
    }

    fn add_channels(root: &Arc<Node>, sensor: &Arc<Mutex<Sensor>>) -> Result<(), NodeError> {
        let source = sensor.clone();
        root.add_pv(
            Pv::delegate_in::<f64, _>("Temperature", move || {
                Ok((Timestamp::now(), source.lock().reading()))
            })
            .scan(ScanPolicy::Periodic(TEMPERATURE_SCAN))
            .units("degC")
            .description("Probe temperature")
            .build(),
        )?;

        let target = sensor.clone();
        let readback = sensor.clone();
        root.add_pv(
            Pv::delegate_out::<f64, _>("setpoint", move |timestamp, value| {
                let mut sensor = target.lock();
                sensor.setpoint = value;
                sensor.setpoint_time = timestamp;
                sensor.writes += 1;
                Ok(())
            })
            .initializer(move || {
                let sensor = readback.lock();
                Ok((sensor.setpoint_time, sensor.setpoint))
            })
            .gated_by(&[State::On, State::Running])
            .units("degC")
            .description("Heater setpoint")
            .build(),
        )?;

        let counter = sensor.clone();
        root.add_pv(
            Pv::delegate_in::<i32, _>("setpointWrites", move || {
                Ok((Timestamp::now(), counter.lock().writes))
            })
            .description("Setpoint writes accepted by the heater")
            .build(),
        )?;
        Ok(())
    }

    fn add_acquisition(
        root: &Arc<Node>,
        settings: &Settings,
        sensor: &Arc<Mutex<Sensor>>,
    ) -> Result<Arc<DataAcquisition<Vec<f64>>>, NodeError> {
        let armed = sensor.clone();
        let acquisition = Arc::new(
            DataAcquisition::<Vec<f64>>::builder("Acquisition")
                .max_elements(settings.samples)
                .asynchronous(settings.asynchronous)
                .on_start(move || {
                    if armed.lock().powered {
                        Ok(())
                    } else {
                        Err(DriverError::new("probe is not powered"))
                    }
                })
                .build()?,
        );
        root.add_node(acquisition.node().clone())?;

        let weak: Weak<DataAcquisition<Vec<f64>>> = Arc::downgrade(&acquisition);
        let source = sensor.clone();
        let max = settings.samples;
        acquisition
            .node()
            .define_command("acquire", "acquire", 0, move |_| {
                let daq = weak
                    .upgrade()
                    .ok_or_else(|| DriverError::new("acquisition node released"))?;
                acquire(&daq, &source, max)
            })?;
        Ok(acquisition)
    }
}

/// Synthesize one waveform around the current reading and publish it.
fn acquire(
    daq: &DataAcquisition<Vec<f64>>,
    sensor: &Mutex<Sensor>,
    max: usize,
) -> Result<String, Error> {
    if daq.state() != State::Running {
        return Err(DriverError::new(format!(
            "acquisition is {}, expected {}",
            daq.state(),
            State::Running
        ))
        .into());
    }
    let settings = daq.settings()?;
    let requested = (settings.frequency * settings.duration).round();
    if !requested.is_finite() || requested < 1.0 {
        return Err(DriverError::new("frequency x duration yields no samples").into());
    }
    let count = (requested as usize).min(max);
    let level = sensor.lock().reading() + settings.offset;
    let samples: Vec<f64> = (0..count)
        .map(|i| level + settings.amplitude * (TAU * i as f64 / count as f64).sin())
        .collect();

    let timestamp = daq.start_time().unwrap_or_else(Timestamp::now);
    daq.push(timestamp, samples)?;
    Ok(format!("acquired {count} samples"))
}

impl Device for Thermometer {
    fn root(&self) -> &Arc<Node> {
        &self.root
    }
}

impl Driver for Thermometer {
    const NAME: &'static str = DRIVER_NAME;

    fn allocate(instance: &str, parameters: &Parameters) -> Result<Self, DriverError> {
        let settings = Settings::from_parameters(parameters)?;
        let sensor = Arc::new(Mutex::new(Sensor::new(settings.ambient)));

        let root = Node::port(instance);
        let state_machine = root
            .add_state_machine(Self::build_state_machine(instance, &settings, &sensor))
            .map_err(wiring)?;
        Self::add_channels(&root, &sensor).map_err(wiring)?;
        let acquisition = Self::add_acquisition(&root, &settings, &sensor).map_err(wiring)?;

        let calibration = sensor.clone();
        root.define_command("calibrate", "calibrate <offset degC>", 1, move |args| {
            let offset: f64 = args[0]
                .trim()
                .parse()
                .map_err(|_| DriverError::new(format!("invalid offset '{}'", args[0])))?;
            calibration.lock().calibration = offset;
            Ok(format!("calibration offset {offset} degC"))
        })
        .map_err(wiring)?;

        info!(instance = %instance, ambient = settings.ambient, "thermometer allocated");
        Ok(Self {
            root,
            state_machine,
            acquisition,
            sensor,
        })
    }
}

impl std::fmt::Debug for Thermometer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thermometer")
            .field("name", &self.root.name())
            .field("state", &self.state_machine.state())
            .field("sensor", &*self.sensor.lock())
            .finish()
    }
}

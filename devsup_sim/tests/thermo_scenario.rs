//! End-to-end scenarios for the thermometer driver through the registry.

use devsup_common::error::{Error, FactoryError, StateMachineError};
use devsup_common::params::Parameters;
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use devsup_common::value::Value;
use devsup_core::interface::RecordingInterfaceFactory;
use devsup_core::registry::DriverRegistry;
use devsup_sim::Thermometer;
use std::sync::Arc;

#[test]
fn test_thermo_lifecycle_scenario() {
    let registry = DriverRegistry::new();
    registry.register::<Thermometer>().expect("register thermo");

    let h = registry
        .allocate("thermo", "probe1", &Parameters::new())
        .expect("allocate probe1");

    let on = registry
        .request_state(h, State::Initializing)
        .expect("switch on accepted")
        .wait()
        .expect("switch on");
    assert_eq!(on, State::On);

    let running = registry
        .request_state(h, State::Starting)
        .expect("start accepted")
        .wait()
        .expect("start");
    assert_eq!(running, State::Running);

    let setpoint = registry.find_pv("probe1-setpoint").expect("setpoint");
    setpoint
        .write_as(Timestamp::new(1_700_000_000, 0), 42.5)
        .expect("write setpoint");
    assert_eq!(
        setpoint.read_as::<f64>().expect("read back"),
        (Timestamp::new(1_700_000_000, 0), 42.5)
    );
    let writes = registry.find_pv("probe1-setpointWrites").expect("counter");
    assert_eq!(writes.read_as::<i32>().expect("read").1, 1);
    let temperature = registry.find_pv("probe1-Temperature").expect("temperature");
    assert_eq!(temperature.read_as::<f64>().expect("read").1, 42.5);

    registry.deallocate(h).expect("deallocate");
    assert_eq!(
        registry.request_state(h, State::Off).unwrap_err(),
        Error::Factory(FactoryError::UnknownHandle(h.id()))
    );
    assert_eq!(registry.deallocate(h), Err(FactoryError::UnknownHandle(h.id())));
    assert!(registry.find_pv("probe1-setpoint").is_none());
}

#[test]
fn test_setpoint_rejected_while_off() {
    let registry = DriverRegistry::new();
    registry.register::<Thermometer>().expect("register");
    registry
        .allocate("thermo", "probe1", &Parameters::new())
        .expect("allocate");

    let setpoint = registry.find_pv("probe1-setpoint").expect("setpoint");
    assert!(setpoint.write_as(Timestamp::now(), 30.0).is_err());
    let writes = registry.find_pv("probe1-setpointWrites").expect("counter");
    assert_eq!(writes.read_as::<i32>().expect("read").1, 0);
}

#[test]
fn test_failed_start_is_reported_through_handle() {
    let registry = DriverRegistry::new();
    registry.register::<Thermometer>().expect("register");
    let h = registry
        .allocate("thermo", "probe2", &Parameters::new().with("fail_on", "start"))
        .expect("allocate");

    registry
        .request_state(h, State::On)
        .expect("accepted")
        .wait()
        .expect("switch on");
    let err = registry
        .request_state(h, State::Running)
        .expect("accepted")
        .wait()
        .unwrap_err();
    assert!(matches!(
        err,
        StateMachineError::CallbackFailed {
            rolled_back_to: State::On,
            ..
        }
    ));
    let root = registry.device(h).expect("device");
    assert_eq!(root.local_state(), State::On);
}

#[test]
fn test_state_changes_reach_the_interface() {
    let interfaces = Arc::new(RecordingInterfaceFactory::new());
    let registry = DriverRegistry::with_interface_factory(interfaces.clone());
    registry.register::<Thermometer>().expect("register");
    let h = registry
        .allocate(
            "thermo",
            "probe3",
            &Parameters::new().with("asynchronous", "false"),
        )
        .expect("allocate");
    registry
        .request_state(h, State::On)
        .expect("switch on")
        .wait()
        .expect("on");

    let recorder = interfaces.interface("probe3").expect("port interface");
    assert!(recorder.is_terminated());
    let states: Vec<Value> = recorder
        .samples_of("probe3-StateMachine-getState")
        .into_iter()
        .map(|s| s.value)
        .collect();
    assert_eq!(
        states,
        vec![
            Value::Int32(State::Off as i32),
            Value::Int32(State::Initializing as i32),
            Value::Int32(State::On as i32),
        ]
    );
    assert!(
        recorder
            .registered()
            .iter()
            .any(|info| info.name == "probe3-Acquisition-Data")
    );

    registry.shutdown();
    assert!(recorder.registered().is_empty());
}

#[test]
fn test_commands_through_registry() {
    let registry = DriverRegistry::new();
    registry.register::<Thermometer>().expect("register");
    registry
        .allocate(
            "thermo",
            "probe4",
            &Parameters::new()
                .with("asynchronous", "false")
                .with("ambient", "21"),
        )
        .expect("allocate");

    registry
        .run_command("probe4", "calibrate", &["1.5"])
        .expect("calibrate");
    let temperature = registry.find_pv("probe4-Temperature").expect("temperature");
    assert_eq!(temperature.read_as::<f64>().expect("read").1, 22.5);

    assert!(matches!(
        registry.run_command("probe4", "calibrate", &[]),
        Err(Error::Node(_))
    ));
    registry
        .run_command("probe4", "switchOn", &[])
        .expect("switchOn command");
    let root = registry.device(registry.handle_of("probe4").expect("handle")).expect("device");
    assert_eq!(root.local_state(), State::On);
}

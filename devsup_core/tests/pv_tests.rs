//! Channel integration tests.
//!
//! Channels inside a device tree: state gating, cross-node subscription
//! chains, concurrent access and registration with the port interface.

use devsup_common::error::{DriverError, NodeError, PvError};
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use devsup_common::value::{DataKind, Direction, ScanPolicy, Value};
use devsup_core::interface::RecordingInterfaceFactory;
use devsup_core::node::Node;
use devsup_core::pv::Pv;
use devsup_core::state_machine::StateMachine;
use parking_lot::Mutex;
use std::sync::{Arc, Barrier};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::thread;

fn ts(secs: i64, nanos: u32) -> Timestamp {
    Timestamp::new(secs, nanos)
}

#[test]
fn test_variable_round_trip_is_exact() {
    let pv = Pv::variable_out::<Vec<u8>>("blob").max_elements(8).build();
    let t = ts(1_700_000_000, 123_456_789);
    pv.write_as(t, vec![1u8, 2, 3]).expect("write");
    assert_eq!(pv.read().expect("read"), (t, Value::UInt8Array(vec![1, 2, 3])));
}

#[test]
fn test_gated_channel_follows_owner_state() {
    let port = Node::port("dev");
    let sm = port
        .add_state_machine(StateMachine::builder().build())
        .expect("attach");
    let setpoint = port
        .add_pv(
            Pv::variable_out::<f64>("setpoint")
                .gated_by(&[State::On, State::Running])
                .build(),
        )
        .expect("add");
    port.initialize(&RecordingInterfaceFactory::new())
        .expect("initialize");

    assert_eq!(
        setpoint.write_as(ts(1, 0), 1.0),
        Err(PvError::NotPermitted {
            pv: "dev-setpoint".into(),
            state: State::Off
        })
    );
    sm.switch_on().expect("on");
    setpoint.write_as(ts(2, 0), 2.0).expect("write while on");
    assert_eq!(setpoint.read_as::<f64>().expect("read"), (ts(2, 0), 2.0));
}

#[test]
fn test_gate_uses_nearest_state_machine() {
    let port = Node::port("dev");
    let sm = port
        .add_state_machine(StateMachine::builder().build())
        .expect("attach");
    let child = port.add_node(Node::new("stage")).expect("child");
    let speed = child
        .add_pv(Pv::variable_out::<i32>("speed").gated_by(&[State::On]).build())
        .expect("add");
    port.initialize(&RecordingInterfaceFactory::new())
        .expect("initialize");

    assert!(speed.write_as(ts(1, 0), 3).is_err());
    sm.switch_on().expect("on");
    assert!(speed.write_as(ts(1, 0), 3).is_ok());
}

#[test]
fn test_output_drives_input_delegate_across_nodes() {
    let hardware = Arc::new(AtomicI32::new(0));
    let port = Node::port("dev");
    let panel = port.add_node(Node::new("panel")).expect("panel");
    let motor = port.add_node(Node::new("motor")).expect("motor");

    let command = panel
        .add_pv(Pv::variable_out::<i32>("command").build())
        .expect("command");
    let setter_hw = hardware.clone();
    let drive = motor
        .add_pv(
            Pv::delegate_out::<i32, _>("drive", move |_, v| {
                setter_hw.store(v, Ordering::SeqCst);
                Ok(())
            })
            .build(),
        )
        .expect("drive");
    let getter_hw = hardware.clone();
    let position = motor
        .add_pv(
            Pv::delegate_in::<i32, _>("position", move || {
                Ok((Timestamp::new(5, 0), getter_hw.load(Ordering::SeqCst)))
            })
            .scan(ScanPolicy::Interrupt)
            .build(),
        )
        .expect("position");
    let echo = panel
        .add_pv(Pv::variable_in::<i32>("echo").build())
        .expect("echo");

    drive.subscribe_to(&command).expect("command -> drive");
    echo.subscribe_to(&command).expect("command -> echo");

    command.write_as(ts(4, 0), 17).expect("write");
    assert_eq!(position.read_as::<i32>().expect("read"), (ts(5, 0), 17));
    assert_eq!(echo.read_as::<i32>().expect("read"), (ts(4, 0), 17));
    assert_eq!(command.subscriber_count(), 2);
}

#[test]
fn test_failing_subscriber_reports_but_source_keeps_value() {
    let source = Pv::variable_out::<i32>("source").build();
    let broken = Pv::delegate_out::<i32, _>("broken", |_, _| Err(DriverError::new("offline")))
        .build();
    let healthy = Pv::variable_out::<i32>("healthy").build();
    broken.subscribe_to(&source).expect("subscribe");
    healthy.subscribe_to(&source).expect("subscribe");

    let err = source.write_as(ts(1, 0), 9).unwrap_err();
    assert!(matches!(err, PvError::Delegate { .. }));
    assert_eq!(source.read_as::<i32>().expect("read").1, 9);
    assert_eq!(healthy.read_as::<i32>().expect("read").1, 9);
}

#[test]
fn test_concurrent_writes_are_serialized() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let counter = calls.clone();
    let log = seen.clone();
    let pv = Pv::delegate_out::<i32, _>("serial", move |_, v| {
        let before = counter.fetch_add(1, Ordering::SeqCst);
        log.lock().push(v);
        assert_eq!(counter.load(Ordering::SeqCst), before + 1);
        Ok(())
    })
    .build();

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let pv = pv.clone();
            thread::spawn(move || {
                for n in 0..50 {
                    pv.write_as(ts(i, n), i as i32).expect("write");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 400);
    assert_eq!(seen.lock().len(), 400);
}

#[test]
fn test_racing_mutual_subscriptions_admit_one() {
    for round in 0..500 {
        let a = Pv::variable_out::<i32>(format!("a{round}")).build();
        let b = Pv::variable_out::<i32>(format!("b{round}")).build();
        let barrier = Arc::new(Barrier::new(2));

        let spawn = |subscriber: Arc<Pv>, source: Arc<Pv>| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                subscriber.subscribe_to(&source)
            })
        };
        let ab = spawn(a.clone(), b.clone());
        let ba = spawn(b.clone(), a.clone());
        let results = [
            ab.join().expect("subscriber thread"),
            ba.join().expect("subscriber thread"),
        ];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "round {round}");
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(PvError::SubscriptionCycle { .. }))),
            "round {round}"
        );
        a.write_as(ts(round, 0), 1).expect("write terminates");
        b.write_as(ts(round, 1), 2).expect("write terminates");
    }
}

#[test]
fn test_subscriber_ends_with_source_value_under_contention() {
    let source = Pv::variable_out::<i32>("source").build();
    let mirror = Pv::variable_out::<i32>("mirror").build();
    mirror.subscribe_to(&source).expect("subscribe");

    let writers: Vec<_> = (0..8)
        .map(|i| {
            let source = source.clone();
            thread::spawn(move || {
                for n in 0..200 {
                    source.write_as(ts(i, n), i as i32 * 1000 + n as i32).expect("write");
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer thread");
    }
    assert_eq!(
        mirror.read().expect("mirror"),
        source.read().expect("source")
    );
}

#[test]
fn test_channels_are_registered_with_port() {
    let port = Node::port("dev");
    let daq = port.add_node(Node::new("daq")).expect("daq");
    daq.add_pv(
        Pv::variable_in::<Vec<f64>>("Data")
            .max_elements(1024)
            .units("V")
            .description("Samples")
            .scan(ScanPolicy::Interrupt)
            .build(),
    )
    .expect("add");
    let interfaces = RecordingInterfaceFactory::new();
    port.initialize(&interfaces).expect("initialize");

    let recorder = interfaces.interface("dev").expect("interface");
    let info = recorder
        .registered()
        .into_iter()
        .find(|info| info.name == "dev-daq-Data")
        .expect("registered");
    assert_eq!(info.direction, Direction::Input);
    assert_eq!(info.kind, DataKind::Float64Array);
    assert_eq!(info.max_elements, Some(1024));
    assert_eq!(info.units, "V");
    assert!(recorder.is_terminated());

    port.deinitialize();
    assert!(recorder.registered().is_empty());
}

#[test]
fn test_channels_need_a_port() {
    let root = Node::new("loose");
    root.add_pv(Pv::variable_in::<i32>("x").build()).expect("add");
    assert_eq!(
        root.initialize(&RecordingInterfaceFactory::new()),
        Err(NodeError::NoPortDefined("loose".into()))
    );
}

#[test]
fn test_sibling_names_are_unique() {
    let port = Node::port("dev");
    port.add_pv(Pv::variable_in::<i32>("x").build()).expect("add");
    assert!(matches!(
        port.add_pv(Pv::variable_out::<f64>("x").build()),
        Err(NodeError::DuplicateChild { .. })
    ));
    assert!(matches!(
        port.add_node(Node::new("x")),
        Err(NodeError::DuplicateChild { .. })
    ));
}

//! The thermometer loaded as a driver module.
//!
//! Each test stages the `cdylib` built next to this test binary into its own
//! directory and drives it through the registry. The tests return early when
//! the library has not been built.

#![cfg(unix)]

use devsup_common::error::FactoryError;
use devsup_common::params::Parameters;
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use devsup_core::module::candidate_file_name;
use devsup_core::registry::DriverRegistry;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Metadata, Subscriber};

fn built_library_name() -> String {
    format!("{DLL_PREFIX}devsup_sim{DLL_SUFFIX}")
}

fn built_library() -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let name = built_library_name();
    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(&name))
        .find(|path| path.is_file())
}

/// Copy the built module into a fresh directory under `file_name`.
fn stage_module(file_name: &str) -> Option<TempDir> {
    let Some(library) = built_library() else {
        eprintln!("{} not built, skipping", built_library_name());
        return None;
    };
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::copy(&library, dir.path().join(file_name)).expect("stage module");
    Some(dir)
}

/// Counts events emitted from the thermometer's own code.
struct ThermometerEvents {
    seen: Arc<AtomicUsize>,
}

impl Subscriber for ThermometerEvents {
    fn enabled(&self, _: &Metadata<'_>) -> bool {
        true
    }

    fn new_span(&self, _: &Attributes<'_>) -> Id {
        Id::from_u64(1)
    }

    fn record(&self, _: &Id, _: &Record<'_>) {}

    fn record_follows_from(&self, _: &Id, _: &Id) {}

    fn event(&self, event: &Event<'_>) {
        if event
            .metadata()
            .module_path()
            .is_some_and(|path| path.starts_with("devsup_sim"))
        {
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn enter(&self, _: &Id) {}

    fn exit(&self, _: &Id) {}
}

#[test]
fn test_discovered_module_runs_a_device() {
    let Some(dir) = stage_module(&built_library_name()) else {
        return;
    };
    let registry = DriverRegistry::new();
    registry.add_search_path(dir.path());

    assert_eq!(registry.discover().expect("discover"), vec!["thermo".to_string()]);
    assert_eq!(
        registry.loaded_modules(),
        vec![dir.path().join(built_library_name())]
    );

    let h = registry
        .allocate("thermo", "sensor1", &Parameters::new())
        .expect("allocate sensor1");
    let on = registry
        .request_state(h, State::On)
        .expect("switch on accepted")
        .wait()
        .expect("switch on");
    assert_eq!(on, State::On);
    let running = registry
        .request_state(h, State::Running)
        .expect("start accepted")
        .wait()
        .expect("start");
    assert_eq!(running, State::Running);

    let setpoint = registry.find_pv("sensor1-setpoint").expect("setpoint");
    setpoint
        .write_as(Timestamp::new(1_700_000_000, 0), 42.5)
        .expect("write setpoint");
    assert_eq!(setpoint.read_as::<f64>().expect("read back").1, 42.5);
    let temperature = registry.find_pv("sensor1-Temperature").expect("temperature");
    assert_eq!(temperature.read_as::<f64>().expect("read").1, 42.5);
    drop((setpoint, temperature));

    registry.deallocate(h).expect("deallocate");
    assert!(registry.instances().is_empty());
    assert!(registry.find_pv("sensor1-setpoint").is_none());

    registry.shutdown();
    assert!(registry.drivers().is_empty());
    assert!(registry.loaded_modules().is_empty());
}

#[test]
fn test_module_events_reach_host_subscriber() {
    let Some(dir) = stage_module(&built_library_name()) else {
        return;
    };
    let registry = DriverRegistry::new();
    registry.add_search_path(dir.path());

    let seen = Arc::new(AtomicUsize::new(0));
    let events = ThermometerEvents { seen: seen.clone() };
    tracing::subscriber::with_default(events, || {
        registry.discover().expect("discover");
    });

    // The module keeps the dispatcher it was handed at load time.
    registry
        .allocate("thermo", "sensor2", &Parameters::new())
        .expect("allocate");
    assert!(seen.load(Ordering::SeqCst) >= 1);
    registry.shutdown();
}

#[test]
fn test_missing_search_dir_does_not_hide_later_modules() {
    let Some(dir) = stage_module(&built_library_name()) else {
        return;
    };
    let missing = dir.path().join("absent");
    let registry = DriverRegistry::new();
    registry.add_search_path(missing.clone());
    registry.add_search_path(dir.path());

    assert_eq!(
        registry.discover(),
        Err(FactoryError::DirectoryNotFound(missing))
    );
    assert_eq!(registry.drivers(), vec!["thermo".to_string()]);
    registry
        .allocate("thermo", "sensor3", &Parameters::new())
        .expect("allocate from later directory");
    registry.shutdown();
}

#[test]
fn test_unknown_driver_is_loaded_from_search_path() {
    let Some(dir) = stage_module(&candidate_file_name("thermo")) else {
        return;
    };
    let registry = DriverRegistry::new();
    registry.add_search_path(dir.path());
    assert!(registry.drivers().is_empty());

    let h = registry
        .allocate(
            "thermo",
            "sensor4",
            &Parameters::new().with("asynchronous", "false"),
        )
        .expect("allocate through lookup");
    assert_eq!(
        registry.loaded_modules(),
        vec![dir.path().join(candidate_file_name("thermo"))]
    );
    registry
        .request_state(h, State::On)
        .expect("switch on")
        .wait()
        .expect("on");
    assert_eq!(registry.device(h).expect("device").local_state(), State::On);

    registry.deallocate(h).expect("deallocate");
    registry.shutdown();
    assert!(registry.loaded_modules().is_empty());
}

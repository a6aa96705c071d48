//! # devsupd
//!
//! Host process: loads driver modules, allocates the configured devices,
//! drives them to their startup state and keeps them alive until SIGINT or
//! SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! # Run with a host configuration
//! devsupd --config /etc/devsup/devsupd.toml
//!
//! # Extra driver directories (also read from DEVSUP_DRIVERS)
//! devsupd -c devsupd.toml --driver-path target/release
//!
//! # Print every channel as JSON and exit
//! devsupd -c devsupd.toml --list
//! ```

use clap::Parser;
use devsup_common::config::{ConfigLoader, HostConfig, LogLevel};
use devsup_common::state::State;
use devsup_core::registry::{DeviceHandle, DriverRegistry};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// devsupd - device-support host with dynamically loaded drivers
#[derive(Parser, Debug)]
#[command(name = "devsupd")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Device-support host with dynamically loaded drivers")]
#[command(long_about = None)]
struct Args {
    /// Path to the host configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Additional driver search directory (can be specified multiple times)
    #[arg(short = 'd', long = "driver-path", action = clap::ArgAction::Append)]
    driver_paths: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    /// Print every channel of the allocated devices as JSON and exit
    #[arg(short, long)]
    list: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    if let Err(e) = run() {
        error!("devsupd failed: {}", e);
        eprintln!("devsupd: {e}");
        std::process::exit(1);
    }
    Ok(())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => HostConfig::load(path)?,
        None => HostConfig::with_service_name("devsupd"),
    };
    config.validate()?;

    setup_tracing(&args, config.shared.log_level);
    info!(
        "devsupd v{} starting as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    let registry = DriverRegistry::new();
    for path in config.drivers.search_paths.iter().chain(&args.driver_paths) {
        registry.add_search_path(path.clone());
    }
    let from_env = registry.add_search_paths_from_env();
    debug!("{} search path(s) from environment", from_env);

    match registry.discover() {
        Ok(found) => info!("Discovered drivers: {:?}", found),
        Err(e) => warn!("Driver discovery incomplete: {e}; registered {:?}", registry.drivers()),
    }
    for module in &config.drivers.modules {
        let name = registry.load_module(module)?;
        info!("Loaded driver '{}' from {}", name, module.display());
    }

    for device in &config.devices {
        let handle = registry.allocate(&device.driver, &device.name, &device.parameters)?;
        info!("Allocated '{}' ({}) as {}", device.name, device.driver, handle);
        if config.startup.switch_on {
            request(&registry, handle, State::On)?;
            if config.startup.start {
                request(&registry, handle, State::Running)?;
            }
        }
    }

    if args.list {
        let channels: Vec<_> = registry.pvs().iter().map(|pv| pv.info()).collect();
        println!("{}", serde_json::to_string_pretty(&channels)?);
        registry.shutdown();
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    info!("{} device(s) running", registry.instances().len());
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    registry.shutdown();
    info!("devsupd shutdown complete");
    Ok(())
}

/// Request `target` and wait for the transition to settle.
fn request(
    registry: &DriverRegistry,
    handle: DeviceHandle,
    target: State,
) -> Result<(), Box<dyn std::error::Error>> {
    let state = registry.request_state(handle, target)?.wait()?;
    info!("Device {} is {}", handle, state);
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments and configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let directive = if args.verbose {
        LogLevel::Debug.as_directive()
    } else {
        level.as_directive()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

//! Driver registry: driver names to allocate/deallocate entries, live
//! device instances, and the channel index across every device.
//!
//! The registry is an explicit object owned by the host and passed by
//! reference; there is no global instance. A single lock serializes
//! registration, allocation and deallocation.
//!
//! # Allocation
//!
//! ```text
//! allocate(driver, instance, params)
//!   ├─ instance taken?              ─► DeviceAlreadyCreated
//!   ├─ driver unknown? look up lib<driver> on the search paths
//!   │     ├─ a search dir is missing  ─► DirectoryNotFound
//!   │     └─ not found                ─► DriverNotFound
//!   ├─ driver allocate fn            ─► AllocationFailed
//!   ├─ channel full names clash      ─► PvAlreadyDeclared
//!   ├─ root.initialize(interfaces)   ─► Initialization
//!   └─ index channels, hand out a fresh DeviceHandle
//! ```
//!
//! Driver allocate/deallocate functions and state-machine callbacks run
//! while the registry is locked during allocation and teardown; they must
//! not call back into the registry.

use crate::driver::{AllocateFn, DeallocateFn, Device, Driver};
use crate::interface::{InterfaceFactory, NullInterfaceFactory};
use crate::module::{DriverModule, DynamicModule, candidate_file_name, scan_directory, split_search_paths};
use crate::node::Node;
use crate::pv::Pv;
use crate::state_machine::TransitionHandle;
use devsup_common::consts::{DRIVER_PATH_ENV, STATE_MACHINE_NODE_NAME};
use devsup_common::error::{Error, FactoryError, NodeError};
use devsup_common::params::Parameters;
use devsup_common::state::State;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Handle of a live device. Handles are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceHandle(u64);

impl DeviceHandle {
    /// Numeric id.
    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct DriverEntry {
    allocate: AllocateFn,
    deallocate: DeallocateFn,
    module: Option<Arc<DynamicModule>>,
}

struct Instance {
    name: String,
    driver: String,
    device: Box<dyn Device>,
    deallocate: DeallocateFn,
    pvs: Vec<String>,
}

#[derive(Default)]
struct Inner {
    drivers: BTreeMap<String, DriverEntry>,
    instances: BTreeMap<DeviceHandle, Instance>,
    names: BTreeMap<String, DeviceHandle>,
    pvs: BTreeMap<String, Arc<Pv>>,
    search_paths: Vec<PathBuf>,
    next_handle: u64,
}

impl Inner {
    fn install(&mut self, module: DriverModule) -> Result<String, FactoryError> {
        let path = module.path().to_path_buf();
        let (name, allocate, deallocate, library) = module.into_entries();
        if self.drivers.contains_key(&name) {
            return Err(FactoryError::DriverAlreadyRegistered(name));
        }
        self.drivers.insert(
            name.clone(),
            DriverEntry {
                allocate,
                deallocate,
                module: Some(library),
            },
        );
        info!(driver = %name, path = %path.display(), "driver module registered");
        Ok(name)
    }

    /// Look for `lib<driver>` on the search paths and register it.
    fn locate(&mut self, driver: &str) -> Result<(), FactoryError> {
        let file = candidate_file_name(driver);
        let mut missing_dir = None;
        for dir in self.search_paths.clone() {
            if !dir.is_dir() {
                missing_dir.get_or_insert(dir);
                continue;
            }
            let path = dir.join(&file);
            if !path.is_file() {
                continue;
            }
            let module = DriverModule::load(&path)?;
            if module.name() != driver {
                return Err(FactoryError::ModuleLoadFailed {
                    path,
                    reason: format!("module exports driver '{}', not '{driver}'", module.name()),
                });
            }
            self.install(module)?;
            return Ok(());
        }
        Err(match missing_dir {
            Some(dir) => FactoryError::DirectoryNotFound(dir),
            None => FactoryError::DriverNotFound(driver.to_string()),
        })
    }

    fn remove(&mut self, handle: DeviceHandle) -> Option<Instance> {
        let instance = self.instances.remove(&handle)?;
        self.names.remove(&instance.name);
        for pv in &instance.pvs {
            self.pvs.remove(pv);
        }
        Some(instance)
    }

    fn teardown(&mut self) {
        let handles: Vec<DeviceHandle> = self.instances.keys().rev().copied().collect();
        for handle in handles {
            if let Some(instance) = self.remove(handle) {
                release(handle, instance);
            }
        }
        // Driver entries hold the module handles; dropping them unloads.
        let drivers = std::mem::take(&mut self.drivers);
        for (name, entry) in drivers {
            if let Some(module) = &entry.module {
                debug!(driver = %name, path = %module.path().display(), "unloading driver module");
            }
        }
    }
}

fn release(handle: DeviceHandle, instance: Instance) {
    let Instance {
        name,
        driver,
        device,
        deallocate,
        ..
    } = instance;
    device.root().deinitialize();
    deallocate(device);
    info!(driver = %driver, instance = %name, handle = %handle, "device deallocated");
}

/// Registry of drivers and live device instances.
pub struct DriverRegistry {
    inner: Mutex<Inner>,
    interfaces: Arc<dyn InterfaceFactory>,
}

impl DriverRegistry {
    /// Registry whose devices are not published anywhere.
    pub fn new() -> Self {
        Self::with_interface_factory(Arc::new(NullInterfaceFactory))
    }

    /// Registry publishing every device port through `interfaces`.
    pub fn with_interface_factory(interfaces: Arc<dyn InterfaceFactory>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_handle: 1,
                ..Inner::default()
            }),
            interfaces,
        }
    }

    // ─── Drivers ────────────────────────────────────────────────────

    /// Register a driver under `name`.
    ///
    /// # Errors
    ///
    /// `DriverAlreadyRegistered` if the name is taken.
    pub fn register_driver(
        &self,
        name: impl Into<String>,
        allocate: AllocateFn,
        deallocate: DeallocateFn,
    ) -> Result<(), FactoryError> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.drivers.contains_key(&name) {
            return Err(FactoryError::DriverAlreadyRegistered(name));
        }
        debug!(driver = %name, "driver registered");
        inner.drivers.insert(
            name,
            DriverEntry {
                allocate,
                deallocate,
                module: None,
            },
        );
        Ok(())
    }

    /// Register a compiled-in [`Driver`] under [`Driver::NAME`].
    pub fn register<D: Driver>(&self) -> Result<(), FactoryError> {
        self.register_driver(
            D::NAME,
            Arc::new(|instance: &str, parameters: &Parameters| {
                D::allocate(instance, parameters).map(|device| Box::new(device) as Box<dyn Device>)
            }),
            Arc::new(|device: Box<dyn Device>| drop(device)),
        )
    }

    /// Remove a driver.
    ///
    /// # Errors
    ///
    /// - `DriverNotFound` if absent
    /// - `DriverInUse` while instances of it are alive
    pub fn unregister_driver(&self, name: &str) -> Result<(), FactoryError> {
        let mut inner = self.inner.lock();
        if !inner.drivers.contains_key(name) {
            return Err(FactoryError::DriverNotFound(name.to_string()));
        }
        let live = inner
            .instances
            .values()
            .filter(|i| i.driver == name)
            .count();
        if live > 0 {
            return Err(FactoryError::DriverInUse {
                driver: name.to_string(),
                instances: live,
            });
        }
        inner.drivers.remove(name);
        debug!(driver = %name, "driver unregistered");
        Ok(())
    }

    // ─── Instances ──────────────────────────────────────────────────

    /// Allocate and initialize a device instance.
    pub fn allocate(
        &self,
        driver: &str,
        instance: &str,
        parameters: &Parameters,
    ) -> Result<DeviceHandle, FactoryError> {
        let mut inner = self.inner.lock();
        if inner.names.contains_key(instance) {
            return Err(FactoryError::DeviceAlreadyCreated(instance.to_string()));
        }
        if !inner.drivers.contains_key(driver) {
            inner.locate(driver)?;
        }
        let (allocate, deallocate) = inner
            .drivers
            .get(driver)
            .map(|e| (e.allocate.clone(), e.deallocate.clone()))
            .ok_or_else(|| FactoryError::DriverNotFound(driver.to_string()))?;

        let device = allocate(instance, parameters).map_err(|source| {
            FactoryError::AllocationFailed {
                driver: driver.to_string(),
                instance: instance.to_string(),
                source,
            }
        })?;

        let pvs = device.root().pvs();
        let mut names: Vec<String> = Vec::with_capacity(pvs.len());
        for pv in &pvs {
            let full = pv.full_name();
            if inner.pvs.contains_key(&full) || names.contains(&full) {
                deallocate(device);
                return Err(FactoryError::PvAlreadyDeclared(full));
            }
            names.push(full);
        }

        if let Err(source) = device.root().initialize(self.interfaces.as_ref()) {
            device.root().deinitialize();
            deallocate(device);
            return Err(FactoryError::Initialization {
                instance: instance.to_string(),
                source,
            });
        }

        for (name, pv) in names.iter().zip(pvs) {
            inner.pvs.insert(name.clone(), pv);
        }
        let handle = DeviceHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.names.insert(instance.to_string(), handle);
        inner.instances.insert(
            handle,
            Instance {
                name: instance.to_string(),
                driver: driver.to_string(),
                device,
                deallocate,
                pvs: names,
            },
        );
        info!(driver = %driver, instance = %instance, handle = %handle, "device allocated");
        Ok(handle)
    }

    /// Deinitialize and destroy a device.
    ///
    /// # Errors
    ///
    /// `UnknownHandle` if the handle is unknown or already deallocated.
    pub fn deallocate(&self, handle: DeviceHandle) -> Result<(), FactoryError> {
        let mut inner = self.inner.lock();
        let instance = inner
            .remove(handle)
            .ok_or(FactoryError::UnknownHandle(handle.0))?;
        release(handle, instance);
        Ok(())
    }

    /// [`Self::deallocate`] by instance name.
    ///
    /// # Errors
    ///
    /// `DeviceNotAllocated` if no live device has that name.
    pub fn deallocate_by_name(&self, instance: &str) -> Result<(), FactoryError> {
        let handle = self
            .handle_of(instance)
            .ok_or_else(|| FactoryError::DeviceNotAllocated(instance.to_string()))?;
        self.deallocate(handle)
    }

    /// Handle of a live instance.
    pub fn handle_of(&self, instance: &str) -> Option<DeviceHandle> {
        self.inner.lock().names.get(instance).copied()
    }

    /// Root node of a live device.
    ///
    /// # Errors
    ///
    /// `UnknownHandle` if the handle is not live.
    pub fn device(&self, handle: DeviceHandle) -> Result<Arc<Node>, FactoryError> {
        self.inner
            .lock()
            .instances
            .get(&handle)
            .map(|i| i.device.root().clone())
            .ok_or(FactoryError::UnknownHandle(handle.0))
    }

    /// Request a lifecycle state on a device's root state machine.
    ///
    /// # Errors
    ///
    /// `UnknownHandle`, `NodeError::NotFound` if the root has no state
    /// machine, or any transition error.
    pub fn request_state(&self, handle: DeviceHandle, target: State) -> Result<TransitionHandle, Error> {
        let root = self.device(handle)?;
        let sm = root.state_machine().ok_or_else(|| {
            NodeError::NotFound(format!("{}-{STATE_MACHINE_NODE_NAME}", root.full_name()))
        })?;
        Ok(sm.set_state(target)?)
    }

    // ─── Lookup and wiring ──────────────────────────────────────────

    /// Node with this full name in any live device.
    pub fn find_node(&self, full_name: &str) -> Option<Arc<Node>> {
        let inner = self.inner.lock();
        inner
            .instances
            .values()
            .find_map(|i| i.device.root().find_node_by_full_name(full_name))
    }

    /// Channel with this full name in any live device.
    pub fn find_pv(&self, full_name: &str) -> Option<Arc<Pv>> {
        self.inner.lock().pvs.get(full_name).cloned()
    }

    /// Every live channel, sorted by full name.
    pub fn pvs(&self) -> Vec<Arc<Pv>> {
        self.inner.lock().pvs.values().cloned().collect()
    }

    /// `subscriber.subscribe_to(source)` by full names, across devices.
    ///
    /// # Errors
    ///
    /// `MissingPv` for an unknown name, or the channel's subscription error.
    pub fn subscribe(&self, source: &str, subscriber: &str) -> Result<(), Error> {
        let (source_pv, subscriber_pv) = {
            let inner = self.inner.lock();
            let lookup = |name: &str| {
                inner
                    .pvs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| FactoryError::MissingPv(name.to_string()))
            };
            (lookup(source)?, lookup(subscriber)?)
        };
        subscriber_pv.subscribe_to(&source_pv)?;
        Ok(())
    }

    /// Run a command on the node with this full name.
    ///
    /// The registry lock is released before the command runs.
    pub fn run_command(&self, node: &str, command: &str, args: &[&str]) -> Result<String, Error> {
        let target = self
            .find_node(node)
            .ok_or_else(|| NodeError::NotFound(node.to_string()))?;
        target.run_command(command, args)
    }

    // ─── Module discovery ───────────────────────────────────────────

    /// Append a directory to the driver search path.
    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut inner = self.inner.lock();
        if !inner.search_paths.contains(&path) {
            inner.search_paths.push(path);
        }
    }

    /// Append the directories listed in `DEVSUP_DRIVERS`. Returns how many.
    pub fn add_search_paths_from_env(&self) -> usize {
        let Ok(list) = std::env::var(DRIVER_PATH_ENV) else {
            return 0;
        };
        let paths = split_search_paths(&list);
        let count = paths.len();
        for path in paths {
            self.add_search_path(path);
        }
        count
    }

    /// Current search path, in lookup order.
    pub fn search_paths(&self) -> Vec<PathBuf> {
        self.inner.lock().search_paths.clone()
    }

    /// Load every driver library found on the search path.
    ///
    /// Modules that fail to load or clash with a registered name are logged
    /// and skipped. A missing directory is logged and the remaining
    /// directories are still scanned. Returns the names registered.
    ///
    /// # Errors
    ///
    /// `DirectoryNotFound` naming the first missing search directory, after
    /// every other directory has been scanned.
    pub fn discover(&self) -> Result<Vec<String>, FactoryError> {
        let mut registered = Vec::new();
        let mut missing = None;
        for dir in self.search_paths() {
            let candidates = match scan_directory(&dir) {
                Ok(candidates) => candidates,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "skipping search directory");
                    missing.get_or_insert(e);
                    continue;
                }
            };
            for path in candidates {
                match self.load_module(&path) {
                    Ok(name) => registered.push(name),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping driver module"),
                }
            }
        }
        match missing {
            Some(e) => Err(e),
            None => Ok(registered),
        }
    }

    /// Load one driver module and register its driver.
    pub fn load_module(&self, path: &Path) -> Result<String, FactoryError> {
        let module = DriverModule::load(path)?;
        self.inner.lock().install(module)
    }

    // ─── Diagnostics ────────────────────────────────────────────────

    /// Registered driver names, sorted.
    pub fn drivers(&self) -> Vec<String> {
        self.inner.lock().drivers.keys().cloned().collect()
    }

    /// Live instance names, sorted.
    pub fn instances(&self) -> Vec<String> {
        self.inner.lock().names.keys().cloned().collect()
    }

    /// Paths of loaded driver modules, sorted by driver name.
    pub fn loaded_modules(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .drivers
            .values()
            .filter_map(|e| e.module.as_ref().map(|m| m.path().to_path_buf()))
            .collect()
    }

    // ─── Teardown ───────────────────────────────────────────────────

    /// Deallocate every instance (newest first), then drop every driver and
    /// unload its module. The registry stays usable afterwards.
    pub fn shutdown(&self) {
        self.inner.lock().teardown();
        info!("driver registry shut down");
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DriverRegistry {
    fn drop(&mut self) {
        self.inner.get_mut().teardown();
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DriverRegistry")
            .field("drivers", &inner.drivers.keys().collect::<Vec<_>>())
            .field("instances", &inner.names)
            .field("search_paths", &inner.search_paths)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::RecordingInterfaceFactory;
    use crate::state_machine::StateMachine;
    use devsup_common::error::DriverError;
    use devsup_common::time::Timestamp;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        root: Arc<Node>,
    }

    impl Device for Counter {
        fn root(&self) -> &Arc<Node> {
            &self.root
        }
    }

    impl Driver for Counter {
        const NAME: &'static str = "counter";

        fn allocate(instance: &str, parameters: &Parameters) -> Result<Self, DriverError> {
            if parameters.get("refuse").is_some() {
                return Err(DriverError::new("refused"));
            }
            let node_error = |e: NodeError| DriverError::new(e.to_string());
            let root = Node::port(instance);
            root.add_pv(Pv::variable_in::<i32>("value").build())
                .map_err(node_error)?;
            root.add_pv(Pv::variable_out::<i32>("command").build())
                .map_err(node_error)?;
            root.add_state_machine(StateMachine::builder().build())
                .map_err(node_error)?;
            Ok(Self { root })
        }
    }

    /// Root always named `fixed`, so two instances clash.
    struct Fixed {
        root: Arc<Node>,
    }

    impl Device for Fixed {
        fn root(&self) -> &Arc<Node> {
            &self.root
        }
    }

    impl Driver for Fixed {
        const NAME: &'static str = "fixed";

        fn allocate(_instance: &str, _parameters: &Parameters) -> Result<Self, DriverError> {
            let root = Node::port("fixed");
            root.add_pv(Pv::variable_in::<f64>("reading").build())
                .map_err(|e| DriverError::new(e.to_string()))?;
            Ok(Self { root })
        }
    }

    fn registry() -> DriverRegistry {
        let registry = DriverRegistry::new();
        registry.register::<Counter>().unwrap();
        registry
    }

    #[test]
    fn duplicate_driver_is_rejected() {
        let registry = registry();
        assert_eq!(
            registry.register::<Counter>(),
            Err(FactoryError::DriverAlreadyRegistered("counter".into()))
        );
        assert_eq!(registry.drivers(), vec!["counter".to_string()]);
    }

    #[test]
    fn unknown_driver_without_search_path() {
        let registry = registry();
        assert_eq!(
            registry.allocate("nope", "x", &Parameters::new()),
            Err(FactoryError::DriverNotFound("nope".into()))
        );
    }

    #[test]
    fn unknown_driver_with_missing_directory() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");
        registry.add_search_path(&missing);
        registry.add_search_path(&missing);
        assert_eq!(registry.search_paths().len(), 1);
        assert_eq!(
            registry.allocate("nope", "x", &Parameters::new()),
            Err(FactoryError::DirectoryNotFound(missing.clone()))
        );
        assert_eq!(registry.discover(), Err(FactoryError::DirectoryNotFound(missing)));
    }

    #[test]
    fn discover_names_first_missing_directory_after_full_scan() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first");
        registry.add_search_path(&first);
        registry.add_search_path(dir.path());
        registry.add_search_path(dir.path().join("second"));
        assert_eq!(registry.discover(), Err(FactoryError::DirectoryNotFound(first)));
    }

    #[test]
    fn unknown_driver_in_existing_directory() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        registry.add_search_path(dir.path());
        assert_eq!(
            registry.allocate("nope", "x", &Parameters::new()),
            Err(FactoryError::DriverNotFound("nope".into()))
        );
        assert_eq!(registry.discover(), Ok(Vec::new()));
    }

    #[test]
    fn allocate_then_deallocate() {
        let registry = registry();
        let handle = registry
            .allocate("counter", "c1", &Parameters::new())
            .unwrap();
        assert_eq!(registry.instances(), vec!["c1".to_string()]);
        assert_eq!(registry.handle_of("c1"), Some(handle));
        assert!(registry.find_pv("c1-value").is_some());
        assert!(registry.find_pv("c1-StateMachine-getState").is_some());

        let root = registry.device(handle).unwrap();
        assert_eq!(root.local_state(), State::Off);

        registry.deallocate(handle).unwrap();
        assert_eq!(
            registry.deallocate(handle),
            Err(FactoryError::UnknownHandle(handle.id()))
        );
        assert!(registry.device(handle).is_err());
        assert!(registry.find_pv("c1-value").is_none());
        assert!(registry.instances().is_empty());
    }

    #[test]
    fn handles_are_not_reused() {
        let registry = registry();
        let first = registry.allocate("counter", "c1", &Parameters::new()).unwrap();
        registry.deallocate(first).unwrap();
        let second = registry.allocate("counter", "c1", &Parameters::new()).unwrap();
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[test]
    fn duplicate_instance_name() {
        let registry = registry();
        registry.allocate("counter", "c1", &Parameters::new()).unwrap();
        assert_eq!(
            registry.allocate("counter", "c1", &Parameters::new()),
            Err(FactoryError::DeviceAlreadyCreated("c1".into()))
        );
    }

    #[test]
    fn driver_failure_leaves_registry_clean() {
        let registry = registry();
        let err = registry
            .allocate("counter", "c1", &Parameters::new().with("refuse", "1"))
            .unwrap_err();
        assert!(matches!(err, FactoryError::AllocationFailed { .. }));
        assert!(registry.instances().is_empty());
        assert!(registry.allocate("counter", "c1", &Parameters::new()).is_ok());
    }

    #[test]
    fn clashing_channels_are_rejected() {
        let registry = registry();
        registry.register::<Fixed>().unwrap();
        registry.allocate("fixed", "a", &Parameters::new()).unwrap();
        assert_eq!(
            registry.allocate("fixed", "b", &Parameters::new()),
            Err(FactoryError::PvAlreadyDeclared("fixed-reading".into()))
        );
        assert_eq!(registry.instances(), vec!["a".to_string()]);
    }

    #[test]
    fn unregister_waits_for_instances() {
        let registry = registry();
        let handle = registry.allocate("counter", "c1", &Parameters::new()).unwrap();
        assert_eq!(
            registry.unregister_driver("counter"),
            Err(FactoryError::DriverInUse {
                driver: "counter".into(),
                instances: 1
            })
        );
        registry.deallocate(handle).unwrap();
        registry.unregister_driver("counter").unwrap();
        assert_eq!(
            registry.unregister_driver("counter"),
            Err(FactoryError::DriverNotFound("counter".into()))
        );
    }

    #[test]
    fn subscribe_across_devices() {
        let registry = registry();
        registry.allocate("counter", "a", &Parameters::new()).unwrap();
        registry.allocate("counter", "b", &Parameters::new()).unwrap();
        registry.subscribe("a-command", "b-command").unwrap();

        let ts = Timestamp::new(9, 0);
        registry.find_pv("a-command").unwrap().write_as(ts, 5).unwrap();
        assert_eq!(
            registry.find_pv("b-command").unwrap().read_as::<i32>().unwrap(),
            (ts, 5)
        );
        assert_eq!(
            registry.subscribe("a-command", "nope"),
            Err(Error::Factory(FactoryError::MissingPv("nope".into())))
        );
    }

    #[test]
    fn commands_and_state_requests() {
        let registry = registry();
        let handle = registry.allocate("counter", "c1", &Parameters::new()).unwrap();
        assert_eq!(
            registry.run_command("c1", "switchOn", &[]).unwrap(),
            "ON requested"
        );
        assert_eq!(registry.device(handle).unwrap().local_state(), State::On);
        assert_eq!(
            registry.request_state(handle, State::Running).unwrap().wait(),
            Ok(State::Running)
        );
        assert!(matches!(
            registry.run_command("nowhere", "switchOn", &[]),
            Err(Error::Node(NodeError::NotFound(_)))
        ));
    }

    #[test]
    fn devices_are_published_through_interfaces() {
        let interfaces = Arc::new(RecordingInterfaceFactory::new());
        let registry = DriverRegistry::with_interface_factory(interfaces.clone());
        registry.register::<Counter>().unwrap();
        let handle = registry.allocate("counter", "c1", &Parameters::new()).unwrap();

        let recorder = interfaces.interface("c1").unwrap();
        assert!(recorder.is_terminated());
        assert!(recorder.registered().iter().any(|info| info.name == "c1-value"));

        registry.deallocate(handle).unwrap();
        assert!(recorder.registered().is_empty());
    }

    #[test]
    fn shutdown_releases_newest_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicUsize::new(0));
        let registry = DriverRegistry::new();
        let log = order.clone();
        let count = released.clone();
        registry
            .register_driver(
                "plain",
                Arc::new(|instance: &str, parameters: &Parameters| {
                    Counter::allocate(instance, parameters)
                        .map(|d| Box::new(d) as Box<dyn Device>)
                }),
                Arc::new(move |device: Box<dyn Device>| {
                    log.lock().push(device.root().name().to_string());
                    count.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
        registry.allocate("plain", "first", &Parameters::new()).unwrap();
        registry.allocate("plain", "second", &Parameters::new()).unwrap();

        registry.shutdown();
        assert_eq!(*order.lock(), vec!["second".to_string(), "first".to_string()]);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(registry.drivers().is_empty());
        assert!(registry.instances().is_empty());
    }
}

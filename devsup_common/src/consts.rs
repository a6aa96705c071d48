//! Naming and driver-module constants.

/// Separator placed between ancestor names in a fully qualified name.
pub const NAME_SEPARATOR: &str = "-";

/// Name of the node created by every state machine.
pub const STATE_MACHINE_NODE_NAME: &str = "StateMachine";

/// Channel accepting lifecycle requests (`setState`).
pub const SET_STATE_PV: &str = "setState";

/// Channel publishing the local state on every change (`getState`).
pub const GET_STATE_PV: &str = "getState";

/// Channel publishing the aggregated state of a subtree (`getGlobalState`).
pub const GET_GLOBAL_STATE_PV: &str = "getGlobalState";

/// Environment variable holding extra driver search paths.
pub const DRIVER_PATH_ENV: &str = "DEVSUP_DRIVERS";

/// Version of the driver module ABI. Bumped whenever the entry point
/// signatures or the layout of the values crossing them change.
pub const DRIVER_ABI_VERSION: u32 = 1;

/// Entry point returning [`DRIVER_ABI_VERSION`] as compiled into the module.
pub const SYMBOL_ABI_VERSION: &str = "devsup_driver_abi_version";

/// Entry point returning the NUL-terminated driver name.
pub const SYMBOL_DRIVER_NAME: &str = "devsup_driver_name";

/// Entry point allocating a device instance.
pub const SYMBOL_ALLOCATE: &str = "devsup_allocate_device";

/// Entry point releasing a device instance.
pub const SYMBOL_DEALLOCATE: &str = "devsup_deallocate_device";

/// Optional entry point handing the host's log dispatcher to the module.
pub const SYMBOL_INSTALL_DISPATCH: &str = "devsup_install_dispatch";

/// Every entry point a driver module must export.
pub const DRIVER_SYMBOLS: [&str; 4] = [
    SYMBOL_ABI_VERSION,
    SYMBOL_DRIVER_NAME,
    SYMBOL_ALLOCATE,
    SYMBOL_DEALLOCATE,
];

/// Default host configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/devsup/devsupd.toml";

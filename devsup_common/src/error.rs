//! Error types surfaced by the devsup engine.
//!
//! Each subsystem has its own enum; [`Error`] unifies them for callers that
//! cross subsystem boundaries (commands, the host binary). Nothing inside the
//! engine swallows these: every failure reaches the immediate caller.

use crate::config::ConfigError;
use crate::state::State;
use crate::value::{DataKind, Direction};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure raised by driver-supplied code (transition callbacks, delegate
/// getters and setters, allocation).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    /// Build from any message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<&str> for DriverError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for DriverError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Why a legal transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Another transition is still running.
    InFlight,
    /// The allow-transition predicate returned false.
    Predicate,
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InFlight => f.write_str("a transition is already in flight"),
            Self::Predicate => f.write_str("refused by the allow-transition predicate"),
        }
    }
}

/// Errors raised by state-machine transition requests.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    /// The requested edge is not in the transition table; state unchanged.
    #[error("no transition from {from} to {to}")]
    NoSuchTransition {
        /// State at request time.
        from: State,
        /// Requested state.
        to: State,
    },

    /// The edge exists but the request was refused; state unchanged.
    #[error("transition from {from} to {to} denied: {reason}")]
    TransitionDenied {
        /// State at request time.
        from: State,
        /// Requested state.
        to: State,
        /// Cause of the refusal.
        reason: DenyReason,
    },

    /// The transition callback failed and the machine was rolled back.
    #[error("transition from {from} to {to} failed ({cause}), rolled back to {rolled_back_to}")]
    CallbackFailed {
        /// Source state of the leg.
        from: State,
        /// Destination state of the leg.
        to: State,
        /// Error raised by the callback.
        cause: DriverError,
        /// State the machine settled on after rollback.
        rolled_back_to: State,
    },

    /// The callback failed and rollback failed too; the machine is in `FAULT`.
    #[error("transition from {from} to {to} failed ({cause}) and rollback failed ({rollback})")]
    Rollback {
        /// Source state of the leg.
        from: State,
        /// Destination state of the leg.
        to: State,
        /// Error raised by the callback.
        cause: DriverError,
        /// Error raised by the rollback hook.
        rollback: DriverError,
    },

    /// The machine was forced into `FAULT` while the transition was running.
    #[error("transition from {from} to {to} interrupted by a forced fault")]
    Faulted {
        /// Source state of the leg.
        from: State,
        /// Destination state of the leg.
        to: State,
    },

    /// The asynchronous worker thread is gone.
    #[error("state machine worker is not running")]
    WorkerUnavailable,
}

/// Errors raised by channel (PV) operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PvError {
    /// Value kind differs from the channel's declared kind.
    #[error("type mismatch on '{pv}': expected {expected}, got {found}")]
    TypeMismatch {
        /// Channel full name.
        pv: String,
        /// Declared kind.
        expected: DataKind,
        /// Offered kind.
        found: DataKind,
    },

    /// Operation not valid for the channel's direction.
    #[error("'{operation}' is not valid on {direction} channel '{pv}'")]
    WrongDirection {
        /// Channel full name.
        pv: String,
        /// Channel direction.
        direction: Direction,
        /// Attempted operation.
        operation: &'static str,
    },

    /// Output delegate without a read-back initializer.
    #[error("channel '{0}' cannot be read")]
    NotReadable(String),

    /// Array longer than the channel's maximum element count.
    #[error("channel '{pv}' accepts at most {max} elements, got {len}")]
    TooManyElements {
        /// Channel full name.
        pv: String,
        /// Offered length.
        len: usize,
        /// Declared maximum.
        max: usize,
    },

    /// Enumerated value outside the label range.
    #[error("value {value} is not a valid choice for '{pv}' ({labels} labels)")]
    InvalidEnumeration {
        /// Channel full name.
        pv: String,
        /// Offered value.
        value: i32,
        /// Number of labels.
        labels: usize,
    },

    /// Driver getter or setter failed.
    #[error("delegate of '{pv}' failed: {source}")]
    Delegate {
        /// Channel full name.
        pv: String,
        /// Driver error.
        source: DriverError,
    },

    /// Subscription would make values circulate forever.
    #[error("subscribing '{subscriber}' to '{source_pv}' would create a cycle")]
    SubscriptionCycle {
        /// Channel being subscribed to.
        source_pv: String,
        /// Subscribing channel.
        subscriber: String,
    },

    /// Write refused in the current lifecycle state.
    #[error("channel '{pv}' cannot be written while the device is {state}")]
    NotPermitted {
        /// Channel full name.
        pv: String,
        /// State of the governing state machine.
        state: State,
    },
}

/// Errors raised while building or addressing the node tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    /// A sibling with the same name already exists.
    #[error("'{parent}' already has a child named '{child}'")]
    DuplicateChild {
        /// Parent full name.
        parent: String,
        /// Rejected child name.
        child: String,
    },

    /// The node or channel is already attached elsewhere.
    #[error("'{0}' already has a parent")]
    AlreadyHasParent(String),

    /// An operation requires an enclosing port and there is none.
    #[error("no port defined above '{0}'")]
    NoPortDefined(String),

    /// No node or channel at the given path.
    #[error("'{0}' not found")]
    NotFound(String),

    /// The node does not answer to the command.
    #[error("node '{node}' has no command '{command}'")]
    CommandNotFound {
        /// Node full name.
        node: String,
        /// Command name.
        command: String,
    },

    /// Command invoked with the wrong number of arguments.
    #[error("command '{command}' on '{node}' expects {expected} parameters, got {found}")]
    WrongParameterCount {
        /// Node full name.
        node: String,
        /// Command name.
        command: String,
        /// Declared parameter count.
        expected: usize,
        /// Supplied parameter count.
        found: usize,
    },
}

/// Errors raised by the driver registry and module loading.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FactoryError {
    /// No driver registered or locatable under this name.
    #[error("driver '{0}' not found")]
    DriverNotFound(String),

    /// A driver with this name is already registered.
    #[error("driver '{0}' is already registered")]
    DriverAlreadyRegistered(String),

    /// A search directory does not exist.
    #[error("directory {} not found", .0.display())]
    DirectoryNotFound(PathBuf),

    /// A module lacks one of the driver entry points.
    #[error("module {} does not export '{symbol}'", .path.display())]
    DriverMissingRegistrationExports {
        /// Module path.
        path: PathBuf,
        /// First missing entry point.
        symbol: &'static str,
    },

    /// A module was built against a different driver ABI.
    #[error("module {} uses driver ABI {found}, expected {expected}", .path.display())]
    IncompatibleAbi {
        /// Module path.
        path: PathBuf,
        /// ABI reported by the module.
        found: u32,
        /// ABI of this host.
        expected: u32,
    },

    /// The dynamic loader refused the module.
    #[error("cannot load module {}: {reason}", .path.display())]
    ModuleLoadFailed {
        /// Module path.
        path: PathBuf,
        /// Loader message.
        reason: String,
    },

    /// Instance name already in use.
    #[error("device '{0}' already created")]
    DeviceAlreadyCreated(String),

    /// Handle unknown or already deallocated.
    #[error("unknown device handle #{0}")]
    UnknownHandle(u64),

    /// No live device with this instance name.
    #[error("device '{0}' is not allocated")]
    DeviceNotAllocated(String),

    /// Driver still has live instances.
    #[error("driver '{driver}' still has {instances} live instance(s)")]
    DriverInUse {
        /// Driver name.
        driver: String,
        /// Live instance count.
        instances: usize,
    },

    /// The driver's allocate function failed.
    #[error("driver '{driver}' failed to allocate '{instance}': {source}")]
    AllocationFailed {
        /// Driver name.
        driver: String,
        /// Instance name.
        instance: String,
        /// Driver error.
        source: DriverError,
    },

    /// Registering the device's channels with its port failed.
    #[error("device '{instance}' failed to initialize: {source}")]
    Initialization {
        /// Instance name.
        instance: String,
        /// Node error.
        source: NodeError,
    },

    /// Two live devices declare a channel with the same full name.
    #[error("channel '{0}' already declared")]
    PvAlreadyDeclared(String),

    /// No live channel with this full name.
    #[error("channel '{0}' not found")]
    MissingPv(String),
}

/// Failure converting timestamps between epochs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeConversionError {
    /// Instant not representable in the target epoch.
    #[error("timestamp {secs}.{nanos:09} out of range for {target} time")]
    OutOfRange {
        /// Seconds since the UNIX epoch.
        secs: i64,
        /// Nanoseconds.
        nanos: u32,
        /// Target representation.
        target: &'static str,
    },

    /// Nanosecond field not below one second.
    #[error("invalid nanosecond field {0}")]
    InvalidNanoseconds(u32),
}

/// Any devsup error.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// State-machine failure.
    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    /// Channel failure.
    #[error(transparent)]
    Pv(#[from] PvError),

    /// Node-tree failure.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Registry or module failure.
    #[error(transparent)]
    Factory(#[from] FactoryError),

    /// Timestamp conversion failure.
    #[error(transparent)]
    Time(#[from] TimeConversionError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Driver failure.
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Result alias over [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_errors_name_states() {
        let err = StateMachineError::NoSuchTransition {
            from: State::Off,
            to: State::Running,
        };
        assert_eq!(err.to_string(), "no transition from OFF to RUNNING");

        let err = StateMachineError::TransitionDenied {
            from: State::Off,
            to: State::On,
            reason: DenyReason::InFlight,
        };
        assert!(err.to_string().contains("already in flight"));
    }

    #[test]
    fn rollback_reports_both_errors() {
        let err = StateMachineError::Rollback {
            from: State::On,
            to: State::Running,
            cause: DriverError::new("pump stalled"),
            rollback: DriverError::new("valve stuck"),
        };
        let text = err.to_string();
        assert!(text.contains("pump stalled"));
        assert!(text.contains("valve stuck"));
    }

    #[test]
    fn factory_errors_display_paths() {
        let err = FactoryError::DirectoryNotFound(PathBuf::from("/opt/drivers"));
        assert_eq!(err.to_string(), "directory /opt/drivers not found");
    }

    #[test]
    fn umbrella_converts() {
        let err: Error = FactoryError::UnknownHandle(3).into();
        assert!(matches!(err, Error::Factory(FactoryError::UnknownHandle(3))));
        let err: Error = DriverError::from("boom").into();
        assert_eq!(err.to_string(), "boom");
    }
}

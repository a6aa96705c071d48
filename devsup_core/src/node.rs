//! The device tree: named nodes owning channels, child nodes and at most one
//! state machine.
//!
//! A node's full name joins its ancestors' names with `-`
//! (`probe1-Acquisition-Data`). Names are unique among siblings, channels and
//! nodes sharing one namespace. Port nodes are the points where the tree
//! meets the control system: each one obtains an interface adapter when the
//! device is initialized, and every channel below it is registered there.
//!
//! # Services provided to the subtree
//!
//! | Service | Resolution |
//! |---------|------------|
//! | timestamp | own source, else parent's, else wall clock |
//! | governing state | nearest state machine walking up |
//! | global state | highest-priority state of the subtree |
//! | interface | nearest port walking up |

use crate::interface::{ControlSystemInterface, InterfaceFactory};
use crate::node_log;
use crate::pv::Pv;
use crate::state_machine::StateMachine;
use devsup_common::config::LogLevel;
use devsup_common::consts::{NAME_SEPARATOR, STATE_MACHINE_NODE_NAME};
use devsup_common::error::{Error, NodeError};
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

/// Driver-defined command handler. Receives the arguments, returns a reply.
pub type CommandFn = Arc<dyn Fn(&[&str]) -> Result<String, Error> + Send + Sync>;

/// Timestamp source installed on a node.
pub type TimestampFn = Arc<dyn Fn() -> Timestamp + Send + Sync>;

const LOG_LEVEL_COMMANDS: [(&str, LogLevel); 5] = [
    ("setLogLevelDebug", LogLevel::Debug),
    ("setLogLevelInfo", LogLevel::Info),
    ("setLogLevelWarning", LogLevel::Warning),
    ("setLogLevelError", LogLevel::Error),
    ("setLogLevelNone", LogLevel::None),
];

const STATE_COMMANDS: [&str; 5] = ["switchOn", "switchOff", "start", "stop", "recover"];

/// Role of a node in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Ordinary container.
    Plain,
    /// Boundary towards the control-system interface.
    Port,
}

struct Command {
    usage: String,
    parameters: usize,
    run: CommandFn,
}

/// A named container of channels, child nodes and an optional state machine.
pub struct Node {
    name: String,
    kind: NodeKind,
    parent: OnceLock<Weak<Node>>,
    children: RwLock<Vec<Arc<Node>>>,
    pvs: RwLock<Vec<Arc<Pv>>>,
    state_machine: OnceLock<Arc<StateMachine>>,
    timestamp_source: RwLock<Option<TimestampFn>>,
    log_level: AtomicU8,
    commands: RwLock<BTreeMap<String, Command>>,
    interface: RwLock<Option<Arc<dyn ControlSystemInterface>>>,
}

impl Node {
    /// Plain node.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::bare(name.into(), NodeKind::Plain, Vec::new()))
    }

    /// Port node.
    pub fn port(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::bare(name.into(), NodeKind::Port, Vec::new()))
    }

    /// Plain node created together with its channels.
    pub(crate) fn with_pvs(name: &str, pvs: Vec<Arc<Pv>>) -> Arc<Self> {
        Arc::new_cyclic(|me| {
            for pv in &pvs {
                pv.attach_owner(me.clone());
            }
            Self::bare(name.to_string(), NodeKind::Plain, pvs)
        })
    }

    fn bare(name: String, kind: NodeKind, pvs: Vec<Arc<Pv>>) -> Self {
        Self {
            name,
            kind,
            parent: OnceLock::new(),
            children: RwLock::new(Vec::new()),
            pvs: RwLock::new(pvs),
            state_machine: OnceLock::new(),
            timestamp_source: RwLock::new(None),
            log_level: AtomicU8::new(LogLevel::default() as u8),
            commands: RwLock::new(BTreeMap::new()),
            interface: RwLock::new(None),
        }
    }

    // ─── Naming ─────────────────────────────────────────────────────

    /// Local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of the node.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// True for port nodes.
    pub fn is_port(&self) -> bool {
        self.kind == NodeKind::Port
    }

    /// Ancestor names and the own name joined with `-`.
    pub fn full_name(&self) -> String {
        match self.parent() {
            Some(parent) => format!("{}{}{}", parent.full_name(), NAME_SEPARATOR, self.name),
            None => self.name.clone(),
        }
    }

    /// Full name starting at the nearest enclosing port (exclusive).
    ///
    /// # Errors
    ///
    /// `NodeError::NoPortDefined` if no ancestor is a port.
    pub fn full_name_from_port(&self) -> Result<String, NodeError> {
        if self.is_port() {
            return Ok(String::new());
        }
        match self.parent() {
            Some(parent) => {
                let prefix = parent.full_name_from_port()?;
                if prefix.is_empty() {
                    Ok(self.name.clone())
                } else {
                    Ok(format!("{prefix}{NAME_SEPARATOR}{}", self.name))
                }
            }
            None => Err(NodeError::NoPortDefined(self.name.clone())),
        }
    }

    // ─── Tree structure ─────────────────────────────────────────────

    /// Parent node, if attached.
    pub fn parent(&self) -> Option<Arc<Node>> {
        self.parent.get().and_then(Weak::upgrade)
    }

    /// Direct children, in insertion order.
    pub fn children(&self) -> Vec<Arc<Node>> {
        self.children.read().clone()
    }

    /// Channels owned directly by this node.
    pub fn channels(&self) -> Vec<Arc<Pv>> {
        self.pvs.read().clone()
    }

    /// Every channel in the subtree, depth first.
    pub fn pvs(&self) -> Vec<Arc<Pv>> {
        let mut all = self.channels();
        for child in self.children() {
            all.extend(child.pvs());
        }
        all
    }

    /// Attach a child node.
    ///
    /// # Errors
    ///
    /// - `NodeError::DuplicateChild` if a sibling node or channel has the name
    /// - `NodeError::AlreadyHasParent` if `child` is attached elsewhere
    pub fn add_node(self: &Arc<Self>, child: Arc<Node>) -> Result<Arc<Node>, NodeError> {
        let mut children = self.children.write();
        self.check_unique(&children, &child.name)?;
        if child.parent.set(Arc::downgrade(self)).is_err() {
            return Err(NodeError::AlreadyHasParent(child.full_name()));
        }
        children.push(child.clone());
        Ok(child)
    }

    /// Attach a channel.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add_node`].
    pub fn add_pv(self: &Arc<Self>, pv: Arc<Pv>) -> Result<Arc<Pv>, NodeError> {
        let children = self.children.read();
        self.check_unique(&children, pv.name())?;
        let mut pvs = self.pvs.write();
        if pvs.iter().any(|p| p.name() == pv.name()) {
            return Err(self.duplicate(pv.name()));
        }
        if pv.has_owner() || !pv.attach_owner(Arc::downgrade(self)) {
            return Err(NodeError::AlreadyHasParent(pv.full_name()));
        }
        pvs.push(pv.clone());
        Ok(pv)
    }

    /// Attach the node's state machine; its `StateMachine` node becomes a child.
    ///
    /// # Errors
    ///
    /// `NodeError::DuplicateChild` if the node already has a state machine.
    pub fn add_state_machine(
        self: &Arc<Self>,
        state_machine: Arc<StateMachine>,
    ) -> Result<Arc<StateMachine>, NodeError> {
        if self.state_machine.get().is_some() {
            return Err(self.duplicate(STATE_MACHINE_NODE_NAME));
        }
        self.add_node(state_machine.node().clone())?;
        if self.state_machine.set(state_machine.clone()).is_err() {
            return Err(self.duplicate(STATE_MACHINE_NODE_NAME));
        }
        Ok(state_machine)
    }

    fn check_unique(&self, children: &[Arc<Node>], name: &str) -> Result<(), NodeError> {
        let taken = children.iter().any(|c| c.name == name)
            || self.pvs.read().iter().any(|p| p.name() == name);
        if taken {
            Err(self.duplicate(name))
        } else {
            Ok(())
        }
    }

    fn duplicate(&self, child: &str) -> NodeError {
        NodeError::DuplicateChild {
            parent: self.full_name(),
            child: child.to_string(),
        }
    }

    // ─── Lookup ─────────────────────────────────────────────────────

    /// Descendant at a path relative to this node (`"Acquisition"`,
    /// `"Acquisition-StateMachine"`). An empty path is the node itself.
    pub fn find_node(self: &Arc<Self>, path: &str) -> Option<Arc<Node>> {
        if path.is_empty() {
            return Some(self.clone());
        }
        self.find_node_by_full_name(&self.join(path))
    }

    /// Node in this subtree with the given full name.
    pub fn find_node_by_full_name(self: &Arc<Self>, full_name: &str) -> Option<Arc<Node>> {
        let own = self.full_name();
        if own == full_name {
            return Some(self.clone());
        }
        if !full_name.starts_with(&own) {
            return None;
        }
        self.children()
            .iter()
            .find_map(|child| child.find_node_by_full_name(full_name))
    }

    /// Channel at a path relative to this node (`"setpoint"`, `"Acquisition-Data"`).
    pub fn find_pv(&self, path: &str) -> Option<Arc<Pv>> {
        self.find_pv_by_full_name(&self.join(path))
    }

    /// Channel in this subtree with the given full name.
    pub fn find_pv_by_full_name(&self, full_name: &str) -> Option<Arc<Pv>> {
        self.pvs().into_iter().find(|pv| pv.full_name() == full_name)
    }

    fn join(&self, path: &str) -> String {
        format!("{}{}{}", self.full_name(), NAME_SEPARATOR, path)
    }

    // ─── Lifecycle state ────────────────────────────────────────────

    /// The node's own state machine.
    pub fn state_machine(&self) -> Option<Arc<StateMachine>> {
        self.state_machine.get().cloned()
    }

    /// Own state machine, else the nearest ancestor's.
    pub fn nearest_state_machine(&self) -> Option<Arc<StateMachine>> {
        match self.state_machine() {
            Some(sm) => Some(sm),
            None => self.parent().and_then(|p| p.nearest_state_machine()),
        }
    }

    /// State of the own state machine, `UNKNOWN` without one.
    pub fn local_state(&self) -> State {
        self.state_machine().map_or(State::Unknown, |sm| sm.state())
    }

    /// Highest-priority state among this node's machine and every descendant's.
    pub fn global_state(&self) -> State {
        self.children()
            .iter()
            .map(|child| child.global_state())
            .fold(self.local_state(), State::max)
    }

    /// State that gates writes on channels of this node.
    pub fn governing_state(&self) -> State {
        self.nearest_state_machine()
            .map_or(State::Unknown, |sm| sm.state())
    }

    // ─── Timestamps ─────────────────────────────────────────────────

    /// Install the timestamp source used by this subtree.
    pub fn set_timestamp_source<F>(&self, source: F)
    where
        F: Fn() -> Timestamp + Send + Sync + 'static,
    {
        *self.timestamp_source.write() = Some(Arc::new(source));
    }

    /// Current time according to this node.
    pub fn timestamp(&self) -> Timestamp {
        let source = self.timestamp_source.read().clone();
        match (source, self.parent()) {
            (Some(source), _) => source(),
            (None, Some(parent)) => parent.timestamp(),
            (None, None) => Timestamp::now(),
        }
    }

    // ─── Logging ────────────────────────────────────────────────────

    /// Current severity filter.
    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_u8(self.log_level.load(Ordering::Relaxed)).unwrap_or_default()
    }

    /// Set the severity filter of this node and every descendant.
    pub fn set_log_level(&self, level: LogLevel) {
        self.log_level.store(level as u8, Ordering::Relaxed);
        for child in self.children() {
            child.set_log_level(level);
        }
    }

    /// True if a message of `severity` passes this node's filter.
    pub fn log_enabled(&self, severity: LogLevel) -> bool {
        self.log_level().allows(severity)
    }

    // ─── Commands ───────────────────────────────────────────────────

    /// Register a driver command taking exactly `parameters` arguments.
    ///
    /// # Errors
    ///
    /// `NodeError::DuplicateChild` if the command name is taken.
    pub fn define_command<F>(
        &self,
        name: impl Into<String>,
        usage: impl Into<String>,
        parameters: usize,
        run: F,
    ) -> Result<(), NodeError>
    where
        F: Fn(&[&str]) -> Result<String, Error> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.is_builtin_command(&name) {
            return Err(self.duplicate(&name));
        }
        let mut commands = self.commands.write();
        if commands.contains_key(&name) {
            return Err(self.duplicate(&name));
        }
        commands.insert(
            name,
            Command {
                usage: usage.into(),
                parameters,
                run: Arc::new(run),
            },
        );
        Ok(())
    }

    /// Names of every command this node answers, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut names: Vec<String> = LOG_LEVEL_COMMANDS
            .iter()
            .map(|(name, _)| name.to_string())
            .collect();
        if self.state_machine.get().is_some() {
            names.extend(STATE_COMMANDS.iter().map(|s| s.to_string()));
        }
        names.extend(self.commands.read().keys().cloned());
        names.sort();
        names
    }

    /// Usage string of a driver command.
    pub fn command_usage(&self, name: &str) -> Option<String> {
        self.commands.read().get(name).map(|c| c.usage.clone())
    }

    /// Run a command.
    ///
    /// Built-in commands: `setLogLevel{Debug,Info,Warning,Error,None}` on
    /// every node; `switchOn`, `switchOff`, `start`, `stop`, `recover` on
    /// nodes owning a state machine. Lifecycle commands return once the
    /// request is accepted.
    pub fn run_command(&self, command: &str, args: &[&str]) -> Result<String, Error> {
        if let Some((_, level)) = LOG_LEVEL_COMMANDS.iter().find(|(n, _)| *n == command) {
            self.expect_parameters(command, 0, args.len())?;
            self.set_log_level(*level);
            return Ok(format!("log level set to {level:?}"));
        }

        if let Some(sm) = self.state_machine()
            && STATE_COMMANDS.contains(&command)
        {
            self.expect_parameters(command, 0, args.len())?;
            let handle = match command {
                "switchOn" => sm.switch_on(),
                "switchOff" => sm.switch_off(),
                "start" => sm.start(),
                "stop" => sm.stop(),
                _ => sm.recover(),
            }?;
            return Ok(format!("{} requested", handle.requested()));
        }

        let (parameters, run) = {
            let commands = self.commands.read();
            let entry = commands
                .get(command)
                .ok_or_else(|| NodeError::CommandNotFound {
                    node: self.full_name(),
                    command: command.to_string(),
                })?;
            (entry.parameters, entry.run.clone())
        };
        self.expect_parameters(command, parameters, args.len())?;
        run(args)
    }

    fn is_builtin_command(&self, name: &str) -> bool {
        LOG_LEVEL_COMMANDS.iter().any(|(n, _)| *n == name) || STATE_COMMANDS.contains(&name)
    }

    fn expect_parameters(&self, command: &str, expected: usize, found: usize) -> Result<(), NodeError> {
        if expected == found {
            Ok(())
        } else {
            Err(NodeError::WrongParameterCount {
                node: self.full_name(),
                command: command.to_string(),
                expected,
                found,
            })
        }
    }

    // ─── Interface wiring ───────────────────────────────────────────

    /// Interface of the nearest enclosing port.
    pub fn port_interface(&self) -> Option<Arc<dyn ControlSystemInterface>> {
        if self.is_port() {
            return self.interface.read().clone();
        }
        self.parent().and_then(|p| p.port_interface())
    }

    /// Register the subtree with the control system and settle state machines.
    ///
    /// Ports obtain an interface from `interfaces`; every channel is
    /// registered with its nearest port; state machines move from `UNKNOWN`
    /// to `OFF`.
    ///
    /// # Errors
    ///
    /// `NodeError::NoPortDefined` if a node owning channels has no port above it.
    pub fn initialize(self: &Arc<Self>, interfaces: &dyn InterfaceFactory) -> Result<(), NodeError> {
        if self.is_port() {
            let mut slot = self.interface.write();
            if slot.is_none() {
                *slot = Some(interfaces.create(&self.full_name()));
            }
        }

        let channels = self.channels();
        if !channels.is_empty() {
            let interface = self
                .port_interface()
                .ok_or_else(|| NodeError::NoPortDefined(self.full_name()))?;
            for pv in channels {
                pv.attach_interface(interface.clone());
                interface.register_pv(&pv);
            }
        }

        for child in self.children() {
            child.initialize(interfaces)?;
        }

        if let Some(sm) = self.state_machine() {
            sm.settle();
        }

        if self.is_port()
            && let Some(interface) = self.interface.read().clone()
        {
            interface.registration_terminated();
        }
        node_log!(self, LogLevel::Debug, "initialized");
        Ok(())
    }

    /// Deregister the subtree from the control system.
    pub fn deinitialize(&self) {
        for pv in self.channels() {
            if let Some(interface) = pv.detach_interface() {
                interface.deregister_pv(&pv);
            }
        }
        for child in self.children() {
            child.deinitialize();
        }
        if self.is_port() {
            self.interface.write().take();
        }
        node_log!(self, LogLevel::Debug, "deinitialized");
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("children", &self.children.read().len())
            .field("pvs", &self.pvs.read().len())
            .finish()
    }
}

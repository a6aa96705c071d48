//! Lifecycle state machine with rollback-capable transitions.
//!
//! Every device node may own one [`StateMachine`]. It enforces the fixed
//! state graph of [`leg`], runs the driver's transition callbacks and
//! publishes every state change on its `getState` channel.
//!
//! # Module Structure
//!
//! - [`Leg`] / [`legal_transitions_from`] - The transition table
//! - [`TransitionHandle`] - Result handle returned by every request
//! - `worker` - Per-instance thread for asynchronous machines
//!
//! # Transition protocol
//!
//! ```text
//!  request(T) ──► in flight? ──yes──► TransitionDenied
//!                     │no
//!                 legal edge? ──no──► NoSuchTransition
//!                     │yes
//!                 allow(S, T)? ──no──► TransitionDenied
//!                     │yes
//!                 enter transient, publish
//!                     │
//!                 callback (caller thread | worker thread)
//!                 ├─ ok ──────────────────────────► destination
//!                 └─ err ─► rollback hook ─ ok ───► source | destination (RollbackTarget)
//!                                          └ err ─► FAULT (Rollback error)
//! ```
//!
//! In synchronous mode the callback runs before `set_state` returns and a
//! failed callback is returned directly as the error. In asynchronous mode
//! `set_state` returns once the transient state is entered; the outcome is
//! delivered through the [`TransitionHandle`]. There is no cancellation and
//! no timeout: a callback that hangs keeps the machine in its transient
//! state and the worker thread blocked. A callback that panics counts as a
//! failed callback and goes through the rollback path.

mod handle;
mod leg;
mod worker;

pub use handle::{TransitionHandle, TransitionOutcome};
pub use leg::{Leg, RollbackTarget, legal_transitions_from};

use crate::node::Node;
use crate::node_log;
use crate::pv::Pv;
use devsup_common::config::LogLevel;
use devsup_common::consts::{
    GET_GLOBAL_STATE_PV, GET_STATE_PV, SET_STATE_PV, STATE_MACHINE_NODE_NAME,
};
use devsup_common::error::{DenyReason, DriverError, StateMachineError};
use devsup_common::state::State;
use devsup_common::value::ScanPolicy;
use leg::{Edge, classify};
use parking_lot::Mutex;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::debug;
use worker::{Job, Worker};

/// Driver callback run during a transition leg (or its rollback).
pub type TransitionFn = Arc<dyn Fn() -> Result<(), DriverError> + Send + Sync>;

/// Allow-transition predicate, called with `(current, requested)`.
pub type AllowFn = Arc<dyn Fn(State, State) -> bool + Send + Sync>;

#[derive(Clone, Default)]
struct LegConfig {
    callback: Option<TransitionFn>,
    rollback: Option<TransitionFn>,
    target: RollbackTarget,
}

#[derive(Debug, Default)]
struct Shared {
    state: State,
    in_flight: Option<Leg>,
    faulted_in_flight: bool,
}

enum Begin {
    Done(State),
    Run(Leg),
}

/// State shared between the machine and its worker thread.
pub(crate) struct Core {
    shared: Mutex<Shared>,
    legs: [LegConfig; 5],
    allow: Option<AllowFn>,
    node: Arc<Node>,
    get_state: Arc<Pv>,
    get_global_state: Arc<Pv>,
}

impl Core {
    fn state(&self) -> State {
        self.shared.lock().state
    }

    fn begin(&self, target: State, only: Option<Leg>) -> Result<(State, Begin), StateMachineError> {
        let (from, busy) = {
            let shared = self.shared.lock();
            (shared.state, shared.in_flight.is_some())
        };
        let denied = |reason| StateMachineError::TransitionDenied {
            from,
            to: target,
            reason,
        };
        if busy {
            return Err(denied(DenyReason::InFlight));
        }

        let edge = classify(from, target)
            .filter(|edge| only.is_none_or(|leg| *edge == Edge::Leg(leg)))
            .ok_or(StateMachineError::NoSuchTransition { from, to: target })?;

        // Evaluated unlocked: the predicate may read the machine.
        if let Some(allow) = &self.allow
            && !allow(from, target)
        {
            return Err(denied(DenyReason::Predicate));
        }

        let begin = {
            let mut shared = self.shared.lock();
            if shared.state != from || shared.in_flight.is_some() {
                return Err(denied(DenyReason::InFlight));
            }
            match edge {
                Edge::Settle => {
                    shared.state = State::Off;
                    Begin::Done(State::Off)
                }
                Edge::Fault => {
                    shared.state = State::Fault;
                    Begin::Done(State::Fault)
                }
                Edge::Leg(leg) => {
                    shared.state = leg.transient();
                    shared.in_flight = Some(leg);
                    shared.faulted_in_flight = false;
                    Begin::Run(leg)
                }
            }
        };

        node_log!(self.node, LogLevel::Info, from = %from, to = %target, "transition accepted");
        self.publish();
        Ok((from, begin))
    }

    pub(crate) fn run(&self, leg: Leg) -> TransitionOutcome {
        let config = &self.legs[leg.index()];
        let (from, to) = (leg.source(), leg.destination());

        let cause = match invoke(&config.callback) {
            Ok(()) => return self.finish(leg, to),
            Err(cause) => cause,
        };
        node_log!(
            self.node,
            LogLevel::Warning,
            leg = leg.name(),
            error = %cause,
            "transition callback failed, rolling back"
        );

        match invoke(&config.rollback) {
            Ok(()) => {
                let rolled_back_to = config.target.state_for(leg);
                self.finish(leg, rolled_back_to)?;
                Err(StateMachineError::CallbackFailed {
                    from,
                    to,
                    cause,
                    rolled_back_to,
                })
            }
            Err(rollback) => {
                node_log!(
                    self.node,
                    LogLevel::Error,
                    leg = leg.name(),
                    error = %rollback,
                    "rollback failed, entering FAULT"
                );
                let _ = self.finish(leg, State::Fault);
                Err(StateMachineError::Rollback {
                    from,
                    to,
                    cause,
                    rollback,
                })
            }
        }
    }

    fn finish(&self, leg: Leg, state: State) -> TransitionOutcome {
        let outcome = {
            let mut shared = self.shared.lock();
            shared.in_flight = None;
            if std::mem::take(&mut shared.faulted_in_flight) {
                Err(StateMachineError::Faulted {
                    from: leg.source(),
                    to: leg.destination(),
                })
            } else {
                shared.state = state;
                Ok(state)
            }
        };
        if outcome.is_ok() {
            self.publish();
        }
        outcome
    }

    fn abort(&self, leg: Leg) {
        {
            let mut shared = self.shared.lock();
            shared.in_flight = None;
            if !std::mem::take(&mut shared.faulted_in_flight) {
                shared.state = leg.source();
            }
        }
        self.publish();
    }

    fn force_fault(&self) -> bool {
        {
            let mut shared = self.shared.lock();
            if shared.state == State::Fault {
                return false;
            }
            shared.state = State::Fault;
            if shared.in_flight.is_some() {
                shared.faulted_in_flight = true;
            }
        }
        node_log!(self.node, LogLevel::Error, "forced into FAULT");
        self.publish();
        true
    }

    /// Push the local state, then the global state of every enclosing machine.
    fn publish(&self) {
        let state = self.state();
        let timestamp = self.node.timestamp();
        if let Err(e) = self.get_state.push_as(timestamp, state as i32) {
            debug!(error = %e, "getState subscriber rejected update");
        }

        let mut ancestor = self.node.parent();
        while let Some(node) = ancestor {
            if let Some(sm) = node.state_machine() {
                let global = node.global_state();
                if let Err(e) = sm.core.get_global_state.push_as(timestamp, global as i32) {
                    debug!(error = %e, "getGlobalState subscriber rejected update");
                }
            }
            ancestor = node.parent();
        }
    }
}

/// Run a driver callback. A panic is reported as a failure of the callback.
fn invoke(callback: &Option<TransitionFn>) -> Result<(), DriverError> {
    let Some(f) = callback else {
        return Ok(());
    };
    panic::catch_unwind(AssertUnwindSafe(|| f())).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Err(DriverError::new(format!("callback panicked: {message}")))
    })
}

/// Lifecycle state machine of a device node.
///
/// Built with [`StateMachine::builder`] and attached with
/// [`Node::add_state_machine`]; it then owns a child node named
/// `StateMachine` exposing `setState`, `getState` and `getGlobalState`.
pub struct StateMachine {
    core: Arc<Core>,
    asynchronous: bool,
    worker: Mutex<Option<Worker>>,
}

impl StateMachine {
    /// Start configuring a machine.
    pub fn builder() -> StateMachineBuilder {
        StateMachineBuilder::default()
    }

    /// The `StateMachine` node holding the state channels.
    pub fn node(&self) -> &Arc<Node> {
        &self.core.node
    }

    /// Current local state.
    pub fn state(&self) -> State {
        self.core.state()
    }

    /// Highest-priority state of the owning node's subtree.
    pub fn global_state(&self) -> State {
        self.core
            .node
            .parent()
            .map_or_else(|| self.state(), |owner| owner.global_state())
    }

    /// True when callbacks run on the worker thread.
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// True while a callback-backed leg is running.
    pub fn is_transition_in_flight(&self) -> bool {
        self.core.shared.lock().in_flight.is_some()
    }

    /// States that may be requested from the current state.
    pub fn legal_transitions(&self) -> Vec<State> {
        legal_transitions_from(self.state())
    }

    /// Request `target`, naming either a leg's transient or final state,
    /// `OFF` from `UNKNOWN`, or `FAULT` from anywhere.
    ///
    /// # Errors
    ///
    /// - `NoSuchTransition` if the edge is not in the table (state unchanged)
    /// - `TransitionDenied` if a transition is in flight or the predicate refuses
    /// - synchronous mode only: `CallbackFailed` / `Rollback` / `Faulted`
    /// - `WorkerUnavailable` if the worker thread cannot be started
    pub fn set_state(&self, target: State) -> Result<TransitionHandle, StateMachineError> {
        self.request(target, None)
    }

    /// `OFF → ON`.
    pub fn switch_on(&self) -> Result<TransitionHandle, StateMachineError> {
        self.request_leg(Leg::SwitchOn)
    }

    /// `ON → OFF`.
    pub fn switch_off(&self) -> Result<TransitionHandle, StateMachineError> {
        self.request_leg(Leg::SwitchOff)
    }

    /// `ON → RUNNING`.
    pub fn start(&self) -> Result<TransitionHandle, StateMachineError> {
        self.request_leg(Leg::Start)
    }

    /// `RUNNING → ON`.
    pub fn stop(&self) -> Result<TransitionHandle, StateMachineError> {
        self.request_leg(Leg::Stop)
    }

    /// `FAULT → OFF`.
    pub fn recover(&self) -> Result<TransitionHandle, StateMachineError> {
        self.request_leg(Leg::Recover)
    }

    /// Driver-reported failure: enter `FAULT` unless a transition is in flight.
    pub fn fault(&self) -> Result<TransitionHandle, StateMachineError> {
        self.set_state(State::Fault)
    }

    /// Enter `FAULT` unconditionally. An in-flight transition then finishes
    /// with `Faulted` and leaves the state alone. Returns false if already faulty.
    pub fn force_fault(&self) -> bool {
        self.core.force_fault()
    }

    pub(crate) fn settle(&self) {
        if self.state() == State::Unknown
            && let Err(e) = self.set_state(State::Off)
        {
            debug!(error = %e, "state machine did not settle");
        }
    }

    fn request_leg(&self, leg: Leg) -> Result<TransitionHandle, StateMachineError> {
        self.request(leg.destination(), Some(leg))
    }

    fn request(
        &self,
        target: State,
        only: Option<Leg>,
    ) -> Result<TransitionHandle, StateMachineError> {
        let (from, begin) = self.core.begin(target, only)?;
        let leg = match begin {
            Begin::Done(state) => return Ok(TransitionHandle::finished(from, target, Ok(state))),
            Begin::Run(leg) => leg,
        };

        if !self.asynchronous {
            let state = self.core.run(leg)?;
            return Ok(TransitionHandle::finished(from, target, Ok(state)));
        }

        let (handle, completer) = TransitionHandle::pending(from, target);
        self.dispatch(Job {
            core: self.core.clone(),
            leg,
            completer,
        })?;
        Ok(handle)
    }

    fn dispatch(&self, job: Job) -> Result<(), StateMachineError> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            let owner = self
                .core
                .node
                .parent()
                .map_or_else(|| STATE_MACHINE_NODE_NAME.to_string(), |p| p.full_name());
            match Worker::spawn(format!("sm-{owner}")) {
                Ok(spawned) => *worker = Some(spawned),
                Err(e) => {
                    node_log!(self.core.node, LogLevel::Error, error = %e, "cannot spawn worker");
                    let leg = job.leg;
                    drop(job);
                    self.core.abort(leg);
                    return Err(StateMachineError::WorkerUnavailable);
                }
            }
        }

        if let Some(running) = worker.as_ref()
            && let Err(job) = running.submit(job)
        {
            let leg = job.leg;
            drop(job);
            self.core.abort(leg);
            return Err(StateMachineError::WorkerUnavailable);
        }
        Ok(())
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.state())
            .field("asynchronous", &self.asynchronous)
            .finish()
    }
}

/// Builder for [`StateMachine`]. Missing callbacks succeed trivially.
#[derive(Default)]
#[must_use = "call build() to obtain the state machine"]
pub struct StateMachineBuilder {
    asynchronous: bool,
    legs: [LegConfig; 5],
    allow: Option<AllowFn>,
}

impl StateMachineBuilder {
    /// Run callbacks on a dedicated worker thread (default: caller's thread).
    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    /// Callback of the `switchOn` leg.
    pub fn on_switch_on<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_transition(Leg::SwitchOn, f)
    }

    /// Callback of the `switchOff` leg.
    pub fn on_switch_off<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_transition(Leg::SwitchOff, f)
    }

    /// Callback of the `start` leg.
    pub fn on_start<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_transition(Leg::Start, f)
    }

    /// Callback of the `stop` leg.
    pub fn on_stop<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_transition(Leg::Stop, f)
    }

    /// Callback of the `recover` leg.
    pub fn on_recover<F>(self, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_transition(Leg::Recover, f)
    }

    /// Callback of any leg.
    pub fn on_transition<F>(mut self, leg: Leg, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.legs[leg.index()].callback = Some(Arc::new(f));
        self
    }

    /// Hook run when the leg's callback fails. If it fails too, the machine
    /// enters `FAULT`.
    pub fn on_rollback<F>(mut self, leg: Leg, f: F) -> Self
    where
        F: Fn() -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.legs[leg.index()].rollback = Some(Arc::new(f));
        self
    }

    /// State a leg settles on after a successful rollback (default: source).
    pub fn rollback_target(mut self, leg: Leg, target: RollbackTarget) -> Self {
        self.legs[leg.index()].target = target;
        self
    }

    /// Allow-transition predicate.
    pub fn allow<F>(mut self, f: F) -> Self
    where
        F: Fn(State, State) -> bool + Send + Sync + 'static,
    {
        self.allow = Some(Arc::new(f));
        self
    }

    /// Build the machine and its `StateMachine` node.
    pub fn build(self) -> Arc<StateMachine> {
        let Self {
            asynchronous,
            legs,
            allow,
        } = self;

        Arc::new_cyclic(|me: &Weak<StateMachine>| {
            let set_state = {
                let setter = me.clone();
                let reader = me.clone();
                Pv::delegate_out::<i32, _>(SET_STATE_PV, move |_, requested| {
                    let sm = upgrade(&setter)?;
                    let target = State::from_i32(requested)
                        .ok_or_else(|| DriverError::new(format!("invalid state {requested}")))?;
                    sm.set_state(target)
                        .map(|_| ())
                        .map_err(|e| DriverError::new(e.to_string()))
                })
                .initializer(move || {
                    let sm = upgrade(&reader)?;
                    Ok((sm.node().timestamp(), sm.state() as i32))
                })
                .enumeration(State::labels())
                .scan(ScanPolicy::Passive)
                .description("Requested lifecycle state")
                .build()
            };

            let get_state = {
                let reader = me.clone();
                Pv::delegate_in::<i32, _>(GET_STATE_PV, move || {
                    let sm = upgrade(&reader)?;
                    Ok((sm.node().timestamp(), sm.state() as i32))
                })
                .enumeration(State::labels())
                .scan(ScanPolicy::Interrupt)
                .description("Local lifecycle state")
                .build()
            };

            let get_global_state = {
                let reader = me.clone();
                Pv::delegate_in::<i32, _>(GET_GLOBAL_STATE_PV, move || {
                    let sm = upgrade(&reader)?;
                    Ok((sm.node().timestamp(), sm.global_state() as i32))
                })
                .enumeration(State::labels())
                .scan(ScanPolicy::Interrupt)
                .description("Highest-priority state of the subtree")
                .build()
            };

            let node = Node::with_pvs(
                STATE_MACHINE_NODE_NAME,
                vec![set_state, get_state.clone(), get_global_state.clone()],
            );

            StateMachine {
                core: Arc::new(Core {
                    shared: Mutex::new(Shared::default()),
                    legs,
                    allow,
                    node,
                    get_state,
                    get_global_state,
                }),
                asynchronous,
                worker: Mutex::new(None),
            }
        })
    }
}

fn upgrade(me: &Weak<StateMachine>) -> Result<Arc<StateMachine>, DriverError> {
    me.upgrade()
        .ok_or_else(|| DriverError::new("state machine is gone"))
}

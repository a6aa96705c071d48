//! Typed, directional data channels (process variables).
//!
//! A channel has two orthogonal properties fixed at construction:
//!
//! - **direction**: [`Direction::Input`] channels carry device data out to the
//!   control system (the driver calls [`Pv::push`]); [`Direction::Output`]
//!   channels carry commands in (callers use [`Pv::write`]).
//! - **storage**: a *variable* channel keeps the last `(timestamp, value)`
//!   pair behind its own lock; a *delegate* channel forwards reads and writes
//!   to driver closures, serialized per channel.
//!
//! ```text
//!                 write()                      push()
//!   caller ───────────────► [Output Pv]   driver ───────────► [Input Pv]
//!                              │    │                           │    │
//!                     setter / store │                    store │    │ decimated
//!                                    ▼                          ▼    ▼
//!                         subscribers (write|push)    subscribers   interface
//! ```
//!
//! Subscriptions deliver synchronously on the writer's thread: a subscriber
//! that is an output channel receives a `write`, an input subscriber receives
//! a `push`. Links are weak; dropping a subscriber removes it.
//!
//! Each channel delivers one value at a time: storing, publishing and
//! forwarding happen under a per-channel lock, so subscribers end up with
//! the same last value as their source. The lock is reentrant; a delegate
//! may write its own channel from inside its setter. Subscription changes
//! are serialized process-wide so the cycle check cannot race.

use crate::interface::ControlSystemInterface;
use crate::node::Node;
use devsup_common::consts::NAME_SEPARATOR;
use devsup_common::error::{DriverError, PvError};
use devsup_common::state::State;
use devsup_common::time::Timestamp;
use devsup_common::value::{DataKind, Direction, PvType, ScanPolicy, Value};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tracing::debug;

/// Held across the cycle check and the insert of every new subscription.
static SUBSCRIPTIONS: Mutex<()> = Mutex::new(());

type Reader = Box<dyn Fn() -> Result<(Timestamp, Value), DriverError> + Send + Sync>;
type Writer = Box<dyn Fn(Timestamp, Value) -> Result<(), DriverError> + Send + Sync>;

enum Storage {
    Variable(Mutex<(Timestamp, Value)>),
    Getter {
        reader: Reader,
        serial: Mutex<()>,
    },
    Setter {
        writer: Writer,
        initializer: Option<Reader>,
        serial: Mutex<()>,
    },
}

#[derive(Debug, Clone, Default)]
struct Metadata {
    description: String,
    units: String,
    scan: ScanPolicy,
    enumeration: Vec<String>,
    max_elements: Option<usize>,
}

/// Snapshot of the adapter-facing description of a channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PvInfo {
    /// Full name.
    pub name: String,
    /// Direction.
    pub direction: Direction,
    /// Declared kind.
    pub kind: DataKind,
    /// Scan policy.
    pub scan: ScanPolicy,
    /// Free-text description.
    pub description: String,
    /// Physical units.
    pub units: String,
    /// Enumeration labels (empty if not enumerated).
    pub enumeration: Vec<String>,
    /// Maximum element count for arrays.
    pub max_elements: Option<usize>,
    /// True for delegate-backed channels.
    pub delegate: bool,
    /// States in which writes are accepted (`None` = always).
    pub writable_in: Option<Vec<State>>,
}

/// A typed data channel. Always handled as `Arc<Pv>`.
pub struct Pv {
    name: String,
    direction: Direction,
    kind: DataKind,
    meta: Metadata,
    storage: Storage,
    gate: Option<Vec<State>>,
    owner: OnceLock<Weak<Node>>,
    subscribers: Mutex<Vec<Weak<Pv>>>,
    delivery: ReentrantMutex<()>,
    interface: RwLock<Option<Arc<dyn ControlSystemInterface>>>,
    decimation: AtomicU32,
    pushes: AtomicU64,
}

impl Pv {
    // ─── Constructors ───────────────────────────────────────────────

    /// Input channel storing the last pushed value.
    pub fn variable_in<T: PvType>(name: impl Into<String>) -> PvBuilder<T> {
        PvBuilder::new(name.into(), Direction::Input, variable_storage(T::KIND))
    }

    /// Output channel storing the last written value.
    pub fn variable_out<T: PvType>(name: impl Into<String>) -> PvBuilder<T> {
        PvBuilder::new(name.into(), Direction::Output, variable_storage(T::KIND))
    }

    /// Input channel whose reads call `getter`.
    pub fn delegate_in<T, F>(name: impl Into<String>, getter: F) -> PvBuilder<T>
    where
        T: PvType,
        F: Fn() -> Result<(Timestamp, T), DriverError> + Send + Sync + 'static,
    {
        PvBuilder::new(
            name.into(),
            Direction::Input,
            Storage::Getter {
                reader: typed_reader(getter),
                serial: Mutex::new(()),
            },
        )
    }

    /// Output channel whose writes call `setter`.
    pub fn delegate_out<T, F>(name: impl Into<String>, setter: F) -> PvBuilder<T>
    where
        T: PvType,
        F: Fn(Timestamp, T) -> Result<(), DriverError> + Send + Sync + 'static,
    {
        let writer: Writer = Box::new(move |timestamp, value| match T::from_value(value) {
            Some(v) => setter(timestamp, v),
            None => Err(DriverError::new("value kind changed in flight")),
        });
        PvBuilder::new(
            name.into(),
            Direction::Output,
            Storage::Setter {
                writer,
                initializer: None,
                serial: Mutex::new(()),
            },
        )
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// Local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name prefixed with the owning node's full name.
    pub fn full_name(&self) -> String {
        match self.owner() {
            Some(owner) => format!("{}{}{}", owner.full_name(), NAME_SEPARATOR, self.name),
            None => self.name.clone(),
        }
    }

    /// Direction fixed at construction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Kind fixed at construction.
    pub fn kind(&self) -> DataKind {
        self.kind
    }

    /// Configured scan policy.
    pub fn scan(&self) -> ScanPolicy {
        self.meta.scan
    }

    /// Description text.
    pub fn description(&self) -> &str {
        &self.meta.description
    }

    /// Physical units.
    pub fn units(&self) -> &str {
        &self.meta.units
    }

    /// Enumeration labels.
    pub fn enumeration(&self) -> &[String] {
        &self.meta.enumeration
    }

    /// Maximum array length.
    pub fn max_elements(&self) -> Option<usize> {
        self.meta.max_elements
    }

    /// True for delegate-backed channels.
    pub fn is_delegate(&self) -> bool {
        !matches!(self.storage, Storage::Variable(_))
    }

    /// Only every n-th pushed value reaches the interface adapter.
    pub fn decimation(&self) -> u32 {
        self.decimation.load(Ordering::Relaxed)
    }

    /// Change the decimation factor (0 is treated as 1) and restart the count.
    pub fn set_decimation(&self, factor: u32) {
        self.decimation.store(factor.max(1), Ordering::Relaxed);
        self.pushes.store(0, Ordering::Relaxed);
    }

    /// Node owning this channel.
    pub fn owner(&self) -> Option<Arc<Node>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    /// Adapter-facing description.
    pub fn info(&self) -> PvInfo {
        PvInfo {
            name: self.full_name(),
            direction: self.direction,
            kind: self.kind,
            scan: self.meta.scan,
            description: self.meta.description.clone(),
            units: self.meta.units.clone(),
            enumeration: self.meta.enumeration.clone(),
            max_elements: self.meta.max_elements,
            delegate: self.is_delegate(),
            writable_in: self.gate.clone(),
        }
    }

    // ─── Data path ──────────────────────────────────────────────────

    /// Current `(timestamp, value)`.
    ///
    /// Delegate channels call the driver getter (or the initializer of an
    /// output delegate) on the calling thread.
    pub fn read(&self) -> Result<(Timestamp, Value), PvError> {
        match &self.storage {
            Storage::Variable(sample) => Ok(sample.lock().clone()),
            Storage::Getter { reader, serial } => {
                let _serial = serial.lock();
                reader().map_err(|e| self.delegate_error(e))
            }
            Storage::Setter {
                initializer: Some(reader),
                serial,
                ..
            } => {
                let _serial = serial.lock();
                reader().map_err(|e| self.delegate_error(e))
            }
            Storage::Setter {
                initializer: None, ..
            } => Err(PvError::NotReadable(self.full_name())),
        }
    }

    /// Typed [`Self::read`].
    pub fn read_as<T: PvType>(&self) -> Result<(Timestamp, T), PvError> {
        self.check_kind(T::KIND)?;
        let (timestamp, value) = self.read()?;
        let found = value.kind();
        T::from_value(value)
            .map(|v| (timestamp, v))
            .ok_or_else(|| self.mismatch(found))
    }

    /// Deliver a command to an output channel.
    pub fn write(&self, timestamp: Timestamp, value: Value) -> Result<(), PvError> {
        if self.direction != Direction::Output {
            return Err(self.wrong_direction("write"));
        }
        self.validate(&value)?;
        self.check_gate()?;

        let _delivery = self.delivery.lock();
        match &self.storage {
            Storage::Variable(sample) => *sample.lock() = (timestamp, value.clone()),
            Storage::Setter { writer, serial, .. } => {
                let _serial = serial.lock();
                writer(timestamp, value.clone()).map_err(|e| self.delegate_error(e))?;
            }
            Storage::Getter { .. } => return Err(self.wrong_direction("write")),
        }
        self.forward(timestamp, &value)
    }

    /// Typed [`Self::write`].
    pub fn write_as<T: PvType>(&self, timestamp: Timestamp, value: T) -> Result<(), PvError> {
        self.write(timestamp, value.into_value())
    }

    /// Publish a new sample on an input channel (driver side).
    ///
    /// Variable channels store it; every channel forwards it to the interface
    /// adapter (decimated) and to its subscribers (not decimated).
    pub fn push(&self, timestamp: Timestamp, value: Value) -> Result<(), PvError> {
        if self.direction != Direction::Input {
            return Err(self.wrong_direction("push"));
        }
        self.validate(&value)?;

        let _delivery = self.delivery.lock();
        if let Storage::Variable(sample) = &self.storage {
            *sample.lock() = (timestamp, value.clone());
        }
        self.publish(timestamp, &value);
        self.forward(timestamp, &value)
    }

    /// Typed [`Self::push`].
    pub fn push_as<T: PvType>(&self, timestamp: Timestamp, value: T) -> Result<(), PvError> {
        self.push(timestamp, value.into_value())
    }

    // ─── Subscriptions ──────────────────────────────────────────────

    /// Forward every value delivered to `source` into this channel.
    ///
    /// Subscribing twice to the same source is a no-op.
    ///
    /// # Errors
    ///
    /// - `PvError::TypeMismatch` if the kinds differ
    /// - `PvError::SubscriptionCycle` if values from this channel already
    ///   reach `source`
    pub fn subscribe_to(self: &Arc<Self>, source: &Arc<Pv>) -> Result<(), PvError> {
        if self.kind != source.kind {
            return Err(PvError::TypeMismatch {
                pv: self.full_name(),
                expected: self.kind,
                found: source.kind,
            });
        }
        let _serialized = SUBSCRIPTIONS.lock();
        if Arc::ptr_eq(self, source) || self.reaches(source) {
            return Err(PvError::SubscriptionCycle {
                source_pv: source.full_name(),
                subscriber: self.full_name(),
            });
        }

        let mut subscribers = source.subscribers.lock();
        if !subscribers
            .iter()
            .any(|w| std::ptr::eq(w.as_ptr(), Arc::as_ptr(self)))
        {
            subscribers.push(Arc::downgrade(self));
            debug!(source = %source.name, subscriber = %self.name, "subscribed");
        }
        Ok(())
    }

    /// Remove the link created by [`Self::subscribe_to`]. Returns whether one existed.
    pub fn unsubscribe_from(&self, source: &Pv) -> bool {
        let mut subscribers = source.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|w| !std::ptr::eq(w.as_ptr(), self));
        subscribers.len() != before
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    // ─── Crate-internal wiring ──────────────────────────────────────

    pub(crate) fn attach_owner(&self, owner: Weak<Node>) -> bool {
        self.owner.set(owner).is_ok()
    }

    pub(crate) fn has_owner(&self) -> bool {
        self.owner.get().is_some()
    }

    pub(crate) fn attach_interface(&self, interface: Arc<dyn ControlSystemInterface>) {
        *self.interface.write() = Some(interface);
    }

    pub(crate) fn detach_interface(&self) -> Option<Arc<dyn ControlSystemInterface>> {
        self.interface.write().take()
    }

    // ─── Helpers ────────────────────────────────────────────────────

    fn publish(&self, timestamp: Timestamp, value: &Value) {
        let count = self.pushes.fetch_add(1, Ordering::Relaxed);
        let factor = u64::from(self.decimation().max(1));
        if count % factor != 0 {
            return;
        }
        let interface = self.interface.read().clone();
        if let Some(interface) = interface {
            interface.push(self, timestamp, value);
        }
    }

    fn forward(&self, timestamp: Timestamp, value: &Value) -> Result<(), PvError> {
        let targets: Vec<Arc<Pv>> = {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|w| w.strong_count() > 0);
            subscribers.iter().filter_map(Weak::upgrade).collect()
        };

        let mut first_error = None;
        for target in targets {
            let delivered = match target.direction {
                Direction::Output => target.write(timestamp, value.clone()),
                Direction::Input => target.push(timestamp, value.clone()),
            };
            if let Err(e) = delivered {
                debug!(source = %self.name, subscriber = %target.name, error = %e, "forward failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn reaches(&self, target: &Pv) -> bool {
        let mut visited = HashSet::new();
        let mut stack: Vec<Arc<Pv>> = self
            .subscribers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        while let Some(pv) = stack.pop() {
            if std::ptr::eq(Arc::as_ptr(&pv), target) {
                return true;
            }
            if visited.insert(Arc::as_ptr(&pv)) {
                stack.extend(pv.subscribers.lock().iter().filter_map(Weak::upgrade));
            }
        }
        false
    }

    fn validate(&self, value: &Value) -> Result<(), PvError> {
        self.check_kind(value.kind())?;

        if let Some(max) = self.meta.max_elements
            && self.kind.is_array()
            && value.len() > max
        {
            return Err(PvError::TooManyElements {
                pv: self.full_name(),
                len: value.len(),
                max,
            });
        }

        if let Value::Int32(v) = value {
            let labels = self.meta.enumeration.len();
            if labels > 0 && usize::try_from(*v).map_or(true, |i| i >= labels) {
                return Err(PvError::InvalidEnumeration {
                    pv: self.full_name(),
                    value: *v,
                    labels,
                });
            }
        }
        Ok(())
    }

    fn check_gate(&self) -> Result<(), PvError> {
        let Some(allowed) = &self.gate else {
            return Ok(());
        };
        let state = self
            .owner()
            .map_or(State::Unknown, |owner| owner.governing_state());
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(PvError::NotPermitted {
                pv: self.full_name(),
                state,
            })
        }
    }

    fn check_kind(&self, found: DataKind) -> Result<(), PvError> {
        if found == self.kind {
            Ok(())
        } else {
            Err(self.mismatch(found))
        }
    }

    fn mismatch(&self, found: DataKind) -> PvError {
        PvError::TypeMismatch {
            pv: self.full_name(),
            expected: self.kind,
            found,
        }
    }

    fn wrong_direction(&self, operation: &'static str) -> PvError {
        PvError::WrongDirection {
            pv: self.full_name(),
            direction: self.direction,
            operation,
        }
    }

    fn delegate_error(&self, source: DriverError) -> PvError {
        PvError::Delegate {
            pv: self.full_name(),
            source,
        }
    }
}

impl fmt::Debug for Pv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pv")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("kind", &self.kind)
            .field("delegate", &self.is_delegate())
            .finish()
    }
}

fn variable_storage(kind: DataKind) -> Storage {
    Storage::Variable(Mutex::new((Timestamp::default(), Value::default_for(kind))))
}

fn typed_reader<T, F>(getter: F) -> Reader
where
    T: PvType,
    F: Fn() -> Result<(Timestamp, T), DriverError> + Send + Sync + 'static,
{
    Box::new(move || getter().map(|(timestamp, v)| (timestamp, v.into_value())))
}

/// Builder returned by the [`Pv`] constructors.
#[must_use = "call build() to obtain the channel"]
pub struct PvBuilder<T: PvType> {
    name: String,
    direction: Direction,
    meta: Metadata,
    storage: Storage,
    gate: Option<Vec<State>>,
    decimation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T: PvType> PvBuilder<T> {
    fn new(name: String, direction: Direction, storage: Storage) -> Self {
        Self {
            name,
            direction,
            meta: Metadata::default(),
            storage,
            gate: None,
            decimation: 1,
            _kind: PhantomData,
        }
    }

    /// Free-text description.
    pub fn description(mut self, text: impl Into<String>) -> Self {
        self.meta.description = text.into();
        self
    }

    /// Physical units.
    pub fn units(mut self, units: impl Into<String>) -> Self {
        self.meta.units = units.into();
        self
    }

    /// Scan policy (default passive).
    pub fn scan(mut self, scan: ScanPolicy) -> Self {
        self.meta.scan = scan;
        self
    }

    /// Enumeration labels; writes outside `0..labels.len()` are rejected.
    pub fn enumeration<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.meta.enumeration = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Maximum array length.
    pub fn max_elements(mut self, max: usize) -> Self {
        self.meta.max_elements = Some(max);
        self
    }

    /// Interface decimation factor.
    pub fn decimation(mut self, factor: u32) -> Self {
        self.decimation = factor.max(1);
        self
    }

    /// Accept writes only while the governing state machine is in `states`.
    pub fn gated_by(mut self, states: &[State]) -> Self {
        self.gate = Some(states.to_vec());
        self
    }

    /// Initial value of a variable channel. Ignored for delegates.
    pub fn initial(mut self, value: T) -> Self {
        if let Storage::Variable(sample) = &mut self.storage {
            sample.get_mut().1 = value.into_value();
        }
        self
    }

    /// Read-back getter of an output delegate. Ignored for other channels.
    pub fn initializer<F>(mut self, getter: F) -> Self
    where
        F: Fn() -> Result<(Timestamp, T), DriverError> + Send + Sync + 'static,
    {
        if let Storage::Setter { initializer, .. } = &mut self.storage {
            *initializer = Some(typed_reader(getter));
        }
        self
    }

    /// Finish the channel.
    pub fn build(self) -> Arc<Pv> {
        Arc::new(Pv {
            name: self.name,
            direction: self.direction,
            kind: T::KIND,
            meta: self.meta,
            storage: self.storage,
            gate: self.gate,
            owner: OnceLock::new(),
            subscribers: Mutex::new(Vec::new()),
            delivery: ReentrantMutex::new(()),
            interface: RwLock::new(None),
            decimation: AtomicU32::new(self.decimation),
            pushes: AtomicU64::new(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interface::RecordingInterface;
    use std::sync::atomic::AtomicUsize;

    fn ts(secs: i64) -> Timestamp {
        Timestamp::new(secs, 0)
    }

    #[test]
    fn variable_out_round_trip() {
        let pv = Pv::variable_out::<f64>("setpoint").build();
        pv.write_as(ts(5), 42.5).unwrap();
        assert_eq!(pv.read().unwrap(), (ts(5), Value::Float64(42.5)));
        assert_eq!(pv.read_as::<f64>().unwrap(), (ts(5), 42.5));
    }

    #[test]
    fn variable_starts_at_initial_value() {
        let pv = Pv::variable_out::<i32>("mode").initial(3).build();
        assert_eq!(pv.read_as::<i32>().unwrap().1, 3);
        let pv = Pv::variable_in::<String>("id").build();
        assert_eq!(pv.read().unwrap().1, Value::String(String::new()));
    }

    #[test]
    fn write_wrong_kind_is_rejected() {
        let pv = Pv::variable_out::<f64>("setpoint").build();
        let err = pv.write(ts(1), Value::Int32(1)).unwrap_err();
        assert!(matches!(
            err,
            PvError::TypeMismatch {
                expected: DataKind::Float64,
                found: DataKind::Int32,
                ..
            }
        ));
        assert_eq!(pv.read_as::<f64>().unwrap().1, 0.0);
        assert!(pv.read_as::<i32>().is_err());
    }

    #[test]
    fn direction_is_enforced() {
        let input = Pv::variable_in::<i32>("counts").build();
        let output = Pv::variable_out::<i32>("gain").build();
        assert!(matches!(
            input.write_as(ts(1), 1),
            Err(PvError::WrongDirection { operation: "write", .. })
        ));
        assert!(matches!(
            output.push_as(ts(1), 1),
            Err(PvError::WrongDirection { operation: "push", .. })
        ));
    }

    #[test]
    fn delegate_in_calls_getter_once_per_read() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let pv = Pv::delegate_in::<f64, _>("temperature", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok((ts(9), 21.5))
        })
        .build();

        assert_eq!(pv.read().unwrap(), (ts(9), Value::Float64(21.5)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(pv.is_delegate());
    }

    #[test]
    fn delegate_getter_failure_propagates() {
        let pv = Pv::delegate_in::<i32, _>("status", || Err(DriverError::new("bus timeout")))
            .build();
        let err = pv.read().unwrap_err();
        assert_eq!(
            err,
            PvError::Delegate {
                pv: "status".to_string(),
                source: DriverError::new("bus timeout"),
            }
        );
    }

    #[test]
    fn delegate_out_calls_setter_once_with_value() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pv = Pv::delegate_out::<f64, _>("setpoint", move |t, v| {
            sink.lock().push((t, v));
            Ok(())
        })
        .build();

        pv.write_as(ts(3), 42.5).unwrap();
        assert_eq!(*seen.lock(), vec![(ts(3), 42.5)]);
        assert!(matches!(pv.read(), Err(PvError::NotReadable(_))));
    }

    #[test]
    fn delegate_out_initializer_reads_back() {
        let pv = Pv::delegate_out::<i32, _>("gain", |_, _| Ok(()))
            .initializer(|| Ok((ts(2), 8)))
            .build();
        assert_eq!(pv.read_as::<i32>().unwrap(), (ts(2), 8));
    }

    #[test]
    fn subscriber_observes_identical_write() {
        let source = Pv::variable_out::<f64>("source").build();
        let sink = Pv::variable_out::<f64>("sink").build();
        sink.subscribe_to(&source).unwrap();

        source.write_as(ts(11), 1.25).unwrap();
        assert_eq!(sink.read().unwrap(), (ts(11), Value::Float64(1.25)));
        assert_eq!(source.subscriber_count(), 1);
    }

    #[test]
    fn input_subscriber_receives_push() {
        let source = Pv::variable_in::<i32>("raw").build();
        let replica = Pv::variable_in::<i32>("replica").build();
        replica.subscribe_to(&source).unwrap();

        source.push_as(ts(4), 17).unwrap();
        assert_eq!(replica.read_as::<i32>().unwrap(), (ts(4), 17));
    }

    #[test]
    fn subscription_requires_same_kind() {
        let source = Pv::variable_out::<f64>("source").build();
        let sink = Pv::variable_out::<i32>("sink").build();
        assert!(matches!(
            sink.subscribe_to(&source),
            Err(PvError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn subscription_cycles_are_rejected() {
        let a = Pv::variable_out::<i32>("a").build();
        let b = Pv::variable_out::<i32>("b").build();
        let c = Pv::variable_out::<i32>("c").build();
        b.subscribe_to(&a).unwrap();
        c.subscribe_to(&b).unwrap();

        assert!(matches!(
            a.subscribe_to(&c),
            Err(PvError::SubscriptionCycle { .. })
        ));
        assert!(matches!(
            a.subscribe_to(&a),
            Err(PvError::SubscriptionCycle { .. })
        ));
    }

    #[test]
    fn unsubscribe_stops_forwarding() {
        let source = Pv::variable_out::<i32>("source").build();
        let sink = Pv::variable_out::<i32>("sink").build();
        sink.subscribe_to(&source).unwrap();
        sink.subscribe_to(&source).unwrap();
        assert_eq!(source.subscriber_count(), 1);

        assert!(sink.unsubscribe_from(&source));
        source.write_as(ts(1), 5).unwrap();
        assert_eq!(sink.read_as::<i32>().unwrap().1, 0);
        assert!(!sink.unsubscribe_from(&source));
    }

    #[test]
    fn dropped_subscriber_is_pruned() {
        let source = Pv::variable_out::<i32>("source").build();
        {
            let sink = Pv::variable_out::<i32>("sink").build();
            sink.subscribe_to(&source).unwrap();
        }
        source.write_as(ts(1), 5).unwrap();
        assert_eq!(source.subscriber_count(), 0);
    }

    #[test]
    fn enumeration_range_is_enforced() {
        let pv = Pv::variable_out::<i32>("mode")
            .enumeration(["Single", "Continuous"])
            .build();
        pv.write_as(ts(1), 1).unwrap();
        assert!(matches!(
            pv.write_as(ts(1), 2),
            Err(PvError::InvalidEnumeration { labels: 2, .. })
        ));
        assert!(pv.write_as(ts(1), -1).is_err());
    }

    #[test]
    fn max_elements_is_enforced() {
        let pv = Pv::variable_in::<Vec<f64>>("waveform").max_elements(2).build();
        pv.push_as(ts(1), vec![1.0, 2.0]).unwrap();
        assert!(matches!(
            pv.push_as(ts(1), vec![1.0, 2.0, 3.0]),
            Err(PvError::TooManyElements { len: 3, max: 2, .. })
        ));
    }

    #[test]
    fn decimation_applies_to_interface_only() {
        let source = Pv::variable_in::<i32>("data").decimation(3).build();
        let replica = Pv::variable_in::<i32>("replica").build();
        replica.subscribe_to(&source).unwrap();

        let interface = Arc::new(RecordingInterface::new("port"));
        source.attach_interface(interface.clone());

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let tap = Pv::delegate_out::<i32, _>("tap", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .build();
        tap.subscribe_to(&source).unwrap();

        for i in 0..7 {
            source.push_as(ts(i), i as i32).unwrap();
        }

        let pushed: Vec<_> = interface.samples().into_iter().map(|s| s.value).collect();
        assert_eq!(
            pushed,
            vec![Value::Int32(0), Value::Int32(3), Value::Int32(6)]
        );
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(replica.read_as::<i32>().unwrap().1, 6);
    }

    #[test]
    fn gated_write_without_state_machine_is_refused() {
        let pv = Pv::variable_out::<f64>("setpoint")
            .gated_by(&[State::On, State::Running])
            .build();
        assert!(matches!(
            pv.write_as(ts(1), 1.0),
            Err(PvError::NotPermitted {
                state: State::Unknown,
                ..
            })
        ));
    }

    #[test]
    fn info_describes_channel() {
        let pv = Pv::variable_in::<Vec<i32>>("spectrum")
            .description("counts per bin")
            .units("counts")
            .scan(ScanPolicy::Interrupt)
            .max_elements(1024)
            .build();
        let info = pv.info();
        assert_eq!(info.name, "spectrum");
        assert_eq!(info.direction, Direction::Input);
        assert_eq!(info.kind, DataKind::Int32Array);
        assert_eq!(info.scan, ScanPolicy::Interrupt);
        assert_eq!(info.max_elements, Some(1024));
        assert!(!info.delegate);
    }
}

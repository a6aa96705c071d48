//! Result handle of a transition request.

use devsup_common::error::StateMachineError;
use devsup_common::state::State;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Final state of a finished transition, or why it failed.
pub type TransitionOutcome = Result<State, StateMachineError>;

#[derive(Default)]
struct Slot {
    outcome: Mutex<Option<TransitionOutcome>>,
    ready: Condvar,
}

/// Handle to an accepted transition request.
///
/// Synchronous machines hand out handles that are already finished.
#[derive(Clone)]
pub struct TransitionHandle {
    slot: Arc<Slot>,
    from: State,
    requested: State,
}

impl TransitionHandle {
    pub(crate) fn pending(from: State, requested: State) -> (Self, Completer) {
        let slot = Arc::new(Slot::default());
        let completer = Completer {
            slot: slot.clone(),
            done: false,
        };
        (
            Self {
                slot,
                from,
                requested,
            },
            completer,
        )
    }

    pub(crate) fn finished(from: State, requested: State, outcome: TransitionOutcome) -> Self {
        let (handle, completer) = Self::pending(from, requested);
        completer.complete(outcome);
        handle
    }

    /// State at request time.
    pub fn from(&self) -> State {
        self.from
    }

    /// State named in the request.
    pub fn requested(&self) -> State {
        self.requested
    }

    /// True once the outcome is available.
    pub fn is_finished(&self) -> bool {
        self.slot.outcome.lock().is_some()
    }

    /// Outcome if finished, without blocking.
    pub fn try_result(&self) -> Option<TransitionOutcome> {
        self.slot.outcome.lock().clone()
    }

    /// Block until the transition finishes.
    ///
    /// There is no cancellation: a callback that never returns blocks this
    /// call forever. Use [`Self::wait_timeout`] to bound the wait.
    pub fn wait(&self) -> TransitionOutcome {
        let mut outcome = self.slot.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.slot.ready.wait(&mut outcome);
        }
    }

    /// Block up to `timeout`; `None` if the transition is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TransitionOutcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.slot.outcome.lock();
        while outcome.is_none() {
            if self.slot.ready.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.clone()
    }
}

impl std::fmt::Debug for TransitionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionHandle")
            .field("from", &self.from)
            .field("requested", &self.requested)
            .field("outcome", &self.try_result())
            .finish()
    }
}

/// Producer side of a [`TransitionHandle`]. Dropping it unfinished reports
/// `WorkerUnavailable` so waiters never hang on a lost job.
pub(crate) struct Completer {
    slot: Arc<Slot>,
    done: bool,
}

impl Completer {
    pub(crate) fn complete(mut self, outcome: TransitionOutcome) {
        self.fill(outcome);
    }

    fn fill(&mut self, outcome: TransitionOutcome) {
        *self.slot.outcome.lock() = Some(outcome);
        self.slot.ready.notify_all();
        self.done = true;
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.done {
            self.fill(Err(StateMachineError::WorkerUnavailable));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn finished_handle_reports_immediately() {
        let handle = TransitionHandle::finished(State::Unknown, State::Off, Ok(State::Off));
        assert!(handle.is_finished());
        assert_eq!(handle.wait(), Ok(State::Off));
        assert_eq!(handle.try_result(), Some(Ok(State::Off)));
    }

    #[test]
    fn wait_blocks_until_completed() {
        let (handle, completer) = TransitionHandle::pending(State::Off, State::On);
        assert_eq!(handle.try_result(), None);
        assert_eq!(handle.wait_timeout(Duration::from_millis(10)), None);

        let worker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            completer.complete(Ok(State::On));
        });
        assert_eq!(handle.wait(), Ok(State::On));
        worker.join().unwrap();
    }

    #[test]
    fn dropped_completer_unblocks_waiters() {
        let (handle, completer) = TransitionHandle::pending(State::On, State::Running);
        drop(completer);
        assert_eq!(handle.wait(), Err(StateMachineError::WorkerUnavailable));
    }
}

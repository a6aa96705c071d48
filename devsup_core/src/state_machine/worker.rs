//! Per-instance worker thread for asynchronous machines.
//!
//! Jobs arrive over a `crossbeam-channel` and run one at a time. The machine
//! owns the worker; dropping it closes the channel and joins the thread,
//! unless the drop happens on the worker thread itself.

use super::Core;
use super::handle::Completer;
use super::leg::Leg;
use crossbeam_channel::{Sender, unbounded};
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::debug;

pub(crate) struct Job {
    pub(crate) core: Arc<Core>,
    pub(crate) leg: Leg,
    pub(crate) completer: Completer,
}

impl Job {
    fn run(self) {
        let outcome = self.core.run(self.leg);
        self.completer.complete(outcome);
    }
}

pub(crate) struct Worker {
    sender: Option<Sender<Job>>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub(crate) fn spawn(name: String) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let thread = thread::Builder::new().name(name).spawn(move || {
            for job in receiver.iter() {
                job.run();
            }
            debug!("state machine worker exiting");
        })?;
        Ok(Self {
            sender: Some(sender),
            thread: Some(thread),
        })
    }

    /// Queue a job; hands it back if the thread is gone.
    pub(crate) fn submit(&self, job: Job) -> Result<(), Job> {
        match &self.sender {
            Some(sender) => sender.send(job).map_err(|e| e.into_inner()),
            None => Err(job),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(thread) = self.thread.take()
            && thread.thread().id() != thread::current().id()
        {
            let _ = thread.join();
        }
    }
}

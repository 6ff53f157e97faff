//! Execution contexts that rate-limited actions can be marshaled onto.
//!
//! A [`Dispatcher`] stands in for a captured synchronization context (a UI
//! thread, an actor loop). `invoke` is synchronous: it returns only after the
//! job has run on the target context.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use crate::error::panic_message;

/// A unit of work handed to a dispatcher.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

pub trait Dispatcher: Send + Sync + 'static {
    /// Run `job` on this dispatcher's context and wait for it to finish.
    fn invoke(&self, job: Job);
}

/// Runs jobs directly on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn invoke(&self, job: Job) {
        job();
    }
}

struct Envelope {
    job: Job,
    done: mpsc::SyncSender<()>,
}

/// Owns a dedicated OS thread and runs every job on it, one at a time.
///
/// Jobs invoked from the dispatcher thread itself run inline, so an action
/// that re-enters its own dispatcher cannot deadlock.
pub struct ThreadDispatcher {
    name: String,
    thread_id: ThreadId,
    tx: Option<mpsc::Sender<Envelope>>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadDispatcher {
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Envelope>();

        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            tracing::debug!(dispatcher = %thread_name, "Dispatcher thread started");
            while let Ok(envelope) = rx.recv() {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(envelope.job)) {
                    tracing::error!(
                        dispatcher = %thread_name,
                        panic = %panic_message(payload.as_ref()),
                        "Dispatched job panicked"
                    );
                }
                let _ = envelope.done.send(());
            }
            tracing::debug!(dispatcher = %thread_name, "Dispatcher thread exiting");
        })?;

        Ok(Self {
            name,
            thread_id: handle.thread().id(),
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

impl Dispatcher for ThreadDispatcher {
    fn invoke(&self, job: Job) {
        if thread::current().id() == self.thread_id {
            job();
            return;
        }

        let Some(tx) = self.tx.as_ref() else {
            return;
        };

        let (done_tx, done_rx) = mpsc::sync_channel(1);
        if tx.send(Envelope { job, done: done_tx }).is_err() {
            tracing::warn!(dispatcher = %self.name, "Dispatcher thread gone, job dropped");
            return;
        }
        // Err means the thread exited without acknowledging; nothing to wait for.
        let _ = done_rx.recv();
    }
}

impl Drop for ThreadDispatcher {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(handle) = self.handle.take()
            && thread::current().id() != self.thread_id
            && handle.join().is_err()
        {
            tracing::error!(dispatcher = %self.name, "Dispatcher thread panicked");
        }
    }
}

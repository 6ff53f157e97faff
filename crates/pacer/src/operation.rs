//! Operation slot: one superseding "current operation" with cooperative cancellation.
//!
//! Starting a new operation cancels the token handed to the previous one.
//! Cancellation is cooperative: running work is never aborted, it has to
//! observe its token.
//!
//! ```no_run
//! # async fn search(_q: &str, _t: pacer::CancellationToken) -> Result<(), pacer::OperationError> { Ok(()) }
//! # async fn demo() -> Result<(), pacer::OperationError> {
//! let slot = pacer::OperationSlot::new();
//! // Each keystroke supersedes the previous search.
//! slot.execute(|token| search("ru", token), true);
//! slot.execute(|token| search("rust", token), true).await?;
//! # Ok(())
//! # }
//! ```

use std::future::{Future, IntoFuture};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::watch;
pub use tokio_util::sync::CancellationToken;

use crate::error::OperationError;

/// Terminal result of an operation.
pub type Outcome = Result<(), OperationError>;

/// Handle to a started operation.
///
/// Cheap to clone. Can be polled with [`is_completed`](Self::is_completed)
/// and awaited any number of times; every wait yields the same outcome.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    rx: watch::Receiver<Option<Outcome>>,
}

impl TaskHandle {
    fn completed(id: u64) -> Self {
        let (_tx, rx) = watch::channel(Some(Ok(())));
        Self { id, rx }
    }

    fn pending(id: u64) -> (watch::Sender<Option<Outcome>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { id, rx })
    }

    /// Monotonic identifier within the owning slot.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the operation reached a terminal state (succeeded, failed,
    /// cancelled or panicked).
    pub fn is_completed(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The outcome, if the operation has finished.
    pub fn outcome(&self) -> Option<Outcome> {
        self.rx.borrow().clone()
    }

    pub async fn wait(&self) -> Outcome {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => match &*outcome {
                Some(result) => result.clone(),
                None => Ok(()),
            },
            // The runtime dropped the task before it finished.
            Err(_) => Err(OperationError::Cancelled),
        }
    }
}

#[derive(Debug)]
enum ExecutionKind {
    Skipped,
    Rejected(OperationError),
    Started(TaskHandle),
}

/// Result of [`OperationSlot::execute`].
///
/// The operation is already running when this is returned; awaiting it waits
/// for completion. A disposal race reported by the operation itself resolves
/// to `Ok(())`.
#[derive(Debug)]
pub struct Execution {
    kind: ExecutionKind,
}

impl Execution {
    /// False when the request was dropped because the current operation was
    /// still running, or rejected (disposed slot, no runtime).
    pub fn was_started(&self) -> bool {
        matches!(self.kind, ExecutionKind::Started(_))
    }

    pub fn task(&self) -> Option<&TaskHandle> {
        match &self.kind {
            ExecutionKind::Started(task) => Some(task),
            _ => None,
        }
    }
}

impl IntoFuture for Execution {
    type Output = Outcome;
    type IntoFuture = BoxFuture<'static, Outcome>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            match self.kind {
                ExecutionKind::Skipped => Ok(()),
                ExecutionKind::Rejected(error) => Err(error),
                ExecutionKind::Started(task) => match task.wait().await {
                    Err(OperationError::Disposed) => {
                        tracing::debug!(operation = task.id(), "Operation raced with slot disposal");
                        Ok(())
                    }
                    outcome => outcome,
                },
            }
        })
    }
}

struct SlotState {
    source: CancellationToken,
    current: TaskHandle,
    disposed: bool,
}

impl SlotState {
    /// Swap in a fresh source and cancel the old one before the caller can
    /// release the lock.
    fn replace_source(&mut self) -> CancellationToken {
        let previous = std::mem::replace(&mut self.source, CancellationToken::new());
        previous.cancel();
        self.source.clone()
    }
}

/// A single replaceable "current operation" slot.
pub struct OperationSlot {
    state: Mutex<SlotState>,
    next_id: AtomicU64,
}

impl Default for OperationSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationSlot {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                source: CancellationToken::new(),
                current: TaskHandle::completed(0),
                disposed: false,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token of the current cancellation source.
    pub fn token(&self) -> CancellationToken {
        self.lock().source.clone()
    }

    /// Like [`token`](Self::token), but fails once the slot is disposed.
    ///
    /// Operations use this to notice that they outlived their slot; the
    /// resulting `Disposed` error is swallowed by [`execute`](Self::execute).
    pub fn try_token(&self) -> Result<CancellationToken, OperationError> {
        let state = self.lock();
        if state.disposed {
            return Err(OperationError::Disposed);
        }
        Ok(state.source.clone())
    }

    pub fn current_task(&self) -> TaskHandle {
        self.lock().current.clone()
    }

    pub fn check_completed(&self) -> bool {
        self.lock().current.is_completed()
    }

    /// Replace the cancellation source, cancelling the previous one.
    pub fn reset_token(&self) -> CancellationToken {
        self.lock().replace_source()
    }

    /// Return the current token unless it is already cancelled.
    pub fn reset_token_if_needed(&self) -> CancellationToken {
        let mut state = self.lock();
        if state.source.is_cancelled() {
            state.replace_source()
        } else {
            state.source.clone()
        }
    }

    /// Cancel the current source without replacing it.
    pub fn cancel(&self) {
        self.lock().source.cancel();
    }

    /// Stop accepting operations. In-flight work is not cancelled.
    pub fn dispose(&self) {
        let mut state = self.lock();
        if !state.disposed {
            state.disposed = true;
            tracing::debug!(current = state.current.id(), "Operation slot disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Start `operation` as the new current operation.
    ///
    /// With `cancel_current == false` and an operation still running, the
    /// request is dropped and the returned [`Execution`] resolves to `Ok(())`
    /// immediately. Otherwise the token is reset (cancelling the previous
    /// operation) and `operation(new_token)` is spawned right away.
    ///
    /// Outside a tokio runtime nothing is touched and the execution resolves
    /// to `OperationError::NoRuntime`.
    pub fn execute<F, Fut>(&self, operation: F, cancel_current: bool) -> Execution
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                return Execution {
                    kind: ExecutionKind::Rejected(e.into()),
                };
            }
        };

        let (tx, token, task) = {
            let mut state = self.lock();
            if state.disposed {
                tracing::warn!("Operation started on a disposed slot");
                return Execution {
                    kind: ExecutionKind::Rejected(OperationError::Disposed),
                };
            }
            if !cancel_current && !state.current.is_completed() {
                tracing::debug!(
                    current = state.current.id(),
                    "Current operation still running, request dropped"
                );
                return Execution {
                    kind: ExecutionKind::Skipped,
                };
            }

            let token = state.replace_source();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (tx, task) = TaskHandle::pending(id);
            state.current = task.clone();
            (tx, token, task)
        };

        let id = task.id();
        let future = match catch_unwind(AssertUnwindSafe(|| operation(token))) {
            Ok(future) => future,
            Err(payload) => {
                tx.send_replace(Some(Err(OperationError::from_panic(payload))));
                return Execution {
                    kind: ExecutionKind::Started(task),
                };
            }
        };

        runtime.spawn(async move {
            let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(payload) => Err(OperationError::from_panic(payload)),
            };
            match &outcome {
                Ok(()) => tracing::trace!(operation = id, "Operation completed"),
                Err(e) => tracing::debug!(operation = id, error = %e, "Operation ended with error"),
            }
            tx.send_replace(Some(outcome));
        });

        Execution {
            kind: ExecutionKind::Started(task),
        }
    }

    /// Run a synchronous `action` on the blocking pool as the new current
    /// operation, with the same cancel/drop rules as [`execute`](Self::execute).
    ///
    /// If the token is cancelled before the action gets to run, it is skipped
    /// and the outcome is `Cancelled`.
    pub fn start_new_task<F>(&self, action: F, cancel_current: bool) -> Execution
    where
        F: FnOnce(CancellationToken) -> Outcome + Send + 'static,
    {
        self.execute(
            move |token| async move {
                if token.is_cancelled() {
                    return Err(OperationError::Cancelled);
                }
                match tokio::task::spawn_blocking(move || {
                    if token.is_cancelled() {
                        return Err(OperationError::Cancelled);
                    }
                    action(token)
                })
                .await
                {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => Err(OperationError::from_panic(e.into_panic())),
                    Err(_) => Err(OperationError::Cancelled),
                }
            },
            cancel_current,
        )
    }
}

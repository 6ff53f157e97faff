//! Debounce and throttle for a single logical action stream.
//!
//! A limiter owns at most one pending timer. Every mutation of that slot and
//! of the last execution time goes through one gate (a mutex that is never
//! held across an await or while the action runs). A firing timer clears the
//! slot before invoking the action, so the action may call back into the
//! limiter.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{RateLimiterConfig, ThrottleOptions};
use crate::dispatcher::{Dispatcher, Job};
use crate::error::{RateLimitError, panic_message};

/// Whether a limiter currently has a scheduled invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterState {
    Idle,
    Pending,
}

struct PendingTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct TimerSlot {
    pending: Option<PendingTimer>,
    last_execution: Option<Instant>,
    generation: u64,
    disposed: bool,
}

struct Inner {
    gate: Mutex<TimerSlot>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    runtime: Handle,
    config: RateLimiterConfig,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TimerSlot> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `action` now, on the dispatcher if there is one.
    fn invoke(&self, action: Job) {
        match &self.dispatcher {
            Some(dispatcher) => dispatcher.invoke(Box::new(move || run_guarded(action))),
            None => run_guarded(action),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.gate.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.pending.take() {
            pending.handle.abort();
        }
    }
}

pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Limiter running actions inline on the timer task, with configuration
    /// taken from the environment.
    pub fn new() -> Result<Self, RateLimitError> {
        Self::with_config(RateLimiterConfig::default(), None)
    }

    /// Limiter marshaling every action onto `dispatcher`.
    pub fn with_dispatcher(dispatcher: Arc<dyn Dispatcher>) -> Result<Self, RateLimitError> {
        Self::with_config(RateLimiterConfig::default(), Some(dispatcher))
    }

    pub fn with_config(
        config: RateLimiterConfig,
        dispatcher: Option<Arc<dyn Dispatcher>>,
    ) -> Result<Self, RateLimitError> {
        let runtime = Handle::try_current()?;
        Ok(Self {
            inner: Arc::new(Inner {
                gate: Mutex::new(TimerSlot::default()),
                dispatcher,
                runtime,
                config,
            }),
        })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    pub fn state(&self) -> LimiterState {
        if self.inner.lock().pending.is_some() {
            LimiterState::Pending
        } else {
            LimiterState::Idle
        }
    }

    /// Run `action` once `interval` has passed without another call.
    ///
    /// Each call cancels the pending timer and restarts the countdown.
    pub fn debounce<F>(&self, interval: Duration, action: F) -> Result<(), RateLimitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = self.inner.lock();
        if slot.disposed {
            return Err(RateLimitError::Disposed);
        }
        self.schedule(&mut slot, interval, Box::new(action));
        Ok(())
    }

    pub fn debounce_with<P, F>(
        &self,
        interval: Duration,
        param: P,
        action: F,
    ) -> Result<(), RateLimitError>
    where
        P: Send + 'static,
        F: FnOnce(P) + Send + 'static,
    {
        self.debounce(interval, move || action(param))
    }

    /// Debounce with the configured interval.
    pub fn debounce_default<F>(&self, action: F) -> Result<(), RateLimitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.debounce(self.inner.config.interval, action)
    }

    /// Run `action` at most once per `interval`: immediately on the leading
    /// edge, then once at the end of the window for the last call in it.
    pub fn throttle<F>(&self, interval: Duration, action: F) -> Result<(), RateLimitError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.throttle_with_options(interval, ThrottleOptions::default(), action)
    }

    pub fn throttle_with<P, F>(
        &self,
        interval: Duration,
        options: ThrottleOptions,
        param: P,
        action: F,
    ) -> Result<(), RateLimitError>
    where
        P: Send + 'static,
        F: FnOnce(P) + Send + 'static,
    {
        self.throttle_with_options(interval, options, move || action(param))
    }

    /// Throttle with the configured interval and flags.
    pub fn throttle_default<F>(&self, action: F) -> Result<(), RateLimitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let config = &self.inner.config;
        self.throttle_with_options(config.interval, config.throttle, action)
    }

    /// Throttle with explicit edge flags.
    ///
    /// - Window free (more than `interval` since the last execution): the call
    ///   opens a new window and runs immediately, or with
    ///   `skip_immediate_event` after a full trailing `interval`.
    /// - Window busy: with `use_first_event` the call is dropped and any
    ///   pending timer is kept; otherwise it replaces the pending timer with
    ///   one for the rest of the window.
    pub fn throttle_with_options<F>(
        &self,
        interval: Duration,
        options: ThrottleOptions,
        action: F,
    ) -> Result<(), RateLimitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let action: Job = Box::new(action);

        let immediate = {
            let mut slot = self.inner.lock();
            if slot.disposed {
                return Err(RateLimitError::Disposed);
            }

            let now = Instant::now();
            let elapsed = slot
                .last_execution
                .map(|last| now.saturating_duration_since(last));

            match elapsed {
                Some(elapsed) if elapsed <= interval => {
                    if options.use_first_event {
                        tracing::trace!(?elapsed, "Throttled call dropped");
                    } else {
                        self.schedule(&mut slot, interval - elapsed, action);
                    }
                    None
                }
                _ => {
                    // A trailing timer that is still pending belongs to the
                    // window that just ended and must not fire inside this one.
                    if let Some(stale) = slot.pending.take() {
                        stale.handle.abort();
                        tracing::trace!(
                            generation = stale.generation,
                            "Overdue trailing call dropped"
                        );
                    }
                    slot.last_execution = Some(now);
                    if options.skip_immediate_event {
                        self.schedule(&mut slot, interval, action);
                        None
                    } else {
                        Some(action)
                    }
                }
            }
        };

        if let Some(action) = immediate {
            self.inner.invoke(action);
        }
        Ok(())
    }

    /// Drop any pending invocation without running it and reject further calls.
    pub fn dispose(&self) {
        let mut slot = self.inner.lock();
        slot.disposed = true;
        if let Some(pending) = slot.pending.take() {
            pending.handle.abort();
            tracing::debug!(generation = pending.generation, "Pending rate limited action dropped");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Replace the pending timer with one firing `action` after `delay`,
    /// measured from now rather than from when the timer task first runs.
    fn schedule(&self, slot: &mut TimerSlot, delay: Duration, action: Job) {
        if let Some(previous) = slot.pending.take() {
            previous.handle.abort();
        }

        slot.generation += 1;
        let generation = slot.generation;
        let deadline = Instant::now() + delay;
        let inner = Arc::downgrade(&self.inner);
        let handle = self.inner.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fire(inner, generation, action).await;
        });

        slot.pending = Some(PendingTimer { generation, handle });
    }
}

async fn fire(inner: Weak<Inner>, generation: u64, action: Job) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    {
        let mut slot = inner.lock();
        match &slot.pending {
            Some(pending) if pending.generation == generation => {}
            // Superseded or disposed while waiting for the gate.
            _ => return,
        }
        slot.pending = None;
        slot.last_execution = Some(Instant::now());
    }

    match inner.dispatcher.clone() {
        Some(dispatcher) => {
            let job: Job = Box::new(move || run_guarded(action));
            if let Err(e) = tokio::task::spawn_blocking(move || dispatcher.invoke(job)).await {
                tracing::error!(error = %e, "Dispatching rate limited action failed");
            }
        }
        None => run_guarded(action),
    }
}

fn run_guarded(action: Job) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(action)) {
        tracing::error!(
            panic = %panic_message(payload.as_ref()),
            "Rate limited action panicked"
        );
    }
}

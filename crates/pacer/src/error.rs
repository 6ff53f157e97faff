//! Error types shared by the operation slot, task queue and rate limiter.

use std::any::Any;
use std::sync::Arc;

use tokio::runtime::TryCurrentError;

/// Outcome of a failed operation or queued work item.
///
/// `Clone` so a single completed outcome can be handed to every waiter of a
/// [`TaskHandle`](crate::TaskHandle).
#[derive(Debug, Clone, thiserror::Error)]
pub enum OperationError {
    /// The operation observed its cancellation token.
    #[error("operation was cancelled")]
    Cancelled,

    /// The owning slot was disposed while the operation was in flight,
    /// or an operation was started on a disposed slot.
    #[error("operation slot was disposed")]
    Disposed,

    /// The operation returned an error.
    #[error("operation failed: {0}")]
    Failed(Arc<anyhow::Error>),

    /// The operation panicked.
    #[error("operation panicked: {message}")]
    Panicked { message: String },

    /// `execute` was called outside a tokio runtime; nothing was started.
    #[error("operation slot requires a tokio runtime: {0}")]
    NoRuntime(Arc<TryCurrentError>),
}

impl OperationError {
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Self::Failed(Arc::new(error.into()))
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::Panicked {
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self, Self::Disposed)
    }

    /// Build a `Panicked` error from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::panicked(panic_message(payload.as_ref()))
    }
}

impl From<TryCurrentError> for OperationError {
    fn from(error: TryCurrentError) -> Self {
        Self::NoRuntime(Arc::new(error))
    }
}

impl From<anyhow::Error> for OperationError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(Arc::new(error))
    }
}

/// Errors returned by [`TaskQueue`](crate::TaskQueue).
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The queue was shut down; no more items are accepted.
    #[error("task queue '{name}' is closed")]
    Closed { name: String },

    /// The queue was created outside a tokio runtime.
    #[error("task queue requires a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Errors returned by [`RateLimiter`](crate::RateLimiter).
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The limiter was disposed; pending and future calls are dropped.
    #[error("rate limiter is disposed")]
    Disposed,

    /// The limiter was created outside a tokio runtime.
    #[error("rate limiter requires a tokio runtime: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

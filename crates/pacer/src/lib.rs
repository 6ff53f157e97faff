//! pacer: small concurrency building blocks for tokio applications.
//!
//! - [`OperationSlot`]: one superseding "current operation"; starting a new
//!   one cancels the previous one's token.
//! - [`TaskQueue`]: a single worker draining work items in FIFO order with
//!   per-item failure isolation.
//! - [`RateLimiter`]: debounce and throttle, optionally marshaled onto a
//!   [`Dispatcher`].

pub mod config;
pub mod dispatcher;
mod error;
pub mod logging;
mod operation;
mod queue;
mod rate_limit;

pub use config::{QueueConfig, RateLimiterConfig, ThrottleOptions};
pub use dispatcher::{Dispatcher, InlineDispatcher, Job, ThreadDispatcher};
pub use error::{OperationError, QueueError, RateLimitError};
pub use operation::{CancellationToken, Execution, OperationSlot, Outcome, TaskHandle};
pub use queue::TaskQueue;
pub use rate_limit::{LimiterState, RateLimiter};

//! Configuration for queues and rate limiters.
//!
//! Defaults can be overridden through the environment:
//! - `PACER_QUEUE_BACKLOG_WARNING`: backlog size that triggers a warning (0 disables)
//! - `PACER_RATE_LIMIT_INTERVAL`: default rate limit interval in seconds

use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_BACKLOG_WARNING: usize = 1000;
const DEFAULT_INTERVAL_MS: u64 = 500;

/// Flags controlling which edges of a throttle window fire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleOptions {
    /// Defer the first call of a free window to a trailing timer instead of
    /// running it immediately.
    pub skip_immediate_event: bool,
    /// Within a window, keep the earliest call and drop later ones instead of
    /// rescheduling for the last call.
    pub use_first_event: bool,
}

impl ThrottleOptions {
    pub fn skip_immediate(mut self) -> Self {
        self.skip_immediate_event = true;
        self
    }

    pub fn use_first(mut self) -> Self {
        self.use_first_event = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Label attached to every log event of the queue.
    pub name: String,
    /// Warn each time the backlog grows to a multiple of this size.
    pub backlog_warning: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "task-queue".to_string(),
            backlog_warning: std::env::var("PACER_QUEUE_BACKLOG_WARNING")
                .ok()
                .and_then(|s| parse_backlog_warning(&s))
                .unwrap_or(DEFAULT_BACKLOG_WARNING),
        }
    }
}

impl QueueConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Interval used by `debounce_default` and `throttle_default`.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Flags used by `throttle_default`.
    pub throttle: ThrottleOptions,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            interval: std::env::var("PACER_RATE_LIMIT_INTERVAL")
                .ok()
                .and_then(|s| parse_interval_secs(&s))
                .unwrap_or(Duration::from_millis(DEFAULT_INTERVAL_MS)),
            throttle: ThrottleOptions::default(),
        }
    }
}

fn parse_backlog_warning(value: &str) -> Option<usize> {
    value.trim().parse().ok()
}

/// Seconds, fractional allowed, truncated to whole milliseconds. Negative
/// and non-finite values are rejected.
fn parse_interval_secs(value: &str) -> Option<Duration> {
    let secs = value.trim().parse::<f64>().ok()?;
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_millis((secs * 1000.0) as u64))
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

//! Admission control for usage-metered APIs: a single gate through
//! which all outbound calls pass, so one process never exceeds the
//! provider's rate limits and shares them fairly across consumers.

pub mod http;
pub mod reqwest_integration;
pub mod retries;
pub(crate) mod scheduler;
pub mod service;
pub(crate) mod stats;
pub mod usage;

use std::time::Duration;

use bon::Builder;
use snafu::Snafu;

pub use service::UsageThrottle;
pub use usage::{Bucket, UsageMetrics};

/// Soft-throttle delay at the throttle threshold.
const SOFT_DELAY_FLOOR_MS: u64 = 50;
/// Soft-throttle delay just below the pause threshold.
const SOFT_DELAY_CEIL_MS: u64 = 2000;

/// Configuration of the admission gate.
///
/// The defaults match the provider's published guidance (start slowing
/// down at 75% usage, stop submitting at 90%) and are safe to use
/// unchanged. All durations are milliseconds.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `throttle_threshold` | 75.0 | Usage % at which calls run inline but delayed |
/// | `pause_threshold` | 90.0 | Usage % at which calls are queued instead of run |
/// | `base_backoff_ms` | 1000 | First retry backoff after a rate-limit failure |
/// | `max_backoff_ms` | 300000 | Ceiling on any single backoff |
/// | `max_retries` | 5 | Rate-limit retries beyond the first attempt |
/// | `drain_interval_ms` | 100 | Period of the queue-drain timer while work is pending |
/// | `max_concurrent` | 10 | In-flight call ceiling for the whole engine |
///
/// Invariant: `0 < throttle_threshold < pause_threshold < 100`,
/// checked by [`UsageThrottle::new`].
///
/// # Example
///
/// ```rust
/// use usage_throttle::admission_control::ThrottleSettings;
///
/// let settings = ThrottleSettings::builder()
///     .max_concurrent(4)
///     .base_backoff_ms(500)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Builder)]
pub struct ThrottleSettings {
    /// Usage percentage at which the soft-throttle delay begins.
    #[builder(default = 75.0)]
    pub(crate) throttle_threshold: f64,

    /// Usage percentage at which submissions are deferred to the queue.
    #[builder(default = 90.0)]
    pub(crate) pause_threshold: f64,

    /// Backoff before the first retry of a rate-limit failure.
    #[builder(default = 1000)]
    pub(crate) base_backoff_ms: u64,

    /// Upper bound on a single backoff, however many consecutive
    /// rate-limit failures a bucket has seen.
    #[builder(default = 300_000)]
    pub(crate) max_backoff_ms: u64,

    /// Retries attempted for rate-limit-classified failures. The total
    /// attempt count is `max_retries + 1`.
    #[builder(default = 5)]
    pub(crate) max_retries: u32,

    /// Period of the queue-drain timer. The timer only runs while work
    /// is queued or in flight; completions also drain immediately.
    #[builder(default = 100)]
    pub(crate) drain_interval_ms: u64,

    /// Ceiling on concurrently in-flight calls across the engine.
    #[builder(default = 10)]
    pub(crate) max_concurrent: usize,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ThrottleSettings {
    /// Checks the threshold ordering invariant.
    pub fn validate(&self) -> Result<(), ThrottleError> {
        let ordered = self.throttle_threshold > 0.0
            && self.throttle_threshold < self.pause_threshold
            && self.pause_threshold < 100.0;
        if !ordered {
            return InvalidThresholdsSnafu {
                throttle: self.throttle_threshold,
                pause: self.pause_threshold,
            }
            .fail();
        }
        Ok(())
    }

    /// Delay applied to calls admitted between the throttle and pause
    /// thresholds: linear from 50 ms at the former to 2000 ms at the
    /// latter.
    pub(crate) fn soft_delay(&self, usage: f64) -> Duration {
        let span = self.pause_threshold - self.throttle_threshold;
        let fraction = ((usage - self.throttle_threshold) / span).clamp(0.0, 1.0);
        let range = (SOFT_DELAY_CEIL_MS - SOFT_DELAY_FLOOR_MS) as f64;
        Duration::from_millis(SOFT_DELAY_FLOOR_MS + (fraction * range) as u64)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub(crate) fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Errors raised by the engine itself. Everything else, rate-limit
/// failures included, belongs to the caller's error type and passes
/// through untouched.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ThrottleError {
    /// Queued or newly submitted work rejected because `shutdown()`
    /// was called.
    #[snafu(display("engine is shutting down"))]
    ShuttingDown,

    /// Settings violate `0 < throttle < pause < 100`.
    #[snafu(display(
        "invalid thresholds: throttle {throttle}% and pause {pause}% must satisfy 0 < throttle < pause < 100"
    ))]
    InvalidThresholds { throttle: f64, pause: f64 },
}

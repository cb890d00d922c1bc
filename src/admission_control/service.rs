//! The engine facade.
//!
//! One [`UsageThrottle`] instance owns the bucket map, the pending
//! queue, and the in-flight ceiling for one shared provider limit.
//! Clones share that state, so the API-wrapper layer can hand a clone
//! to each of its consumers. Instances do not coordinate across
//! processes; one engine per process-wide limit.

use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use http::HeaderMap;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use super::scheduler::Scheduler;
use super::usage::{Bucket, UsageTracker};
use super::{ThrottleError, ThrottleSettings, retries, stats};

/// Adaptive rate-limiting and request-queueing engine for a
/// usage-metered API.
///
/// Control flow per call: the caller wraps its unit of work with
/// [`execute_with_retry`](Self::execute_with_retry), which drives
/// attempts through [`submit`](Self::submit); the scheduler admits or
/// queues each attempt; after the transport responds, the caller feeds
/// the response headers back through
/// [`update_from_headers`](Self::update_from_headers) so the next
/// admission decision sees fresh telemetry.
#[derive(Clone)]
pub struct UsageThrottle {
    scheduler: Scheduler,
    tracker: Arc<UsageTracker>,
    settings: ThrottleSettings,
}

impl Debug for UsageThrottle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageThrottle")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl UsageThrottle {
    /// Builds an engine, checking the settings invariant
    /// (`0 < throttle_threshold < pause_threshold < 100`).
    pub fn new(settings: ThrottleSettings) -> Result<Self, ThrottleError> {
        settings.validate()?;
        let tracker = Arc::new(UsageTracker::default());
        let scheduler = Scheduler::new(settings, Arc::clone(&tracker));
        Ok(Self {
            scheduler,
            tracker,
            settings,
        })
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    /// Runs `work` through the admission gate under the given consumer
    /// identity and bucket key. See the admission order on
    /// [`ThrottleSettings`].
    pub async fn submit<T, F, Fut>(
        &self,
        consumer: &str,
        bucket_key: &str,
        work: F,
    ) -> Result<T, crate::Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, crate::Error>>,
    {
        self.scheduler.submit(consumer, bucket_key, work).await
    }

    /// Attempts `work` up to `max_retries + 1` times, backing off
    /// exponentially between attempts that fail with an error
    /// `is_rate_limit` classifies as a rate limit. Success resets the
    /// bucket's consecutive-throttle counter; a non-rate-limit error
    /// propagates immediately and untouched; once attempts are
    /// exhausted the last rate-limit error propagates.
    pub async fn execute_with_retry<T, F, Fut, C>(
        &self,
        bucket_key: &str,
        mut work: F,
        is_rate_limit: C,
    ) -> Result<T, crate::Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, crate::Error>>,
        C: Fn(&crate::Error) -> bool,
    {
        let max_attempts = self.settings.max_retries + 1;
        let mut attempt = 1u32;
        loop {
            match work().await {
                Ok(value) => {
                    self.record_success(bucket_key);
                    return Ok(value);
                }
                Err(error) if is_rate_limit(&error) => {
                    let backoff = self.record_throttle(bucket_key);
                    if attempt >= max_attempts {
                        error!(
                            bucket = bucket_key,
                            attempts = attempt,
                            "Rate limited and retries exhausted; surfacing the error"
                        );
                        return Err(error);
                    }
                    warn!(
                        bucket = bucket_key,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited; backing off before retry"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Merges usage telemetry from a response's headers into the
    /// bucket. Malformed or absent telemetry is ignored.
    pub fn update_from_headers(&self, bucket_key: &str, headers: &HeaderMap) {
        self.tracker.update_from_headers(bucket_key, headers);
    }

    /// Whether the bucket's throttle deadline is strictly in the
    /// future.
    pub fn is_throttled(&self, bucket_key: &str) -> bool {
        self.tracker.is_throttled(bucket_key)
    }

    /// Snapshot of the bucket's state, if it has ever been observed.
    pub fn bucket_usage(&self, bucket_key: &str) -> Option<Bucket> {
        self.tracker.bucket(bucket_key)
    }

    /// Records an externally-observed rate-limit rejection against the
    /// bucket: bumps the consecutive-throttle counter, raises the
    /// throttle deadline by the resulting backoff, and returns that
    /// backoff.
    pub fn record_throttle(&self, bucket_key: &str) -> Duration {
        let consecutive = self.tracker.bump_throttle(bucket_key);
        let backoff = retries::backoff(&self.settings, consecutive);
        self.tracker
            .extend_throttle(bucket_key, Instant::now() + backoff);
        stats::emit_backoff(backoff);
        warn!(
            bucket = bucket_key,
            consecutive,
            backoff_ms = backoff.as_millis() as u64,
            "Rate limit recorded; bucket throttle raised"
        );
        backoff
    }

    /// Records an externally-observed success, resetting the bucket's
    /// consecutive-throttle counter.
    pub fn record_success(&self, bucket_key: &str) {
        self.tracker.reset_throttle(bucket_key);
    }

    /// Rejects all queued work with [`ThrottleError::ShuttingDown`]
    /// and stops the drain timer. In-flight work runs to completion;
    /// there is no per-call cancellation.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}

//! Backoff computation for rate-limit-classified failures.
//!
//! The delay grows exponentially with the bucket's consecutive-
//! throttle counter, carries up to a second of jitter so recovering
//! callers do not stampede the provider in lockstep, and is capped by
//! `max_backoff_ms` however long a losing streak runs.

use std::time::Duration;

use super::ThrottleSettings;

/// Upper bound (exclusive) of the random jitter added to each backoff.
const JITTER_RANGE_MS: u64 = 1000;

/// Backoff for the given consecutive-throttle count (1-based: the
/// first failure of a streak yields the base backoff).
pub(crate) fn backoff(settings: &ThrottleSettings, consecutive: u32) -> Duration {
    backoff_with_jitter(settings, consecutive, rand::random::<u64>() % JITTER_RANGE_MS)
}

/// `min(base × 2^(consecutive − 1) + jitter, max)`, saturating instead
/// of overflowing for long streaks.
pub(crate) fn backoff_with_jitter(
    settings: &ThrottleSettings,
    consecutive: u32,
    jitter_ms: u64,
) -> Duration {
    let exponent = consecutive.saturating_sub(1);
    let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
    let scaled = settings.base_backoff_ms.checked_mul(factor).unwrap_or(u64::MAX);
    let delayed = scaled.saturating_add(jitter_ms);
    Duration::from_millis(delayed.min(settings.max_backoff_ms))
}

//! Usage telemetry tracking per rate-limit bucket.
//!
//! The provider reports how much of each rate-limit budget a caller
//! has consumed through response headers carrying small JSON payloads.
//! This module parses those payloads into a normalized percentage
//! record per bucket and decides whether a bucket is currently
//! throttled. Header detection is the most accurate signal available:
//! it reflects the actual current limits and comes straight from the
//! provider on every response.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use http::HeaderMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::time::Instant;

/// Usage headers in the order they are consulted: application scope,
/// business-use-case scope (nested one level deeper by an opaque id),
/// ad-account scope. The first present and parseable header wins.
const USAGE_HEADERS: [&str; 3] = [
    "x-app-usage",
    "x-business-use-case-usage",
    "x-ad-account-usage",
];

/// Keys that identify a usage record, as opposed to a nested wrapper.
const USAGE_KEYS: [&str; 3] = ["call_count", "total_cputime", "total_time"];

/// Throttle duration assumed when an exhausted bucket carries no
/// regain-access hint.
const DEFAULT_REGAIN_MINUTES: u64 = 60;

/// One usage observation: three independent budget percentages plus an
/// optional provider hint for when access returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Deserialize)]
pub struct UsageMetrics {
    /// Percentage of the call-count budget consumed.
    #[serde(default)]
    pub call_count: f64,
    /// Percentage of the CPU-time budget consumed.
    #[serde(default)]
    pub total_cputime: f64,
    /// Percentage of the wall-time budget consumed.
    #[serde(default)]
    pub total_time: f64,
    /// Minutes until the provider restores access, when supplied.
    #[serde(default)]
    pub estimated_time_to_regain_access: Option<u64>,
}

impl UsageMetrics {
    /// The bucket's effective usage: the most constrained of the three
    /// budgets.
    pub fn max_usage(&self) -> f64 {
        self.call_count.max(self.total_cputime).max(self.total_time)
    }
}

/// State of one rate-limited scope.
#[derive(Clone, Debug)]
pub struct Bucket {
    /// Most recent usage observation.
    pub usage: UsageMetrics,
    /// When that observation arrived.
    pub last_updated: Instant,
    /// Absolute deadline before which no work for this bucket may run.
    /// `None` means not throttled.
    pub throttled_until: Option<Instant>,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            usage: UsageMetrics::default(),
            last_updated: now,
            throttled_until: None,
        }
    }

    pub fn is_throttled(&self, now: Instant) -> bool {
        self.throttled_until.is_some_and(|until| until > now)
    }

    /// Raises the throttle deadline. A deadline already further in the
    /// future is kept: a stale observation must never shorten a
    /// throttle produced by a more recent event.
    fn raise_throttle(&mut self, until: Instant) {
        self.throttled_until = Some(match self.throttled_until {
            Some(existing) => existing.max(until),
            None => until,
        });
    }
}

#[derive(Debug)]
struct BucketEntry {
    bucket: Bucket,
    consecutive_throttles: u32,
}

impl BucketEntry {
    fn new(now: Instant) -> Self {
        Self {
            bucket: Bucket::new(now),
            consecutive_throttles: 0,
        }
    }
}

/// Per-bucket usage state for one engine instance.
///
/// Buckets are created lazily on first observation and live until the
/// engine is dropped. All mutation goes through these methods so the
/// monotonic-deadline invariant holds centrally.
#[derive(Debug, Default)]
pub(crate) struct UsageTracker {
    buckets: Mutex<HashMap<String, BucketEntry>>,
}

impl UsageTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, BucketEntry>> {
        self.buckets.lock().expect("bucket map lock poisoned")
    }

    /// Merges usage telemetry from a response's headers into the
    /// bucket for `bucket_key`. Missing or malformed telemetry is
    /// ignored: absence of a header must never fail the request path.
    pub(crate) fn update_from_headers(&self, bucket_key: &str, headers: &HeaderMap) {
        let Some(metrics) = usage_from_headers(headers) else {
            return;
        };
        let now = Instant::now();
        let mut buckets = self.lock();
        let entry = buckets
            .entry(bucket_key.to_string())
            .or_insert_with(|| BucketEntry::new(now));
        entry.bucket.usage = metrics;
        entry.bucket.last_updated = now;

        if metrics.max_usage() >= 100.0 {
            let minutes = metrics
                .estimated_time_to_regain_access
                .unwrap_or(DEFAULT_REGAIN_MINUTES);
            entry
                .bucket
                .raise_throttle(now + Duration::from_secs(minutes * 60));
            warn!(
                bucket = bucket_key,
                usage = metrics.max_usage(),
                regain_minutes = minutes,
                "Bucket budget exhausted; pausing until access is restored"
            );
        } else {
            debug!(
                bucket = bucket_key,
                usage = metrics.max_usage(),
                "Usage telemetry updated"
            );
        }
    }

    pub(crate) fn is_throttled(&self, bucket_key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .get(bucket_key)
            .is_some_and(|entry| entry.bucket.is_throttled(now))
    }

    pub(crate) fn bucket(&self, bucket_key: &str) -> Option<Bucket> {
        self.lock().get(bucket_key).map(|entry| entry.bucket.clone())
    }

    /// Increments the consecutive-throttle counter, creating the
    /// bucket if needed, and returns the new count.
    pub(crate) fn bump_throttle(&self, bucket_key: &str) -> u32 {
        let now = Instant::now();
        let mut buckets = self.lock();
        let entry = buckets
            .entry(bucket_key.to_string())
            .or_insert_with(|| BucketEntry::new(now));
        entry.consecutive_throttles += 1;
        entry.consecutive_throttles
    }

    /// Raises the bucket's throttle deadline to at least `until`.
    pub(crate) fn extend_throttle(&self, bucket_key: &str, until: Instant) {
        let now = Instant::now();
        let mut buckets = self.lock();
        let entry = buckets
            .entry(bucket_key.to_string())
            .or_insert_with(|| BucketEntry::new(now));
        entry.bucket.raise_throttle(until);
    }

    /// Resets the consecutive-throttle counter after a success.
    pub(crate) fn reset_throttle(&self, bucket_key: &str) {
        let mut buckets = self.lock();
        if let Some(entry) = buckets.get_mut(bucket_key) {
            if entry.consecutive_throttles > 0 {
                debug!(
                    bucket = bucket_key,
                    cleared = entry.consecutive_throttles,
                    "Success observed; consecutive-throttle counter reset"
                );
            }
            entry.consecutive_throttles = 0;
        }
    }
}

/// Scans the known usage headers and returns the first parseable
/// observation.
pub(crate) fn usage_from_headers(headers: &HeaderMap) -> Option<UsageMetrics> {
    for name in USAGE_HEADERS {
        let Some(value) = headers.get(name) else {
            continue;
        };
        let Ok(raw) = value.to_str() else {
            debug!(header = name, "Usage header is not valid UTF-8; skipping");
            continue;
        };
        match parse_usage_payload(raw) {
            Some(metrics) => return Some(metrics),
            None => debug!(header = name, "Unparseable usage header; skipping"),
        }
    }
    None
}

/// Explicit tagged parse of a usage payload: a flat record carrying
/// the known usage keys, or the business-use-case shape nesting
/// records one level deeper under an opaque scope id. In the nested
/// case the most constrained record wins.
fn parse_usage_payload(raw: &str) -> Option<UsageMetrics> {
    let value: Value = serde_json::from_str(raw).ok()?;
    if let Some(metrics) = metrics_from_value(&value) {
        return Some(metrics);
    }

    let object = value.as_object()?;
    let mut worst: Option<UsageMetrics> = None;
    for entry in object.values() {
        let candidates: Vec<UsageMetrics> = match entry {
            Value::Array(items) => items.iter().filter_map(metrics_from_value).collect(),
            Value::Object(_) => metrics_from_value(entry).into_iter().collect(),
            _ => Vec::new(),
        };
        for metrics in candidates {
            if worst.is_none_or(|current| metrics.max_usage() > current.max_usage()) {
                worst = Some(metrics);
            }
        }
    }
    worst
}

fn metrics_from_value(value: &Value) -> Option<UsageMetrics> {
    let object = value.as_object()?;
    if !USAGE_KEYS.iter().any(|key| object.contains_key(*key)) {
        return None;
    }
    serde_json::from_value(value.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;
    use tokio::time::advance;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        // Test inputs are written as multi-line JSON for readability; HTTP
        // header values may not contain newlines, so collapse them into the
        // insignificant whitespace JSON already ignores.
        let value = value.replace(['\n', '\r'], " ");
        headers.insert(name, HeaderValue::from_str(&value).unwrap());
        headers
    }

    #[test]
    fn parses_flat_app_usage() {
        let headers = headers_with(
            "x-app-usage",
            r#"{"call_count":95,"total_cputime":10,"total_time":10}"#,
        );
        let metrics = usage_from_headers(&headers).unwrap();
        assert_eq!(metrics.call_count, 95.0);
        assert_eq!(metrics.total_cputime, 10.0);
        assert_eq!(metrics.max_usage(), 95.0);
    }

    #[test]
    fn parses_nested_business_use_case_and_keeps_worst_record() {
        let headers = headers_with(
            "x-business-use-case-usage",
            r#"{"17841400000000000":[
                {"type":"ads_management","call_count":12,"total_cputime":4,"total_time":9},
                {"type":"ads_insights","call_count":3,"total_cputime":88,"total_time":20,
                 "estimated_time_to_regain_access":5}
            ]}"#,
        );
        let metrics = usage_from_headers(&headers).unwrap();
        assert_eq!(metrics.total_cputime, 88.0);
        assert_eq!(metrics.estimated_time_to_regain_access, Some(5));
    }

    #[test]
    fn falls_back_to_ad_account_header() {
        let headers = headers_with(
            "x-ad-account-usage",
            r#"{"call_count":40,"total_cputime":1,"total_time":2}"#,
        );
        assert_eq!(usage_from_headers(&headers).unwrap().call_count, 40.0);
    }

    #[test]
    fn app_usage_takes_precedence_over_account_usage() {
        let mut headers = headers_with("x-app-usage", r#"{"call_count":10}"#);
        headers.insert(
            "x-ad-account-usage",
            HeaderValue::from_static(r#"{"call_count":99}"#),
        );
        assert_eq!(usage_from_headers(&headers).unwrap().call_count, 10.0);
    }

    #[test]
    fn malformed_payloads_yield_no_update() {
        assert!(usage_from_headers(&headers_with("x-app-usage", "not json")).is_none());
        assert!(usage_from_headers(&headers_with("x-app-usage", "[1,2,3]")).is_none());
        assert!(usage_from_headers(&headers_with("x-app-usage", r#"{"pages":7}"#)).is_none());
        assert!(usage_from_headers(&HeaderMap::new()).is_none());
    }

    #[test]
    fn malformed_header_leaves_bucket_untouched() {
        let tracker = UsageTracker::default();
        tracker.update_from_headers("app-1", &headers_with("x-app-usage", "{{{"));
        assert!(tracker.bucket("app-1").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_throttles_for_hinted_minutes() {
        let tracker = UsageTracker::default();
        tracker.update_from_headers(
            "app-1",
            &headers_with(
                "x-app-usage",
                r#"{"call_count":100,"total_cputime":5,"total_time":5,
                    "estimated_time_to_regain_access":2}"#,
            ),
        );
        assert!(tracker.is_throttled("app-1"));

        advance(Duration::from_secs(119)).await;
        assert!(tracker.is_throttled("app-1"));
        advance(Duration::from_secs(2)).await;
        assert!(!tracker.is_throttled("app-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_defaults_to_sixty_minutes() {
        let tracker = UsageTracker::default();
        let before = Instant::now();
        tracker.update_from_headers("app-1", &headers_with("x-app-usage", r#"{"call_count":100}"#));

        let bucket = tracker.bucket("app-1").unwrap();
        let until = bucket.throttled_until.unwrap();
        assert_eq!(until - before, Duration::from_secs(3600));

        advance(Duration::from_secs(3599)).await;
        assert!(tracker.is_throttled("app-1"));
        advance(Duration::from_secs(2)).await;
        assert!(!tracker.is_throttled("app-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_observation_never_lowers_a_future_deadline() {
        let tracker = UsageTracker::default();
        let now = Instant::now();
        tracker.extend_throttle("app-1", now + Duration::from_secs(600));

        // A fresh exhaustion report with a 1-minute hint must not pull
        // the deadline below the already-recorded 10 minutes.
        tracker.update_from_headers(
            "app-1",
            &headers_with(
                "x-app-usage",
                r#"{"call_count":100,"estimated_time_to_regain_access":1}"#,
            ),
        );
        let until = tracker.bucket("app-1").unwrap().throttled_until.unwrap();
        assert_eq!(until - now, Duration::from_secs(600));

        advance(Duration::from_secs(599)).await;
        assert!(tracker.is_throttled("app-1"));
    }

    #[test]
    fn sub_exhaustion_usage_does_not_throttle() {
        let tracker = UsageTracker::default();
        tracker.update_from_headers("app-1", &headers_with("x-app-usage", r#"{"call_count":99}"#));
        assert!(!tracker.is_throttled("app-1"));
        assert_eq!(tracker.bucket("app-1").unwrap().usage.call_count, 99.0);
    }

    #[test]
    fn throttle_counter_bumps_and_resets() {
        let tracker = UsageTracker::default();
        assert_eq!(tracker.bump_throttle("app-1"), 1);
        assert_eq!(tracker.bump_throttle("app-1"), 2);
        tracker.reset_throttle("app-1");
        assert_eq!(tracker.bump_throttle("app-1"), 1);
    }
}

//! Metrics emitted by the admission gate.
//!
//! Recorded through the `metrics` facade; wire up an exporter in the
//! host application to collect them.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

pub(crate) fn emit_in_flight(in_flight: usize) {
    gauge!("usage_throttle_in_flight").set(in_flight as f64);
}

pub(crate) fn emit_deferred(consumer: &str) {
    counter!("usage_throttle_deferred_total", "consumer" => consumer.to_string()).increment(1);
}

pub(crate) fn emit_queue_wait(waited: Duration) {
    histogram!("usage_throttle_queue_wait_ms").record(waited.as_millis() as f64);
}

pub(crate) fn emit_soft_delay(delay: Duration) {
    histogram!("usage_throttle_soft_delay_ms").record(delay.as_millis() as f64);
}

pub(crate) fn emit_backoff(backoff: Duration) {
    histogram!("usage_throttle_backoff_ms").record(backoff.as_millis() as f64);
}

pub(crate) fn emit_shutdown_rejections(rejected: usize) {
    counter!("usage_throttle_shutdown_rejected_total").increment(rejected as u64);
}

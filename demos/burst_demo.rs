// demos/burst_demo.rs
//
// A self-contained simulation of the admission gate: three consumers
// burst twelve jobs against one shared ad-account bucket. No network
// is involved; the "provider" is a counter that reports climbing
// usage telemetry and answers every fifth call with a 429. Watch the
// log to see soft delays, deferrals, and retry backoff in action:
//
//   RUST_LOG=usage_throttle=debug cargo run --example burst_demo

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use usage_throttle::admission_control::http::{ApiResponse, is_rate_limit_error};
use usage_throttle::admission_control::{ThrottleSettings, UsageThrottle};

const BUCKET: &str = "act_1337";

/// One fake provider round-trip: climbing usage, a 429 every fifth
/// call.
async fn fake_api_call(
    engine: &UsageThrottle,
    calls: &AtomicUsize,
) -> Result<usize, usage_throttle::Error> {
    tokio::time::sleep(Duration::from_millis(25)).await;
    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
    let usage = (40 + n * 4).min(88);

    let mut headers = HeaderMap::new();
    let payload = format!(r#"{{"call_count":{usage},"total_cputime":12,"total_time":9}}"#);
    headers.insert("x-app-usage", HeaderValue::from_str(&payload).unwrap());

    let status = if n % 5 == 0 {
        StatusCode::TOO_MANY_REQUESTS
    } else {
        StatusCode::OK
    };
    let response = ApiResponse {
        status,
        headers,
        body: Bytes::new(),
    };

    engine.update_from_headers(BUCKET, &response.headers);
    if response.is_success() {
        Ok(n)
    } else {
        Err(Box::new(response.into_error()) as usage_throttle::Error)
    }
}

#[tokio::main]
async fn main() -> Result<(), usage_throttle::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let engine = UsageThrottle::new(
        ThrottleSettings::builder()
            .max_concurrent(4)
            .base_backoff_ms(200)
            .build(),
    )?;
    let calls = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for consumer in ["campaigns", "insights", "audiences"] {
        for job in 0..4 {
            let engine = engine.clone();
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                let result = engine
                    .execute_with_retry(
                        BUCKET,
                        || {
                            let engine = engine.clone();
                            let calls = Arc::clone(&calls);
                            async move {
                                let api = engine.clone();
                                engine
                                    .submit(consumer, BUCKET, move || async move {
                                        fake_api_call(&api, &calls).await
                                    })
                                    .await
                            }
                        },
                        is_rate_limit_error,
                    )
                    .await;
                match result {
                    Ok(n) => info!(consumer, job, call = n, "job finished"),
                    Err(error) => info!(consumer, job, %error, "job failed"),
                }
            }));
        }
    }
    for handle in handles {
        let _ = handle.await;
    }

    let bucket = engine.bucket_usage(BUCKET).expect("telemetry was recorded");
    info!(
        final_usage = bucket.usage.max_usage(),
        throttled = engine.is_throttled(BUCKET),
        "burst complete"
    );
    engine.shutdown();
    Ok(())
}

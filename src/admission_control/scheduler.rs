//! Admission gate and pending-work queue shared by all outbound calls.
//!
//! Every submission is tagged with a consumer identity and a bucket
//! key. Work is admitted immediately while the bucket and the global
//! in-flight ceiling allow it, and deferred to per-consumer FIFO
//! sub-queues otherwise. The queue drains round-robin across
//! consumers, both on a lazily-armed interval timer and immediately
//! whenever an in-flight call completes.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, sleep};

use super::usage::{Bucket, UsageTracker};
use super::{ThrottleError, ThrottleSettings, stats};

/// Outcome of evaluating one submission against bucket and capacity
/// state, in the order the checks are defined: bucket throttled, usage
/// at pause, capacity exhausted, usage in the soft band, clear.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Admission {
    Run,
    RunDelayed(Duration),
    Defer,
}

pub(crate) fn admit(
    bucket: Option<&Bucket>,
    in_flight: usize,
    settings: &ThrottleSettings,
    now: Instant,
) -> Admission {
    let usage = bucket.map(|b| b.usage.max_usage());
    if bucket.is_some_and(|b| b.is_throttled(now)) {
        return Admission::Defer;
    }
    if usage.is_some_and(|u| u >= settings.pause_threshold) {
        return Admission::Defer;
    }
    if in_flight >= settings.max_concurrent {
        return Admission::Defer;
    }
    match usage {
        Some(u) if u >= settings.throttle_threshold => Admission::RunDelayed(settings.soft_delay(u)),
        _ => Admission::Run,
    }
}

/// One deferred submission. The deferred operation itself stays with
/// the caller's suspended `submit` future; the queue holds only what
/// is needed to grant it an execution permit or reject it at shutdown.
struct Waiter {
    bucket_key: String,
    enqueued_at: Instant,
    permit: oneshot::Sender<Result<InFlightGuard, ThrottleError>>,
}

#[derive(Default)]
struct SchedState {
    /// FIFO sub-queue per consumer.
    queues: HashMap<String, VecDeque<Waiter>>,
    /// Round-robin order over consumers with queued work.
    rotation: VecDeque<String>,
    in_flight: usize,
    drain_task_running: bool,
    shutting_down: bool,
}

struct SchedInner {
    state: Mutex<SchedState>,
    tracker: Arc<UsageTracker>,
    settings: ThrottleSettings,
}

impl SchedInner {
    fn lock(&self) -> MutexGuard<'_, SchedState> {
        self.state.lock().expect("scheduler state lock poisoned")
    }

    /// Whether a queued item for this bucket may start right now. The
    /// in-flight ceiling is the drain loop's own concern.
    fn bucket_admits(&self, bucket_key: &str, now: Instant) -> bool {
        match self.tracker.bucket(bucket_key) {
            None => true,
            Some(bucket) => {
                !bucket.is_throttled(now) && bucket.usage.max_usage() < self.settings.pause_threshold
            }
        }
    }
}

/// Holds one slot of the in-flight ceiling. Dropping it releases the
/// slot and drains the queue, so neither completion, panic unwinding,
/// nor a caller dropping its future mid-call can leak capacity.
pub(crate) struct InFlightGuard {
    inner: Option<Arc<SchedInner>>,
}

impl InFlightGuard {
    fn new(inner: Arc<SchedInner>) -> Self {
        Self { inner: Some(inner) }
    }

    /// Forgets the slot without releasing it. Only for the drain loop,
    /// which reclaims the slot itself while already holding the lock.
    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.take() else {
            return;
        };
        let mut state = inner.lock();
        state.in_flight -= 1;
        stats::emit_in_flight(state.in_flight);
        drain_locked(&inner, &mut state);
    }
}

enum AdmitOutcome {
    Admitted {
        guard: InFlightGuard,
        delay: Option<Duration>,
    },
    Enqueued(oneshot::Receiver<Result<InFlightGuard, ThrottleError>>),
    Rejected,
}

/// The admission-control gate. Clones share one queue, one bucket map,
/// and one in-flight ceiling.
#[derive(Clone)]
pub(crate) struct Scheduler {
    inner: Arc<SchedInner>,
}

impl Scheduler {
    pub(crate) fn new(settings: ThrottleSettings, tracker: Arc<UsageTracker>) -> Self {
        Self {
            inner: Arc::new(SchedInner {
                state: Mutex::new(SchedState::default()),
                tracker,
                settings,
            }),
        }
    }

    /// Runs `work` once the bucket and the in-flight ceiling admit it,
    /// deferring to the queue when they do not. Resolves with the
    /// work's own result, or with [`ThrottleError::ShuttingDown`] if
    /// the engine shuts down first.
    pub(crate) async fn submit<T, F, Fut>(
        &self,
        consumer: &str,
        bucket_key: &str,
        work: F,
    ) -> Result<T, crate::Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, crate::Error>>,
    {
        let (guard, delay) = match self.admit_or_enqueue(consumer, bucket_key) {
            AdmitOutcome::Admitted { guard, delay } => (guard, delay),
            AdmitOutcome::Rejected => return Err(Box::new(ThrottleError::ShuttingDown)),
            AdmitOutcome::Enqueued(receiver) => {
                stats::emit_deferred(consumer);
                debug!(consumer, bucket = bucket_key, "Submission deferred to queue");
                match receiver.await {
                    Ok(Ok(guard)) => (guard, None),
                    Ok(Err(error)) => return Err(Box::new(error)),
                    // Sender dropped without resolving: engine torn down.
                    Err(_) => return Err(Box::new(ThrottleError::ShuttingDown)),
                }
            }
        };

        if let Some(delay) = delay {
            stats::emit_soft_delay(delay);
            debug!(
                consumer,
                bucket = bucket_key,
                delay_ms = delay.as_millis() as u64,
                "Soft throttle; delaying before execution"
            );
            sleep(delay).await;
        }

        let result = work().await;
        drop(guard);
        result
    }

    fn admit_or_enqueue(&self, consumer: &str, bucket_key: &str) -> AdmitOutcome {
        let mut state = self.inner.lock();
        if state.shutting_down {
            return AdmitOutcome::Rejected;
        }

        let now = Instant::now();
        let bucket = self.inner.tracker.bucket(bucket_key);
        match admit(bucket.as_ref(), state.in_flight, &self.inner.settings, now) {
            decision @ (Admission::Run | Admission::RunDelayed(_)) => {
                state.in_flight += 1;
                stats::emit_in_flight(state.in_flight);
                let delay = match decision {
                    Admission::RunDelayed(delay) => Some(delay),
                    _ => None,
                };
                AdmitOutcome::Admitted {
                    guard: InFlightGuard::new(Arc::clone(&self.inner)),
                    delay,
                }
            }
            Admission::Defer => {
                let (sender, receiver) = oneshot::channel();
                if !state.queues.contains_key(consumer) {
                    state.rotation.push_back(consumer.to_string());
                }
                state
                    .queues
                    .entry(consumer.to_string())
                    .or_default()
                    .push_back(Waiter {
                        bucket_key: bucket_key.to_string(),
                        enqueued_at: now,
                        permit: sender,
                    });
                self.ensure_drain_task(&mut state);
                AdmitOutcome::Enqueued(receiver)
            }
        }
    }

    /// Arms the interval drain task if it is not already running. The
    /// task exits on its own once the queue is empty and nothing is in
    /// flight, and is re-armed here on the next enqueue.
    fn ensure_drain_task(&self, state: &mut SchedState) {
        if state.drain_task_running {
            return;
        }
        state.drain_task_running = true;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let interval = inner.settings.drain_interval();
            loop {
                sleep(interval).await;
                let mut state = inner.lock();
                if state.shutting_down {
                    state.drain_task_running = false;
                    break;
                }
                drain_locked(&inner, &mut state);
                if state.queues.is_empty() && state.in_flight == 0 {
                    state.drain_task_running = false;
                    debug!("Pending queue drained; releasing drain timer");
                    break;
                }
            }
        });
    }

    /// Rejects all queued work and stops the drain timer. In-flight
    /// work runs to completion; its guards find an empty queue.
    pub(crate) fn shutdown(&self) {
        let mut state = self.inner.lock();
        if state.shutting_down {
            return;
        }
        state.shutting_down = true;
        state.rotation.clear();
        let mut rejected = 0usize;
        for (_, queue) in state.queues.drain() {
            for waiter in queue {
                rejected += 1;
                let _ = waiter.permit.send(Err(ThrottleError::ShuttingDown));
            }
        }
        if rejected > 0 {
            stats::emit_shutdown_rejections(rejected);
            info!(rejected, "Engine shutting down; queued work rejected");
        }
    }
}

/// Grants permits while capacity remains and a queued item's bucket
/// allows it to start. Runs under the state lock; permit delivery is a
/// synchronous oneshot send, so this is callable from guard drops.
fn drain_locked(inner: &Arc<SchedInner>, state: &mut SchedState) {
    if state.shutting_down {
        return;
    }
    while state.in_flight < inner.settings.max_concurrent {
        let Some(waiter) = pick_next(inner, state) else {
            break;
        };
        state.in_flight += 1;
        stats::emit_in_flight(state.in_flight);
        stats::emit_queue_wait(Instant::now() - waiter.enqueued_at);
        let guard = InFlightGuard::new(Arc::clone(inner));
        if let Err(unclaimed) = waiter.permit.send(Ok(guard)) {
            // The caller dropped its submit future while queued.
            // Reclaim the slot here; the returned guard must not run
            // its Drop against the lock we already hold.
            if let Ok(mut guard) = unclaimed {
                guard.disarm();
            }
            state.in_flight -= 1;
            stats::emit_in_flight(state.in_flight);
        }
    }
}

/// Round-robin pick: each consumer in rotation gets one chance per
/// pass. A consumer whose head-of-queue bucket is still constrained
/// rotates to the back with its queue intact, preserving per-consumer
/// FIFO order.
fn pick_next(inner: &SchedInner, state: &mut SchedState) -> Option<Waiter> {
    let now = Instant::now();
    for _ in 0..state.rotation.len() {
        let consumer = state.rotation.pop_front()?;
        let Some(queue) = state.queues.get_mut(&consumer) else {
            continue;
        };
        let admissible = queue
            .front()
            .is_some_and(|waiter| inner.bucket_admits(&waiter.bucket_key, now));
        if admissible {
            let waiter = queue.pop_front();
            if queue.is_empty() {
                state.queues.remove(&consumer);
            } else {
                state.rotation.push_back(consumer);
            }
            return waiter;
        }
        state.rotation.push_back(consumer);
    }
    None
}

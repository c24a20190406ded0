//! Dispatcher — bounded worker pool for non-blocking HTTP delivery.
//!
//! Submission never blocks the ingestion path: it is a `try_send` into a
//! bounded channel, and a full channel rejects the job so the caller can
//! divert it to the offline queue (backpressure becomes durability, not data
//! loss). Workers convert every delivery failure into an offline enqueue and
//! never propagate errors past the delivery attempt.

use crate::config::DispatcherConfig;
use crate::engine::EngineCounters;
use crate::guard::LifecycleGuard;
use crate::offline::OfflineQueue;
use crate::transport::Collector;
use crate::types::{CourseKey, CourseStatus, QueuedItem, TelemetryPayload, TrackingEvent};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One unit of delivery work.
#[derive(Debug)]
pub struct DispatchJob {
    pub payload: TelemetryPayload,
    pub course_key: CourseKey,
    pub auth_token: String,
}

/// Fixed-size delivery pool fed by a bounded submission queue.
pub struct Dispatcher {
    tx: mpsc::Sender<DispatchJob>,
    workers: Vec<JoinHandle<()>>,
    guard: Arc<LifecycleGuard>,
}

impl Dispatcher {
    /// Spawn the worker pool.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        collector: Arc<dyn Collector>,
        offline: Arc<OfflineQueue>,
        guard: Arc<LifecycleGuard>,
        events: broadcast::Sender<TrackingEvent>,
        counters: Arc<EngineCounters>,
        cfg: &DispatcherConfig,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(cfg.queue_capacity.max(1));
        // A tokio mpsc receiver is single-consumer; the workers share it
        // behind an async mutex and take turns receiving.
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..cfg.workers.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    rx.clone(),
                    collector.clone(),
                    offline.clone(),
                    guard.clone(),
                    events.clone(),
                    counters.clone(),
                    request_timeout,
                    cancel.clone(),
                ))
            })
            .collect();

        Self { tx, workers, guard }
    }

    /// Enqueue one job without blocking.
    ///
    /// A full (or closed) queue returns the job back to the caller, which
    /// must hand it to the offline queue. A raised halt flag also rejects;
    /// the offline queue refuses new items while halted, so the returned
    /// job dies there instead of queueing mid-teardown.
    pub fn submit(&self, job: DispatchJob) -> Result<(), DispatchJob> {
        if self.guard.halted() {
            return Err(job);
        }
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                warn!(trip_id = %job.payload.trip_id, "Dispatch queue full — rejecting submission");
                Err(job)
            }
            Err(TrySendError::Closed(job)) => Err(job),
        }
    }

    /// Interrupt all workers without waiting for in-flight requests.
    pub fn abort(&self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<DispatchJob>>>,
    collector: Arc<dyn Collector>,
    offline: Arc<OfflineQueue>,
    guard: Arc<LifecycleGuard>,
    events: broadcast::Sender<TrackingEvent>,
    counters: Arc<EngineCounters>,
    request_timeout: Duration,
    cancel: CancellationToken,
) {
    debug!(worker_id, "Dispatch worker started");
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        // Teardown fence: jobs arriving mid-halt are dropped silently.
        if guard.halted() {
            continue;
        }

        deliver_job(
            job,
            collector.as_ref(),
            &offline,
            &events,
            &counters,
            request_timeout,
        )
        .await;
    }
    debug!(worker_id, "Dispatch worker stopped");
}

/// Deliver one payload; failures become offline enqueues, never panics or
/// propagated errors.
async fn deliver_job(
    job: DispatchJob,
    collector: &dyn Collector,
    offline: &OfflineQueue,
    events: &broadcast::Sender<TrackingEvent>,
    counters: &EngineCounters,
    request_timeout: Duration,
) {
    match collector
        .deliver(&job.payload, &job.auth_token, request_timeout)
        .await
    {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
            debug!(trip_id = %job.payload.trip_id, "Position delivered");
            // One-way notification for the map/analytics collaborator;
            // not a dependency of delivery success.
            if job.payload.status == CourseStatus::Active.wire_code() {
                let _ = events.send(TrackingEvent::PositionSent {
                    course_key: job.course_key,
                    trip_id: job.payload.trip_id,
                    lat: job.payload.lat,
                    lng: job.payload.lng,
                    speed_kmh: job.payload.speed_kmh,
                    accuracy_m: job.payload.accuracy_m,
                    is_active: true,
                });
            }
        }
        Err(e) if e.is_permanent() => {
            counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
            warn!(trip_id = %job.payload.trip_id, error = %e, "Permanent delivery failure — dropping payload");
        }
        Err(e) => {
            counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
            debug!(trip_id = %job.payload.trip_id, error = %e, "Delivery failed — queueing for retry");
            let now = chrono::Utc::now().timestamp() as u64;
            offline.enqueue(QueuedItem::new(
                job.payload,
                job.course_key,
                &job.auth_token,
                now,
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::EVENT_CHANNEL_CAPACITY;
    use crate::transport::DeliveryError;
    use std::sync::atomic::AtomicBool;

    /// Collector that either succeeds, fails transiently, or hangs forever.
    struct TestCollector {
        fail: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Collector for TestCollector {
        async fn deliver(
            &self,
            _payload: &TelemetryPayload,
            _auth_token: &str,
            _timeout: Duration,
        ) -> Result<(), DeliveryError> {
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                Err(DeliveryError::Rejected(
                    reqwest::StatusCode::SERVICE_UNAVAILABLE,
                ))
            } else {
                Ok(())
            }
        }
    }

    fn make_job(n: u64) -> DispatchJob {
        DispatchJob {
            payload: TelemetryPayload {
                trip_id: format!("T{n}"),
                vehicle_id: "B100ABC".to_string(),
                lat: 44.0,
                lng: 26.0,
                speed_kmh: 36,
                bearing_deg: 0,
                altitude_m: 0,
                accuracy_m: 5,
                gsm_signal: 4,
                battery: "90%".to_string(),
                status: 2,
                timestamp: "2026-01-15 10:30:00".to_string(),
            },
            course_key: CourseKey::new("B100ABC", "C1", "dev", "tok"),
            auth_token: "tok".to_string(),
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        offline: Arc<OfflineQueue>,
        counters: Arc<EngineCounters>,
        events: broadcast::Sender<TrackingEvent>,
        guard: Arc<LifecycleGuard>,
        cancel: CancellationToken,
    }

    fn spawn_fixture(fail: bool, hang: bool, workers: usize, capacity: usize) -> Fixture {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let guard = Arc::new(LifecycleGuard::new());
        let offline = Arc::new(OfflineQueue::new(100, guard.clone(), events.clone()));
        let counters = Arc::new(EngineCounters::default());
        let cancel = CancellationToken::new();
        let collector = Arc::new(TestCollector {
            fail: AtomicBool::new(fail),
            hang: AtomicBool::new(hang),
        });
        let dispatcher = Dispatcher::spawn(
            collector,
            offline.clone(),
            guard.clone(),
            events.clone(),
            counters.clone(),
            &DispatcherConfig {
                workers,
                queue_capacity: capacity,
            },
            Duration::from_secs(15),
            cancel.clone(),
        );
        Fixture {
            dispatcher,
            offline,
            counters,
            events,
            guard,
            cancel,
        }
    }

    async fn wait_until(mut pred: impl FnMut() -> bool) {
        for _ in 0..500 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_successful_delivery_emits_position_event() {
        let fixture = spawn_fixture(false, false, 3, 10);
        let mut rx = fixture.events.subscribe();

        fixture.dispatcher.submit(make_job(1)).unwrap();
        wait_until(|| fixture.counters.delivered.load(Ordering::Relaxed) == 1).await;

        let event = rx.recv().await.unwrap();
        match event {
            TrackingEvent::PositionSent { trip_id, speed_kmh, is_active, .. } => {
                assert_eq!(trip_id, "T1");
                assert_eq!(speed_kmh, 36);
                assert!(is_active);
            }
            other => panic!("expected PositionSent, got {other:?}"),
        }
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn test_failed_delivery_lands_in_offline_queue() {
        let fixture = spawn_fixture(true, false, 3, 10);

        fixture.dispatcher.submit(make_job(1)).unwrap();
        wait_until(|| fixture.offline.depth() == 1).await;

        let item = fixture.offline.drain_batch(1).remove(0);
        assert_eq!(item.retry_count, 0);
        assert_eq!(item.payload.trip_id, "T1");
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        // One worker hung on a never-resolving delivery, capacity 1:
        // the queue fills and further submissions bounce back.
        let fixture = spawn_fixture(false, true, 1, 1);

        let mut rejected = 0;
        for n in 0..5 {
            if fixture.dispatcher.submit(make_job(n)).is_err() {
                rejected += 1;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rejected >= 3, "expected most submissions rejected, got {rejected}");
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn test_halted_guard_rejects_submission() {
        let fixture = spawn_fixture(false, false, 2, 10);
        fixture.guard.halt();

        // Nothing may enter the delivery queue once teardown has begun.
        assert!(fixture.dispatcher.submit(make_job(1)).is_err());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.counters.delivered.load(Ordering::Relaxed), 0);
        assert_eq!(fixture.offline.depth(), 0);
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn test_cancel_stops_workers() {
        let fixture = spawn_fixture(false, false, 2, 10);
        fixture.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Workers are gone; submissions still queue but nothing drains them.
        fixture.dispatcher.submit(make_job(1)).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.counters.delivered.load(Ordering::Relaxed), 0);
    }
}

//! Telemetry Engine — wiring and control surface for course tracking.
//!
//! One explicitly constructed engine instance owns its registry, offline
//! queue, worker pool, and halt flag; the "one engine per session" invariant
//! is expressed through construction and [`stop_all`](TelemetryEngine::stop_all)
//! rather than static fields. The host injects the location source, the
//! device probe, and the wake lease; the engine only consumes them.
//!
//! Control commands are fire-and-forget from the caller's perspective:
//! outcomes surface through the advisory event channel and local logs, never
//! through blocking return values.

use crate::config::AgentConfig;
use crate::dispatch::{DispatchJob, Dispatcher};
use crate::guard::{LifecycleGuard, NoopWakeLease, WakeLease};
use crate::offline::OfflineQueue;
use crate::registry::CourseRegistry;
use crate::sample::build_payload;
use crate::source::{DeviceTelemetry, FixEvent, LocationSource, StaticDeviceTelemetry};
use crate::sweeper::run_sweeper;
use crate::transport::Collector;
use crate::types::{CourseEntry, CourseStatus, LocationFix, QueuedItem, TrackingEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::EVENT_CHANNEL_CAPACITY;

// ============================================================================
// Statistics
// ============================================================================

/// Shared atomic counters, incremented by the engine, the dispatcher
/// workers, and the synchronous status path.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub fixes_accepted: AtomicU64,
    pub payloads_submitted: AtomicU64,
    pub submissions_rejected: AtomicU64,
    pub delivered: AtomicU64,
    pub delivery_failures: AtomicU64,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub fixes_accepted: u64,
    pub payloads_submitted: u64,
    pub submissions_rejected: u64,
    pub delivered: u64,
    pub delivery_failures: u64,
    pub queue_depth: usize,
    pub active_courses: usize,
}

impl std::fmt::Display for EngineStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Engine: {} fixes, {} payloads ({} delivered, {} failed, {} rejected), {} queued, {} active courses",
            self.fixes_accepted,
            self.payloads_submitted,
            self.delivered,
            self.delivery_failures,
            self.submissions_rejected,
            self.queue_depth,
            self.active_courses
        )
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Per-session background tasks. Dropped as a unit during teardown.
struct Session {
    dispatcher: Dispatcher,
    sweeper: JoinHandle<()>,
    cancel: CancellationToken,
}

/// The telemetry transmission engine.
pub struct TelemetryEngine {
    config: AgentConfig,
    registry: Arc<CourseRegistry>,
    offline: Arc<OfflineQueue>,
    guard: Arc<LifecycleGuard>,
    collector: Arc<dyn Collector>,
    device: Arc<dyn DeviceTelemetry>,
    wake: Arc<dyn WakeLease>,
    events: broadcast::Sender<TrackingEvent>,
    counters: Arc<EngineCounters>,
    /// Last fix seen this session; status transmissions report from here.
    last_fix: RwLock<Option<LocationFix>>,
    session: tokio::sync::RwLock<Option<Session>>,
}

impl TelemetryEngine {
    /// Construct an engine around an injected collector.
    ///
    /// Background tasks are not spawned here; they start with the first
    /// [`start`](Self::start) and die with [`stop_all`](Self::stop_all).
    pub fn new(config: AgentConfig, collector: Arc<dyn Collector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let guard = Arc::new(LifecycleGuard::new());
        let offline = Arc::new(OfflineQueue::new(
            config.offline.capacity,
            guard.clone(),
            events.clone(),
        ));

        Self {
            config,
            registry: Arc::new(CourseRegistry::new()),
            offline,
            guard,
            collector,
            device: Arc::new(StaticDeviceTelemetry::default()),
            wake: Arc::new(NoopWakeLease),
            events,
            counters: Arc::new(EngineCounters::default()),
            last_fix: RwLock::new(None),
            session: tokio::sync::RwLock::new(None),
        }
    }

    /// Replace the default device probe.
    #[must_use]
    pub fn with_device_telemetry(mut self, device: Arc<dyn DeviceTelemetry>) -> Self {
        self.device = device;
        self
    }

    /// Replace the default (no-op) wake lease.
    #[must_use]
    pub fn with_wake_lease(mut self, wake: Arc<dyn WakeLease>) -> Self {
        self.wake = wake;
        self
    }

    // ------------------------------------------------------------------
    // Control surface
    // ------------------------------------------------------------------

    /// Begin (or idempotently re-begin) tracking a course.
    ///
    /// The first start of a fresh session clears the halt flag, acquires the
    /// wake lease, and spawns the worker pool and retry sweeper. A blank
    /// auth token is a permanent validation failure: logged, dropped,
    /// never retried.
    pub async fn start(
        &self,
        vehicle_id: &str,
        course_id: &str,
        server_trip_id: Option<&str>,
        auth_token: &str,
        status: CourseStatus,
    ) {
        if auth_token.trim().is_empty() {
            warn!(course_id, "Start rejected: missing auth token");
            return;
        }

        {
            let mut session = self.session.write().await;
            if session.is_none() {
                *session = Some(self.spawn_session());
                info!(vehicle_id, "Tracking session started");
            }
        }

        let entry = CourseEntry::new(
            vehicle_id,
            course_id,
            server_trip_id,
            &self.config.device.device_id,
            auth_token,
            status,
        );
        info!(key = %entry.key, trip_id = %entry.server_trip_id, status = %status, "Course registered");
        self.registry.upsert(entry);
    }

    /// Transition a course's status.
    ///
    /// Pause and stop transitions transmit one status sample synchronously —
    /// not via the async pool — because the caller may immediately remove
    /// the course, and a dropped async payload would be unrecoverable. A
    /// stop removes the course once its final transmission has succeeded or
    /// been queued. Unknown courses are a logged no-op.
    pub async fn update_status(&self, course_id: &str, new_status: CourseStatus) {
        if self.guard.halted() {
            return;
        }

        let Some(mut entry) = self.registry.find_by_course_id(course_id) else {
            warn!(course_id, "Status update for unknown course — ignoring");
            return;
        };

        self.registry.set_status(&entry.key, new_status);
        if new_status == CourseStatus::Active {
            // Resumption needs no dedicated transmission; periodic samples
            // pick the course up again on the next fix.
            return;
        }

        entry.status = new_status;
        self.transmit_status_sample(&entry).await;

        if new_status == CourseStatus::Stopped {
            self.registry.remove(&entry.key);
            let _ = self.events.send(TrackingEvent::CourseRemoved {
                course_key: entry.key.clone(),
            });
            info!(key = %entry.key, "Course stopped and removed");
        }
    }

    /// Stop one course (terminal transition + removal).
    pub async fn stop(&self, course_id: &str) {
        self.update_status(course_id, CourseStatus::Stopped).await;
    }

    /// Tear down the whole session (logout path).
    ///
    /// Order is load-bearing: the halt flag is raised before anything else
    /// so work arriving on other execution contexts cannot resurrect state
    /// mid-teardown. In-flight requests are interrupted, not awaited.
    pub async fn stop_all(&self) {
        self.guard.halt();

        {
            let mut session = self.session.write().await;
            if let Some(s) = session.take() {
                s.cancel.cancel();
                s.dispatcher.abort();
                s.sweeper.abort();
            }
        }

        self.registry.clear();
        self.offline.clear();
        {
            let mut last_fix = self.last_fix.write().unwrap_or_else(PoisonError::into_inner);
            *last_fix = None;
        }
        self.wake.release();
        info!(stats = %self.stats(), "Tracking stopped — engine halted");
    }

    /// Explicit destructor; equivalent to [`stop_all`](Self::stop_all).
    pub async fn close(&self) {
        self.stop_all().await;
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Consume one location fix: fan out one payload per active course and
    /// submit each to the delivery pool without blocking.
    ///
    /// All I/O happens on worker threads; this path only builds payloads,
    /// so callbacks may be dispatched back-to-back safely.
    pub async fn on_fix(&self, fix: LocationFix) {
        if self.guard.halted() {
            return;
        }

        let session = self.session.read().await;
        let Some(session) = session.as_ref() else {
            debug!("Fix received outside a session — ignoring");
            return;
        };

        {
            let mut last_fix = self.last_fix.write().unwrap_or_else(PoisonError::into_inner);
            *last_fix = Some(fix.clone());
        }
        self.counters.fixes_accepted.fetch_add(1, Ordering::Relaxed);

        let active: Vec<CourseEntry> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|e| e.status == CourseStatus::Active)
            .collect();
        if active.is_empty() {
            return;
        }

        let now = chrono::Local::now().naive_local();
        let battery = self.device.battery_pct();
        let signal = self.device.signal_bucket();

        for course in active {
            let payload = build_payload(&course, &fix, battery, signal, now);
            let job = DispatchJob {
                payload,
                course_key: course.key.clone(),
                auth_token: course.auth_token.clone(),
            };
            self.counters.payloads_submitted.fetch_add(1, Ordering::Relaxed);

            if let Err(job) = session.dispatcher.submit(job) {
                // Reject-on-full becomes durability, not data loss.
                self.counters
                    .submissions_rejected
                    .fetch_add(1, Ordering::Relaxed);
                let now_secs = chrono::Utc::now().timestamp() as u64;
                self.offline.enqueue(QueuedItem::new(
                    job.payload,
                    job.course_key,
                    &job.auth_token,
                    now_secs,
                ));
            }
        }
    }

    /// Drive an injected location source until EOF or cancellation.
    ///
    /// Returns the number of fixes consumed.
    pub async fn run_ingest<S: LocationSource>(
        &self,
        source: &mut S,
        cancel: CancellationToken,
    ) -> u64 {
        info!(source = source.source_name(), "Ingest loop started");
        let mut fixes = 0u64;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Ingest loop cancelled");
                    break;
                }
                result = source.next_fix() => match result {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(error = %e, "Location source error");
                        break;
                    }
                }
            };

            match event {
                FixEvent::Fix(fix) => {
                    fixes += 1;
                    self.on_fix(fix).await;
                }
                FixEvent::Eof => {
                    info!(fixes, "Location source reached end");
                    break;
                }
            }
        }

        fixes
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    /// Subscribe to the advisory event channel.
    pub fn subscribe(&self) -> broadcast::Receiver<TrackingEvent> {
        self.events.subscribe()
    }

    /// Snapshot current statistics.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            fixes_accepted: self.counters.fixes_accepted.load(Ordering::Relaxed),
            payloads_submitted: self.counters.payloads_submitted.load(Ordering::Relaxed),
            submissions_rejected: self.counters.submissions_rejected.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            delivery_failures: self.counters.delivery_failures.load(Ordering::Relaxed),
            queue_depth: self.offline.depth(),
            active_courses: self.registry.active_count(),
        }
    }

    /// Number of courses currently ACTIVE. The ingestion driver may suspend
    /// location consumption while this is zero.
    pub fn active_count(&self) -> usize {
        self.registry.active_count()
    }

    /// Current offline queue depth.
    pub fn queue_depth(&self) -> usize {
        self.offline.depth()
    }

    /// Whether teardown has been requested.
    pub fn is_halted(&self) -> bool {
        self.guard.halted()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn spawn_session(&self) -> Session {
        self.guard.reset();
        self.wake.acquire();

        let cancel = CancellationToken::new();
        let request_timeout = Duration::from_secs(self.config.collector.request_timeout_secs);
        let retry_timeout = Duration::from_secs(self.config.collector.retry_timeout_secs);

        let dispatcher = Dispatcher::spawn(
            self.collector.clone(),
            self.offline.clone(),
            self.guard.clone(),
            self.events.clone(),
            self.counters.clone(),
            &self.config.dispatcher,
            request_timeout,
            cancel.clone(),
        );

        let sweeper = tokio::spawn(run_sweeper(
            self.offline.clone(),
            self.registry.clone(),
            self.collector.clone(),
            self.guard.clone(),
            self.config.offline.clone(),
            retry_timeout,
            self.events.clone(),
            cancel.clone(),
        ));

        Session {
            dispatcher,
            sweeper,
            cancel,
        }
    }

    /// Synchronous status transmission for pause/stop transitions.
    ///
    /// Reports from the last known fix (a zeroed position when none has been
    /// seen yet — identity and status still reach the collector). Failure
    /// falls back to the offline queue like any other transient failure.
    async fn transmit_status_sample(&self, entry: &CourseEntry) {
        let fix = self
            .last_fix
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();

        let payload = build_payload(
            entry,
            &fix,
            self.device.battery_pct(),
            self.device.signal_bucket(),
            chrono::Local::now().naive_local(),
        );
        let request_timeout = Duration::from_secs(self.config.collector.request_timeout_secs);

        match self
            .collector
            .deliver(&payload, &entry.auth_token, request_timeout)
            .await
        {
            Ok(()) => {
                self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                info!(key = %entry.key, status = %entry.status, "Status sample delivered");
            }
            Err(e) if e.is_permanent() => {
                self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %entry.key, error = %e, "Permanent failure on status sample — dropping");
            }
            Err(e) => {
                self.counters.delivery_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %entry.key, error = %e, "Status sample failed — queueing");
                let now_secs = chrono::Utc::now().timestamp() as u64;
                self.offline.enqueue(QueuedItem::new(
                    payload,
                    entry.key.clone(),
                    &entry.auth_token,
                    now_secs,
                ));
            }
        }
    }
}

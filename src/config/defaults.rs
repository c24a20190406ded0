//! System-wide default constants.
//!
//! Centralises the engine's magic numbers. Grouped by subsystem for easy
//! discovery; every value here is also operator-tunable via `agent_config.toml`.

// ============================================================================
// Dispatcher
// ============================================================================

/// Fixed number of delivery workers in the bounded pool.
pub const DISPATCH_WORKERS: usize = 3;

/// Bounded submission queue capacity. A full queue rejects the submission
/// (the caller diverts it to the offline queue); it never blocks ingestion.
pub const DISPATCH_QUEUE_CAPACITY: usize = 1000;

// ============================================================================
// Collector HTTP
// ============================================================================

/// TCP connect timeout for collector requests (seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 15;

/// Whole-request timeout for periodic sends (seconds).
pub const REQUEST_TIMEOUT_SECS: u64 = 15;

/// Whole-request timeout for retry-sweep sends (seconds).
///
/// Shorter than the periodic timeout so a dead network cannot stretch one
/// sweep cycle past its period.
pub const RETRY_REQUEST_TIMEOUT_SECS: u64 = 10;

// ============================================================================
// Offline Queue & Retry Sweep
// ============================================================================

/// Maximum undelivered items held in memory. Overflow evicts the oldest item
/// (recent telemetry is worth more than stale telemetry).
pub const OFFLINE_QUEUE_CAPACITY: usize = 1000;

/// Retry sweep period (seconds).
pub const SWEEP_INTERVAL_SECS: u64 = 30;

/// Random jitter added to the sweep period (seconds). Zero by default; set it
/// to de-synchronise fleets of devices sharing one collector.
pub const SWEEP_JITTER_SECS: u64 = 0;

/// Maximum items drained per sweep cycle.
pub const SWEEP_BATCH_SIZE: usize = 10;

/// Exponential backoff base (seconds): `min(BASE * 2^retry_count, CAP)`.
pub const RETRY_BACKOFF_BASE_SECS: u64 = 30;

/// Exponential backoff cap (seconds). 300 = 5 minutes.
pub const RETRY_BACKOFF_CAP_SECS: u64 = 300;

/// Queue item time-to-live (seconds). 86 400 = 24 hours; older positions
/// have no value to the collector and are discarded unsent.
pub const QUEUE_ITEM_TTL_SECS: u64 = 86_400;

/// Maximum failed retries before an item is abandoned.
pub const MAX_RETRY_COUNT: u32 = 10;

// ============================================================================
// Notification Channel
// ============================================================================

/// Broadcast channel capacity for advisory tracking events. Slow or absent
/// subscribers lose events; the channel never applies backpressure.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Wire Payload
// ============================================================================

/// Highest GSM signal quality bucket (`gsm_signal` is clamped to 0..=4).
pub const GSM_SIGNAL_MAX: u8 = 4;

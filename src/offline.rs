//! Offline Queue — bounded, time-ordered buffer of undelivered payloads.
//!
//! Multi-producer (dispatcher workers, synchronous status sends, sweeper
//! re-enqueues) / single-consumer-at-a-time (sweeper drain). Overflow evicts
//! the oldest item: recent telemetry is worth more than stale telemetry.

use crate::guard::LifecycleGuard;
use crate::types::{QueuedItem, TrackingEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Bounded FIFO-ish buffer with retry bookkeeping.
///
/// Size never exceeds `capacity`, enforced post-insert even under concurrent
/// producers: a full queue drops its oldest item before accepting a new one.
pub struct OfflineQueue {
    items: Mutex<VecDeque<QueuedItem>>,
    capacity: usize,
    guard: Arc<LifecycleGuard>,
    events: broadcast::Sender<TrackingEvent>,
}

impl OfflineQueue {
    pub fn new(
        capacity: usize,
        guard: Arc<LifecycleGuard>,
        events: broadcast::Sender<TrackingEvent>,
    ) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            guard,
            events,
        }
    }

    /// Enqueue an undelivered item, evicting the oldest one on overflow.
    ///
    /// Returns whether the item was accepted; a raised halt flag makes this
    /// a silent no-op.
    pub fn enqueue(&self, item: QueuedItem) -> bool {
        if self.guard.halted() {
            return false;
        }

        let depth = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            if items.len() >= self.capacity {
                if let Some(evicted) = items.pop_front() {
                    warn!(
                        capacity = self.capacity,
                        evicted_retry_count = evicted.retry_count,
                        "Offline queue full — dropping oldest item"
                    );
                }
            }
            items.push_back(item);
            items.len()
        };

        debug!(depth, "Item queued for retry");
        let _ = self.events.send(TrackingEvent::QueueDepth { depth });
        true
    }

    /// Remove up to `max_n` items from the front for processing.
    ///
    /// This is not a peek: drained items are gone and must be explicitly
    /// re-enqueued by the caller if still eligible.
    pub fn drain_batch(&self, max_n: usize) -> Vec<QueuedItem> {
        let (batch, depth) = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            let take = max_n.min(items.len());
            let batch: Vec<QueuedItem> = items.drain(..take).collect();
            (batch, items.len())
        };

        if !batch.is_empty() {
            let _ = self.events.send(TrackingEvent::QueueDepth { depth });
        }
        batch
    }

    /// Current number of queued items.
    pub fn depth(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop everything. Used only during teardown.
    pub fn clear(&self) {
        let dropped = {
            let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
            let n = items.len();
            items.clear();
            n
        };
        if dropped > 0 {
            debug!(dropped, "Offline queue cleared");
        }
        let _ = self.events.send(TrackingEvent::QueueDepth { depth: 0 });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::EVENT_CHANNEL_CAPACITY;
    use crate::types::{CourseKey, TelemetryPayload};

    fn make_item(n: u64) -> QueuedItem {
        let payload = TelemetryPayload {
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
        };
        QueuedItem::new(
            payload,
            CourseKey::new("B100ABC", "C1", "dev", "tok"),
            "tok",
            1_700_000_000 + n,
        )
    }

    fn make_queue(capacity: usize) -> OfflineQueue {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        OfflineQueue::new(capacity, Arc::new(LifecycleGuard::new()), events)
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let queue = make_queue(1000);
        for n in 0..1005 {
            queue.enqueue(make_item(n));
        }
        assert_eq!(queue.depth(), 1000);

        // The 5 oldest original items were evicted
        let drained = queue.drain_batch(1000);
        assert_eq!(drained.len(), 1000);
        assert_eq!(drained[0].payload.trip_id, "T5");
        assert!(drained.iter().all(|i| {
            let n: u64 = i.payload.trip_id[1..].parse().unwrap();
            n >= 5
        }));
    }

    #[test]
    fn test_overflow_evicts_exactly_one_oldest() {
        let queue = make_queue(3);
        for n in 0..3 {
            queue.enqueue(make_item(n));
        }
        queue.enqueue(make_item(3));
        assert_eq!(queue.depth(), 3);

        let drained = queue.drain_batch(3);
        assert_eq!(drained[0].payload.trip_id, "T1");
        assert_eq!(drained[2].payload.trip_id, "T3");
    }

    #[test]
    fn test_drain_physically_removes() {
        let queue = make_queue(10);
        for n in 0..5 {
            queue.enqueue(make_item(n));
        }
        let batch = queue.drain_batch(3);
        assert_eq!(batch.len(), 3);
        assert_eq!(queue.depth(), 2);

        // Partial drain preserves FIFO order of the remainder
        let rest = queue.drain_batch(10);
        assert_eq!(rest[0].payload.trip_id, "T3");
        assert_eq!(rest[1].payload.trip_id, "T4");
    }

    #[test]
    fn test_drain_more_than_available() {
        let queue = make_queue(10);
        queue.enqueue(make_item(0));
        assert_eq!(queue.drain_batch(10).len(), 1);
        assert!(queue.drain_batch(10).is_empty());
    }

    #[test]
    fn test_halted_guard_rejects_enqueue() {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let guard = Arc::new(LifecycleGuard::new());
        let queue = OfflineQueue::new(10, guard.clone(), events);

        guard.halt();
        assert!(!queue.enqueue(make_item(0)));
        assert_eq!(queue.depth(), 0);
    }

    #[test]
    fn test_depth_events_emitted() {
        let (events, mut rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let queue = OfflineQueue::new(10, Arc::new(LifecycleGuard::new()), events);

        queue.enqueue(make_item(0));
        match rx.try_recv() {
            Ok(TrackingEvent::QueueDepth { depth }) => assert_eq!(depth, 1),
            other => panic!("expected QueueDepth event, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_empties_queue() {
        let queue = make_queue(10);
        for n in 0..5 {
            queue.enqueue(make_item(n));
        }
        queue.clear();
        assert_eq!(queue.depth(), 0);
    }
}

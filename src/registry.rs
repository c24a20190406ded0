//! Course Registry — the set of active course entries and their status.
//!
//! Pure in-memory state and transitions. Supports concurrent read (snapshot
//! iteration for fan-out) against single-writer-at-a-time mutation; no
//! ordering across entries is guaranteed or required.

use crate::types::{CourseEntry, CourseKey, CourseStatus};
use dashmap::DashMap;
use tracing::{debug, warn};

/// Concurrent map of tracked courses, keyed by composite identity.
#[derive(Debug, Default)]
pub struct CourseRegistry {
    entries: DashMap<CourseKey, CourseEntry>,
}

impl CourseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry (last-writer-wins). Never errors; used both
    /// for "start tracking" and for idempotent re-starts.
    pub fn upsert(&self, entry: CourseEntry) {
        debug!(key = %entry.key, status = %entry.status, "Course upserted");
        self.entries.insert(entry.key.clone(), entry);
    }

    /// Transition an entry's status. Unknown keys are a logged no-op;
    /// returns whether the key was known.
    pub fn set_status(&self, key: &CourseKey, new_status: CourseStatus) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                debug!(key = %key, from = %entry.status, to = %new_status, "Course status changed");
                entry.status = new_status;
                true
            }
            None => {
                warn!(key = %key, "Status change for unknown course — ignoring");
                false
            }
        }
    }

    /// Remove one entry, returning it if present.
    pub fn remove(&self, key: &CourseKey) -> Option<CourseEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Look up an entry by key.
    pub fn get(&self, key: &CourseKey) -> Option<CourseEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    /// Look up an entry by the caller-supplied course handle.
    ///
    /// The control surface addresses courses by `course_id`; with multiple
    /// matches (same course under different credentials) the first one found
    /// wins — iteration order is irrelevant by contract.
    pub fn find_by_course_id(&self, course_id: &str) -> Option<CourseEntry> {
        self.entries
            .iter()
            .find(|e| e.course_id == course_id)
            .map(|e| e.clone())
    }

    /// Whether the course behind `key` is currently ACTIVE.
    ///
    /// Used by the retry sweeper: queued items for courses that have moved on
    /// are discarded as moot rather than retried.
    pub fn is_active(&self, key: &CourseKey) -> bool {
        self.entries
            .get(key)
            .map(|e| e.status == CourseStatus::Active)
            .unwrap_or(false)
    }

    /// Number of entries with `status == Active`.
    ///
    /// Exposed as a capability to the ingestion driver: zero active courses
    /// means periodic location consumption may be suspended to save power.
    /// The registry itself is agnostic to that policy.
    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.status == CourseStatus::Active)
            .count()
    }

    /// Snapshot of all entries, for fan-out. Order is unspecified.
    pub fn snapshot(&self) -> Vec<CourseEntry> {
        self.entries.iter().map(|e| e.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

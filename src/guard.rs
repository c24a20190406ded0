//! Lifecycle Guard — process-wide halt flag fencing all side effects.
//!
//! Teardown and ingestion run on different execution contexts. A location
//! callback or a network response arriving mid-teardown must not resurrect
//! state that is being torn down, so every side-effecting path checks this
//! flag first and short-circuits when it is raised.

use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative-cancellation checkpoint shared by all engine components.
///
/// Raised exactly once at the start of a teardown sequence, before any other
/// teardown step executes. Reset only when a fresh tracking session starts.
#[derive(Debug, Default)]
pub struct LifecycleGuard {
    halt_requested: AtomicBool,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the halt flag. Idempotent.
    pub fn halt(&self) {
        self.halt_requested.store(true, Ordering::Release);
    }

    /// Clear the halt flag at the start of a fresh tracking session.
    pub fn reset(&self) {
        self.halt_requested.store(false, Ordering::Release);
    }

    /// Whether teardown has been requested. Side-effecting operations call
    /// this first and exit cleanly when it returns true — this is a designed
    /// checkpoint, not an error.
    pub fn halted(&self) -> bool {
        self.halt_requested.load(Ordering::Acquire)
    }
}

// ============================================================================
// Wake Lease
// ============================================================================

/// Sleep-prevention capability owned by the host platform.
///
/// The engine acquires a lease when a tracking session starts and releases it
/// during `stop_all`, but how the lease actually keeps the device awake is
/// the host's concern. Tests inject a recorder.
pub trait WakeLease: Send + Sync {
    fn acquire(&self);
    fn release(&self);
}

/// Default lease for hosts without sleep management.
#[derive(Debug, Default)]
pub struct NoopWakeLease;

impl WakeLease for NoopWakeLease {
    fn acquire(&self) {}
    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halt_and_reset() {
        let guard = LifecycleGuard::new();
        assert!(!guard.halted());

        guard.halt();
        assert!(guard.halted());
        guard.halt(); // idempotent
        assert!(guard.halted());

        guard.reset();
        assert!(!guard.halted());
    }
}

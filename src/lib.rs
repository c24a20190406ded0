//! uit-agent: Background vehicle-tracking telemetry agent
//!
//! Streams per-course GPS telemetry to a fleet collector endpoint.
//!
//! ## Architecture
//!
//! - **Engine**: Control surface wiring registry, dispatcher, and sweeper
//! - **Registry**: Concurrent map of tracked courses, keyed by credential hash
//! - **Dispatcher**: Bounded worker pool posting samples, reject-on-full
//! - **Offline Queue**: Bounded in-memory retry buffer, drop-oldest
//! - **Sweeper**: Periodic retry pass with exponential backoff and TTL eviction

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod guard;
pub mod offline;
pub mod registry;
pub mod sample;
pub mod source;
pub mod sweeper;
pub mod transport;
pub mod types;

// Re-export agent configuration
pub use config::AgentConfig;

// Re-export commonly used types
pub use types::{
    CourseEntry, CourseKey, CourseStatus, LocationFix, QueuedItem, TelemetryPayload,
    TrackingEvent,
};

// Re-export the engine surface
pub use engine::{EngineStats, TelemetryEngine};

// Re-export transport seam
pub use transport::{Collector, DeliveryError, HttpCollector};

// Re-export injection seams
pub use guard::{LifecycleGuard, NoopWakeLease, WakeLease};
pub use source::{
    DeviceTelemetry, FixEvent, LocationSource, NdjsonFixSource, ReplayFixSource, StdinFixSource,
};

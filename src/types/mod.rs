//! Core data model for course tracking and telemetry transmission.
//!
//! Everything that crosses a component boundary lives here: course identity
//! and status, the raw location fix, the wire-ready telemetry payload, the
//! offline queue item, and the advisory tracking events.

use serde::{Deserialize, Serialize};

// ============================================================================
// Course Identity & Status
// ============================================================================

/// Course lifecycle status, caller-driven.
///
/// Wire codes match the collector contract: Active = 2, Paused = 3,
/// Stopped = 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CourseStatus {
    Active,
    Paused,
    Stopped,
}

impl CourseStatus {
    /// Numeric status code expected by the collector.
    pub fn wire_code(self) -> u8 {
        match self {
            Self::Active => 2,
            Self::Paused => 3,
            Self::Stopped => 4,
        }
    }

    /// Parse a collector status code. Returns `None` for unknown codes.
    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            2 => Some(Self::Active),
            3 => Some(Self::Paused),
            4 => Some(Self::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for CourseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Composite course identity: vehicle + course + device + credential hash.
///
/// The credential enters the key only as an md5 digest so tokens never leak
/// into logs or map keys. Two users tracking the same vehicle/course from the
/// same device with different tokens get distinct entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CourseKey(String);

impl CourseKey {
    /// Build the composite key from its four identity parts.
    pub fn new(vehicle_id: &str, course_id: &str, device_id: &str, auth_token: &str) -> Self {
        let digest = md5::compute(auth_token.as_bytes());
        Self(format!("{vehicle_id}|{course_id}|{device_id}|{digest:x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CourseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tracked course (trip assignment) on this device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseEntry {
    /// Composite identity (unique within the registry)
    pub key: CourseKey,
    /// Caller-supplied trip handle
    pub course_id: String,
    /// Identifier the collector expects (falls back to `course_id`)
    pub server_trip_id: String,
    /// Vehicle plate / registration number
    pub vehicle_id: String,
    /// Bearer token used for this course's transmissions
    pub auth_token: String,
    /// Current status, caller-driven
    pub status: CourseStatus,
}

impl CourseEntry {
    /// Create an entry, resolving the server-facing trip identifier.
    ///
    /// A missing or blank `server_trip_id` falls back to `course_id`.
    pub fn new(
        vehicle_id: &str,
        course_id: &str,
        server_trip_id: Option<&str>,
        device_id: &str,
        auth_token: &str,
        status: CourseStatus,
    ) -> Self {
        let trip = match server_trip_id {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => course_id.to_string(),
        };
        Self {
            key: CourseKey::new(vehicle_id, course_id, device_id, auth_token),
            course_id: course_id.to_string(),
            server_trip_id: trip,
            vehicle_id: vehicle_id.to_string(),
            auth_token: auth_token.to_string(),
            status,
        }
    }
}

// ============================================================================
// Location Fix
// ============================================================================

/// One location sample from the external location source.
///
/// The engine treats a fix as an immutable snapshot per callback invocation;
/// it never requests fixes and does not own their lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub lat: f64,
    pub lng: f64,
    /// Ground speed in m/s (converted to km/h on the wire)
    #[serde(default)]
    pub speed_mps: f64,
    /// Heading in degrees
    #[serde(default)]
    pub bearing_deg: f64,
    /// Altitude above sea level in meters
    #[serde(default)]
    pub altitude_m: f64,
    /// Horizontal accuracy in meters
    #[serde(default)]
    pub accuracy_m: f64,
    /// Age of the fix when delivered, in milliseconds
    #[serde(default)]
    pub fix_age_ms: u64,
    /// Provider quality hint (e.g. "gps", "fused"), informational only
    #[serde(default)]
    pub provider: Option<String>,
}

// ============================================================================
// Wire Payload
// ============================================================================

/// Immutable wire-ready telemetry record.
///
/// Field names are fixed by the collector's contract — do not rename.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    /// Server-facing trip identifier
    #[serde(rename = "uit")]
    pub trip_id: String,
    /// Vehicle registration number
    #[serde(rename = "numar_inmatriculare")]
    pub vehicle_id: String,
    pub lat: f64,
    pub lng: f64,
    /// Speed in km/h, rounded to integer
    #[serde(rename = "viteza")]
    pub speed_kmh: i64,
    /// Heading in degrees, normalised into 0..=359
    #[serde(rename = "directie")]
    pub bearing_deg: i64,
    /// Altitude in meters, rounded to integer
    #[serde(rename = "altitudine")]
    pub altitude_m: i64,
    /// Horizontal accuracy in meters, rounded to integer
    #[serde(rename = "hdop")]
    pub accuracy_m: i64,
    /// Signal quality bucket, 0..=4
    pub gsm_signal: u8,
    /// Battery percentage with a literal `%` suffix, e.g. `"87%"`
    #[serde(rename = "baterie")]
    pub battery: String,
    /// Course status wire code (2 active, 3 paused, 4 stopped)
    pub status: u8,
    /// Local calendar timestamp, `yyyy-MM-dd HH:mm:ss`
    pub timestamp: String,
}

// ============================================================================
// Offline Queue Item
// ============================================================================

/// An undelivered payload with retry bookkeeping.
///
/// Append-only: a failed retry produces a *replacement* item via
/// [`retried`](QueuedItem::retried) rather than mutating in place, keeping
/// queue iteration safe under concurrent drain.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedItem {
    pub payload: TelemetryPayload,
    /// Course this payload belongs to (for the moot-course check on retry)
    pub course_key: CourseKey,
    /// Bearer token to retry with
    pub auth_token: String,
    /// Unix seconds of the *original* delivery failure
    pub enqueued_at: u64,
    /// Number of failed retry attempts so far
    pub retry_count: u32,
}

impl QueuedItem {
    /// Wrap a payload that just failed delivery.
    pub fn new(
        payload: TelemetryPayload,
        course_key: CourseKey,
        auth_token: &str,
        enqueued_at: u64,
    ) -> Self {
        Self {
            payload,
            course_key,
            auth_token: auth_token.to_string(),
            enqueued_at,
            retry_count: 0,
        }
    }

    /// Replacement item after a failed retry.
    ///
    /// `enqueued_at` is deliberately unchanged: age is measured from the
    /// original failure, not from the last retry.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }
}

// ============================================================================
// Tracking Events (advisory notification channel)
// ============================================================================

/// Advisory notifications emitted to the external analytics/log collaborator.
///
/// These are drop-safe: no delivery guarantee, no receiver required.
#[derive(Debug, Clone)]
pub enum TrackingEvent {
    /// A position sample was successfully delivered for an active course.
    PositionSent {
        course_key: CourseKey,
        trip_id: String,
        lat: f64,
        lng: f64,
        speed_kmh: i64,
        accuracy_m: i64,
        is_active: bool,
    },
    /// The offline queue depth changed.
    QueueDepth { depth: usize },
    /// A retry sweep cycle completed.
    SweepComplete {
        succeeded: usize,
        attempted: usize,
        remaining: usize,
    },
    /// A course was removed from the registry after its terminal transmission.
    CourseRemoved { course_key: CourseKey },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_codes() {
        assert_eq!(CourseStatus::Active.wire_code(), 2);
        assert_eq!(CourseStatus::Paused.wire_code(), 3);
        assert_eq!(CourseStatus::Stopped.wire_code(), 4);
        assert_eq!(CourseStatus::from_wire_code(3), Some(CourseStatus::Paused));
        assert_eq!(CourseStatus::from_wire_code(7), None);
    }

    #[test]
    fn test_course_key_hides_credential() {
        let key = CourseKey::new("B100ABC", "C1", "dev-1", "secret-token");
        assert!(!key.as_str().contains("secret-token"));
        assert!(key.as_str().starts_with("B100ABC|C1|dev-1|"));
    }

    #[test]
    fn test_course_key_distinct_per_credential() {
        let a = CourseKey::new("B100ABC", "C1", "dev-1", "token-a");
        let b = CourseKey::new("B100ABC", "C1", "dev-1", "token-b");
        assert_ne!(a, b);
    }

    #[test]
    fn test_server_trip_id_fallback() {
        let blank = CourseEntry::new("B100ABC", "C1", Some("  "), "dev", "tok", CourseStatus::Active);
        assert_eq!(blank.server_trip_id, "C1");

        let missing = CourseEntry::new("B100ABC", "C1", None, "dev", "tok", CourseStatus::Active);
        assert_eq!(missing.server_trip_id, "C1");

        let explicit = CourseEntry::new("B100ABC", "C1", Some("T1"), "dev", "tok", CourseStatus::Active);
        assert_eq!(explicit.server_trip_id, "T1");
    }

    #[test]
    fn test_retried_keeps_original_enqueue_time() {
        let payload = TelemetryPayload {
            trip_id: "T1".to_string(),
            vehicle_id: "B100ABC".to_string(),
            lat: 44.0,
            lng: 26.0,
            speed_kmh: 36,
            bearing_deg: 90,
            altitude_m: 85,
            accuracy_m: 5,
            gsm_signal: 4,
            battery: "90%".to_string(),
            status: 2,
            timestamp: "2026-01-15 10:30:00".to_string(),
        };
        let item = QueuedItem::new(
            payload,
            CourseKey::new("B100ABC", "C1", "dev", "tok"),
            "tok",
            1_700_000_000,
        );
        let replacement = item.retried();
        assert_eq!(replacement.retry_count, 1);
        assert_eq!(replacement.enqueued_at, 1_700_000_000);
        assert_eq!(replacement.payload, item.payload);
    }

    #[test]
    fn test_payload_wire_field_names() {
        let payload = TelemetryPayload {
            trip_id: "T1".to_string(),
            vehicle_id: "B100ABC".to_string(),
            lat: 44.0,
            lng: 26.0,
            speed_kmh: 36,
            bearing_deg: 180,
            altitude_m: 85,
            accuracy_m: 5,
            gsm_signal: 3,
            battery: "87%".to_string(),
            status: 2,
            timestamp: "2026-01-15 10:30:00".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["uit"], "T1");
        assert_eq!(json["numar_inmatriculare"], "B100ABC");
        assert_eq!(json["viteza"], 36);
        assert_eq!(json["directie"], 180);
        assert_eq!(json["altitudine"], 85);
        assert_eq!(json["hdop"], 5);
        assert_eq!(json["gsm_signal"], 3);
        assert_eq!(json["baterie"], "87%");
        assert_eq!(json["status"], 2);
        assert_eq!(json["timestamp"], "2026-01-15 10:30:00");
    }
}

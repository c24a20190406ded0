//! Sample Builder — turns a (course, fix, device-telemetry) tuple into an
//! immutable wire payload.
//!
//! Pure and deterministic: given fixed inputs the output is byte-identical,
//! always. This is the unit-test anchor for the whole wire contract.
//!
//! Numeric policy:
//! - speed: fix speed (m/s) × 3.6, rounded to integer km/h, floored at 0
//! - bearing: rounded, normalised into 0..=359
//! - altitude / accuracy: rounded to integer meters
//! - battery: 0–100 integer percentage, rendered `"<n>%"`
//! - gsm signal: clamped to 0..=4
//! - timestamp: local calendar `yyyy-MM-dd HH:mm:ss` (the collector expects
//!   the reporting time zone, not UTC)

use crate::config::defaults::GSM_SIGNAL_MAX;
use crate::types::{CourseEntry, LocationFix, TelemetryPayload};
use chrono::NaiveDateTime;

/// Timestamp layout fixed by the collector contract.
const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Build one wire payload for one (course, fix) pair.
///
/// `now` is the already-localised reporting time; the caller owns the clock
/// so the builder stays side-effect free.
pub fn build_payload(
    course: &CourseEntry,
    fix: &LocationFix,
    battery_pct: u8,
    signal_bucket: u8,
    now: NaiveDateTime,
) -> TelemetryPayload {
    let speed_kmh = (fix.speed_mps * 3.6).round().max(0.0) as i64;
    let bearing_deg = (fix.bearing_deg.round() as i64).rem_euclid(360);

    TelemetryPayload {
        trip_id: course.server_trip_id.clone(),
        vehicle_id: course.vehicle_id.clone(),
        lat: fix.lat,
        lng: fix.lng,
        speed_kmh,
        bearing_deg,
        altitude_m: fix.altitude_m.round() as i64,
        accuracy_m: fix.accuracy_m.round().max(0.0) as i64,
        gsm_signal: signal_bucket.min(GSM_SIGNAL_MAX),
        battery: format!("{}%", battery_pct.min(100)),
        status: course.status.wire_code(),
        timestamp: now.format(WIRE_TIMESTAMP_FORMAT).to_string(),
    }
}

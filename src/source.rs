//! Location source and device probe abstractions.
//!
//! The engine never requests fixes; it consumes whatever the injected source
//! pushes. Implementations handle parsing, pacing, and reconnection
//! internally. The ingest loop calls [`next_fix`] in a select! with
//! cancellation.
//!
//! [`next_fix`]: LocationSource::next_fix

use crate::types::LocationFix;
use anyhow::Result;
use async_trait::async_trait;

/// Events produced by a location source.
pub enum FixEvent {
    /// A valid location fix was produced.
    Fix(LocationFix),
    /// Source reached end of data (EOF for stdin/replay, permanent loss of
    /// the provider for live sources).
    Eof,
}

/// Trait abstracting where location fixes come from.
#[async_trait]
pub trait LocationSource: Send + 'static {
    /// Read the next fix from the source.
    ///
    /// Returns `FixEvent::Eof` when no more data is available and `Err` on
    /// unrecoverable source errors.
    async fn next_fix(&mut self) -> Result<FixEvent>;

    /// Human-readable name for logging (e.g. "stdin", "replay").
    fn source_name(&self) -> &str;
}

// ============================================================================
// NDJSON Source (JSON fixes, one per line; stdin in production)
// ============================================================================

/// Reads JSON-formatted location fixes, one per line, from any async reader.
///
/// Malformed lines are logged and skipped; the stream stays alive until the
/// reader signals EOF. Used with a simulator or a platform bridge piping
/// NDJSON: `gps_simulator | uit-agent --vehicle B100ABC ...`
pub struct NdjsonFixSource<R> {
    reader: tokio::io::BufReader<R>,
    line_buffer: String,
    name: &'static str,
}

impl<R: tokio::io::AsyncRead + Send + Unpin + 'static> NdjsonFixSource<R> {
    pub fn from_reader(reader: R, name: &'static str) -> Self {
        Self {
            reader: tokio::io::BufReader::new(reader),
            line_buffer: String::with_capacity(512),
            name,
        }
    }
}

/// NDJSON fixes from stdin.
pub type StdinFixSource = NdjsonFixSource<tokio::io::Stdin>;

impl StdinFixSource {
    pub fn new() -> Self {
        Self::from_reader(tokio::io::stdin(), "stdin")
    }
}

impl Default for StdinFixSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: tokio::io::AsyncRead + Send + Unpin + 'static> LocationSource for NdjsonFixSource<R> {
    async fn next_fix(&mut self) -> Result<FixEvent> {
        use tokio::io::AsyncBufReadExt;
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(FixEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LocationFix>(line) {
                Ok(fix) => return Ok(FixEvent::Fix(fix)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse fix — skipping line");
                    // Skip malformed lines and keep reading
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        self.name
    }
}

// ============================================================================
// Replay Source (pre-loaded fixes with optional pacing)
// ============================================================================

/// Replays pre-loaded fixes with an optional inter-fix delay.
///
/// Tests and bench runs use this as a synthetic location source.
pub struct ReplayFixSource {
    fixes: std::vec::IntoIter<LocationFix>,
    delay_ms: u64,
    yielded_first: bool,
}

impl ReplayFixSource {
    pub fn new(fixes: Vec<LocationFix>, delay_ms: u64) -> Self {
        Self {
            fixes: fixes.into_iter(),
            delay_ms,
            yielded_first: false,
        }
    }
}

#[async_trait]
impl LocationSource for ReplayFixSource {
    async fn next_fix(&mut self) -> Result<FixEvent> {
        if self.yielded_first && self.delay_ms > 0 {
            tokio::time::sleep(tokio::time::Duration::from_millis(self.delay_ms)).await;
        }
        match self.fixes.next() {
            Some(fix) => {
                self.yielded_first = true;
                Ok(FixEvent::Fix(fix))
            }
            None => Ok(FixEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "replay"
    }
}

// ============================================================================
// Device Telemetry Probe
// ============================================================================

/// Host-owned battery and signal readings sampled at payload-build time.
///
/// The host platform owns those sensors, so — like the location source —
/// the probe is an injected capability. Readings are cheap synchronous
/// getters; anything slow belongs in the host's implementation, cached.
pub trait DeviceTelemetry: Send + Sync {
    /// Battery level, 0..=100.
    fn battery_pct(&self) -> u8;
    /// Signal quality bucket, 0..=4.
    fn signal_bucket(&self) -> u8;
}

/// Fixed readings for hosts without battery/signal sensors, and for tests.
#[derive(Debug, Clone, Copy)]
pub struct StaticDeviceTelemetry {
    pub battery_pct: u8,
    pub signal_bucket: u8,
}

impl Default for StaticDeviceTelemetry {
    fn default() -> Self {
        Self {
            battery_pct: 100,
            signal_bucket: 4,
        }
    }
}

impl DeviceTelemetry for StaticDeviceTelemetry {
    fn battery_pct(&self) -> u8 {
        self.battery_pct
    }

    fn signal_bucket(&self) -> u8 {
        self.signal_bucket
    }
}

//! uit-agent - Vehicle tracking telemetry agent
//!
//! Reads GPS fixes as NDJSON from stdin and posts one telemetry sample per
//! tracked course to the collector endpoint.
//!
//! # Usage
//!
//! ```bash
//! # Stream fixes from a GPS bridge
//! gpspipe -w | jq -c '…' | uit-agent --collector https://collector.example \
//!     --vehicle B100ABC --course 12345 --token "$TOKEN"
//! ```
//!
//! # Environment Variables
//!
//! - `UIT_AGENT_CONFIG`: Path to the TOML config file (default: ./agent_config.toml)
//! - `UIT_AGENT_TOKEN`: Bearer token for the collector (alternative to --token)
//! - `RUST_LOG`: Logging level (default: info)

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use uit_agent::config::AgentConfig;
use uit_agent::source::StdinFixSource;
use uit_agent::transport::HttpCollector;
use uit_agent::types::CourseStatus;
use uit_agent::TelemetryEngine;

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "uit-agent")]
#[command(about = "Vehicle tracking telemetry agent")]
#[command(version)]
struct CliArgs {
    /// Collector base URL (e.g. https://collector.example); overrides config
    #[arg(long)]
    collector: Option<String>,

    /// Vehicle registration plate
    #[arg(long)]
    vehicle: String,

    /// Course identifier to track
    #[arg(long)]
    course: String,

    /// Server-assigned trip identifier (defaults to the course id)
    #[arg(long)]
    trip: Option<String>,

    /// Bearer token for the collector
    #[arg(long, env = "UIT_AGENT_TOKEN")]
    token: String,

    /// Device identifier reported in the course key; overrides config
    #[arg(long)]
    device_id: Option<String>,

    /// Path to the TOML config file
    #[arg(long, env = "UIT_AGENT_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load_from_file(std::path::Path::new(path))
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => AgentConfig::load(),
    };
    if let Some(collector) = &args.collector {
        config.collector.base_url = collector.clone();
    }
    if let Some(device_id) = &args.device_id {
        config.device.device_id = device_id.clone();
    }
    if config.collector.base_url.trim().is_empty() {
        anyhow::bail!("No collector URL configured (set --collector or collector.base_url)");
    }

    info!(
        collector = %config.collector.base_url,
        vehicle = %args.vehicle,
        course = %args.course,
        "uit-agent starting"
    );

    let collector = HttpCollector::new(
        &config.collector.base_url,
        Duration::from_secs(config.collector.connect_timeout_secs),
    )
    .context("Failed to build HTTP collector client")?;

    let engine = Arc::new(TelemetryEngine::new(config, Arc::new(collector)));
    engine
        .start(
            &args.vehicle,
            &args.course,
            args.trip.as_deref(),
            &args.token,
            CourseStatus::Active,
        )
        .await;

    // Ctrl+C turns into a clean teardown: final status sample, then halt.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Failed to listen for shutdown signal");
                return;
            }
            info!("Shutdown signal received");
            cancel.cancel();
        });
    }

    let mut source = StdinFixSource::new();
    let fixes = engine.run_ingest(&mut source, cancel).await;
    info!(fixes, "Ingest finished");

    engine.stop(&args.course).await;
    engine.stop_all().await;

    Ok(())
}

//! Agent Configuration Module
//!
//! Per-deployment configuration loaded from TOML, replacing hardcoded engine
//! tunables with operator-adjustable values.
//!
//! ## Loading Order
//!
//! 1. `UIT_AGENT_CONFIG` environment variable (path to TOML file)
//! 2. `agent_config.toml` in the current working directory
//! 3. Built-in defaults (matching the constants in [`defaults`])
//!
//! Unlike the registry or the queue, configuration is plain data: load it
//! once and hand it to [`TelemetryEngine::new`](crate::engine::TelemetryEngine::new).

pub mod defaults;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use defaults::{
    CONNECT_TIMEOUT_SECS, DISPATCH_QUEUE_CAPACITY, DISPATCH_WORKERS, MAX_RETRY_COUNT,
    OFFLINE_QUEUE_CAPACITY, QUEUE_ITEM_TTL_SECS, REQUEST_TIMEOUT_SECS,
    RETRY_BACKOFF_BASE_SECS, RETRY_BACKOFF_CAP_SECS, RETRY_REQUEST_TIMEOUT_SECS,
    SWEEP_BATCH_SIZE, SWEEP_INTERVAL_SECS, SWEEP_JITTER_SECS,
};

/// Configuration load errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TOML parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one agent deployment.
///
/// Load with [`AgentConfig::load`], which searches:
/// 1. `$UIT_AGENT_CONFIG` env var
/// 2. `./agent_config.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Device identity (enters the composite course key)
    #[serde(default)]
    pub device: DeviceConfig,

    /// Collector endpoint and HTTP timeouts
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Bounded delivery pool sizing
    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    /// Offline queue capacity and retry sweep policy
    #[serde(default)]
    pub offline: OfflineConfig,
}

impl AgentConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("UIT_AGENT_CONFIG") {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded agent config from UIT_AGENT_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from UIT_AGENT_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "UIT_AGENT_CONFIG points to non-existent file, falling back");
            }
        }

        let local = Path::new("agent_config.toml");
        if local.exists() {
            match Self::load_from_file(local) {
                Ok(config) => {
                    info!(path = %local.display(), "Loaded agent config");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./agent_config.toml, using defaults");
                }
            }
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Load configuration from a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

// ============================================================================
// Sections
// ============================================================================

/// Device identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Stable device identifier; part of every course key.
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
        }
    }
}

fn default_device_id() -> String {
    "device-0".to_string()
}

/// Collector endpoint and HTTP timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorConfig {
    /// Base URL of the remote collector (payloads POST to `<base>/gps.php`).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// TCP connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout for periodic sends (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Whole-request timeout for retry-sweep sends (seconds)
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            retry_timeout_secs: default_retry_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT_SECS
}

fn default_request_timeout() -> u64 {
    REQUEST_TIMEOUT_SECS
}

fn default_retry_timeout() -> u64 {
    RETRY_REQUEST_TIMEOUT_SECS
}

/// Bounded delivery pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Fixed worker count
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Submission queue capacity (reject-on-full, never wait-on-full)
    #[serde(default = "default_dispatch_capacity")]
    pub queue_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_dispatch_capacity(),
        }
    }
}

fn default_workers() -> usize {
    DISPATCH_WORKERS
}

fn default_dispatch_capacity() -> usize {
    DISPATCH_QUEUE_CAPACITY
}

/// Offline queue capacity and retry sweep policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Maximum undelivered items (overflow evicts the oldest)
    #[serde(default = "default_offline_capacity")]
    pub capacity: usize,

    /// Sweep period (seconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Random jitter added to each sweep sleep (seconds)
    #[serde(default = "default_sweep_jitter")]
    pub sweep_jitter_secs: u64,

    /// Maximum items drained per sweep cycle
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,

    /// Exponential backoff base (seconds)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Exponential backoff cap (seconds)
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Item time-to-live before unconditional discard (seconds)
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Maximum failed retries before abandonment
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            capacity: default_offline_capacity(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_jitter_secs: default_sweep_jitter(),
            sweep_batch: default_sweep_batch(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            ttl_secs: default_ttl(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_offline_capacity() -> usize {
    OFFLINE_QUEUE_CAPACITY
}

fn default_sweep_interval() -> u64 {
    SWEEP_INTERVAL_SECS
}

fn default_sweep_jitter() -> u64 {
    SWEEP_JITTER_SECS
}

fn default_sweep_batch() -> usize {
    SWEEP_BATCH_SIZE
}

fn default_backoff_base() -> u64 {
    RETRY_BACKOFF_BASE_SECS
}

fn default_backoff_cap() -> u64 {
    RETRY_BACKOFF_CAP_SECS
}

fn default_ttl() -> u64 {
    QUEUE_ITEM_TTL_SECS
}

fn default_max_retries() -> u32 {
    MAX_RETRY_COUNT
}

//! Collector transport — HTTP delivery of telemetry payloads.
//!
//! One payload, one `POST <collector>/gps.php` with bearer auth. Any status
//! in [200, 300) is success; everything else, including transport errors, is
//! a failure the caller converts into offline queueing. The trait seam exists
//! so tests can swap in a scripted collector.

use crate::types::TelemetryPayload;
use async_trait::async_trait;
use std::time::Duration;

/// Delivery errors.
///
/// Transient failures (timeouts, 5xx, connection resets) are recovered by the
/// offline queue; permanent validation failures are dropped, since retrying
/// cannot fix missing identity.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("collector returned status {0}")]
    Rejected(reqwest::StatusCode),
    #[error("missing auth token")]
    MissingToken,
}

impl DeliveryError {
    /// Whether retrying can never succeed.
    ///
    /// Client errors other than throttling and request timeouts mean the
    /// payload or credentials are bad; resending the same bytes cannot help.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::MissingToken => true,
            Self::Rejected(code) => {
                code.is_client_error()
                    && *code != reqwest::StatusCode::REQUEST_TIMEOUT
                    && *code != reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            Self::Http(_) => false,
        }
    }
}

/// Delivery seam between the engine and the remote collector.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Deliver one payload. Success means the collector accepted it;
    /// retry policy is entirely the caller's concern.
    async fn deliver(
        &self,
        payload: &TelemetryPayload,
        auth_token: &str,
        timeout: Duration,
    ) -> Result<(), DeliveryError>;
}

/// Production collector client over reqwest.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCollector {
    /// Build a client for the given collector base URL.
    ///
    /// Only the connect timeout is fixed at the client level; the
    /// whole-request timeout is per call, since periodic sends and retry
    /// sweeps use different deadlines.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, DeliveryError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Collector base URL, for logging.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn deliver(
        &self,
        payload: &TelemetryPayload,
        auth_token: &str,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if auth_token.trim().is_empty() {
            return Err(DeliveryError::MissingToken);
        }

        let resp = self
            .http
            .post(format!("{}/gps.php", self.base_url))
            .header("Authorization", format!("Bearer {auth_token}"))
            .header("Accept", "application/json")
            .timeout(timeout)
            .json(payload)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(resp.status()))
        }
    }
}

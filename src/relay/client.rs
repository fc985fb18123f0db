//! HTTP Client für das Relay
//!
//! Die Aktivierung ist idempotent und best-effort: der Session Controller
//! loggt Fehler nur und fährt mit der Verhandlung fort.

use super::messages::{ActivationResponse, ActivationStatus, HealthResponse};
use crate::session::Source;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Relay request failed: {0}")]
    Request(String),

    #[error("Relay answered with HTTP {0}")]
    HttpStatus(u16),

    #[error("Relay response could not be parsed: {0}")]
    InvalidResponse(String),

    #[error("Relay rejected activation: {0}")]
    Rejected(String),
}

// ============================================================================
// ACTIVATOR
// ============================================================================

/// Startet den Stream einer Quelle auf dem Relay
#[async_trait]
pub trait RelayActivator: Send + Sync {
    async fn activate(&self, source: Source) -> Result<ActivationResponse, RelayError>;
}

pub struct RelayClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl RelayClient {
    pub fn new(http: reqwest::Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<HealthResponse, RelayError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status().as_u16()));
        }

        response
            .json::<HealthResponse>()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RelayActivator for RelayClient {
    /// `POST /start_{source}`
    async fn activate(&self, source: Source) -> Result<ActivationResponse, RelayError> {
        let url = format!("{}/start_{}", self.base_url, source.name());
        tracing::debug!("Activating {} stream via {}", source, url);

        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(RelayError::HttpStatus(response.status().as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;
        let activation = parse_activation(&body)?;

        tracing::info!(
            "Relay activation for {}: {:?}{}",
            source,
            activation.status,
            activation
                .pid
                .map(|pid| format!(" (pid {})", pid))
                .unwrap_or_default()
        );
        Ok(activation)
    }
}

/// Parst die Antwort; `status: "error"` wird zu `RelayError::Rejected`
pub fn parse_activation(body: &str) -> Result<ActivationResponse, RelayError> {
    let activation: ActivationResponse =
        serde_json::from_str(body).map_err(|e| RelayError::InvalidResponse(e.to_string()))?;

    if activation.status == ActivationStatus::Error {
        return Err(RelayError::Rejected(
            activation
                .message
                .unwrap_or_else(|| "no message".to_string()),
        ));
    }
    Ok(activation)
}

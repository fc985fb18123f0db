//! Antworttypen des Relays
//!
//! Das Relay ist ein kleiner HTTP-Dienst neben dem Media-Server, der die
//! Encoder-Prozesse für Vinyl und CD startet.

use serde::{Deserialize, Serialize};

/// Ergebnis von `POST /start_{source}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationStatus {
    Started,
    AlreadyRunning,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationResponse {
    pub status: ActivationStatus,
    #[serde(default)]
    pub message: Option<String>,
    /// Prozess-ID des gestarteten Encoders (nur bei `started`)
    #[serde(default)]
    pub pid: Option<u32>,
}

impl ActivationResponse {
    /// Stream läuft (neu gestartet oder bereits aktiv)
    pub fn is_running(&self) -> bool {
        matches!(
            self.status,
            ActivationStatus::Started | ActivationStatus::AlreadyRunning
        )
    }
}

/// Ergebnis von `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// ISO-8601, ohne Zeitzone
    pub timestamp: String,
    #[serde(default)]
    pub psutil_available: bool,
}

impl HealthResponse {
    pub fn is_healthy(&self) -> bool {
        self.status == "healthy"
    }
}

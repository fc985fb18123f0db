//! Client-Konfiguration
//!
//! Wird aus `<config dir>/config.json` gelesen (falls vorhanden) und danach
//! von Umgebungsvariablen überschrieben. Zeiten stehen in der Datei als
//! Millisekunden.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Überschreibt `relay_url`
pub const ENV_RELAY_URL: &str = "SPINLINK_RELAY_URL";

/// Überschreibt `stream_url`
pub const ENV_STREAM_URL: &str = "SPINLINK_STREAM_URL";

/// Erzwingt den Null-Output (`1` / `true`)
pub const ENV_HEADLESS: &str = "SPINLINK_HEADLESS";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid URL for {field}: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },
}

// ============================================================================
// CLIENT CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay, das die Streams startet (`/start_vinyl`, `/start_cd`, `/health`)
    pub relay_url: String,
    /// Media-Server mit WHEP- und HLS-Endpunkten
    pub stream_url: String,
    /// STUN/TURN URLs
    pub ice_servers: Vec<String>,
    /// Wartezeit nach der Relay-Aktivierung
    pub relay_grace_ms: u64,
    /// Wartezeit für ICE-Gathering vor dem Senden des Offers
    pub ice_gather_ms: u64,
    pub track_timeout_ms: u64,
    pub first_frame_timeout_ms: u64,
    pub fallback_timeout_ms: u64,
    pub spectral_interval_ms: u64,
    pub http_timeout_ms: u64,
    /// Kein Audiogerät öffnen
    pub headless: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:5000".to_string(),
            stream_url: "http://localhost:8889".to_string(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            relay_grace_ms: 1000,
            ice_gather_ms: 500,
            track_timeout_ms: 10_000,
            first_frame_timeout_ms: 10_000,
            fallback_timeout_ms: 10_000,
            spectral_interval_ms: 2000,
            http_timeout_ms: 5000,
            headless: false,
        }
    }
}

impl ClientConfig {
    /// Lädt die Konfiguration aus dem Standardpfad und wendet die
    /// Umgebungsvariablen an
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// `<config dir>/config.json`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "spinlink", "spinlink")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Überschreibt Felder aus einer Variablenquelle
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RELAY_URL) {
            self.relay_url = url;
        }
        if let Some(url) = lookup(ENV_STREAM_URL) {
            self.stream_url = url;
        }
        if let Some(flag) = lookup(ENV_HEADLESS) {
            self.headless = matches!(flag.trim(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [("relay_url", &self.relay_url), ("stream_url", &self.stream_url)] {
            if url::Url::parse(value).is_err() {
                return Err(ConfigError::InvalidUrl {
                    field,
                    value: value.clone(),
                });
            }
        }

        // Wartezeiten dürfen 0 sein, Timeouts und die Abtastperiode nicht
        for (field, value) in [
            ("track_timeout_ms", self.track_timeout_ms),
            ("first_frame_timeout_ms", self.first_frame_timeout_ms),
            ("fallback_timeout_ms", self.fallback_timeout_ms),
            ("spectral_interval_ms", self.spectral_interval_ms),
            ("http_timeout_ms", self.http_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroDuration { field });
            }
        }
        Ok(())
    }

    pub fn relay_grace(&self) -> Duration {
        Duration::from_millis(self.relay_grace_ms)
    }

    pub fn ice_gather_wait(&self) -> Duration {
        Duration::from_millis(self.ice_gather_ms)
    }

    pub fn track_timeout(&self) -> Duration {
        Duration::from_millis(self.track_timeout_ms)
    }

    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }

    pub fn fallback_timeout(&self) -> Duration {
        Duration::from_millis(self.fallback_timeout_ms)
    }

    pub fn spectral_interval(&self) -> Duration {
        Duration::from_millis(self.spectral_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

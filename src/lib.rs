//! Spinlink - Live-Client für Plattenspieler- und CD-Streams
//!
//! Ein Hörer-Client für das Heimstudio mit:
//! - Relay-Aktivierung der gewählten Quelle (Vinyl oder CD)
//! - WHEP-Verhandlung mit dem Media-Server, sonst HLS- oder Direkt-Fallback
//! - Biquad-Kaskade gegen Brummen und Rumpeln vor dem Lautsprecher
//! - Spektrale Momentaufnahmen der laufenden Wiedergabe

pub mod audio;
pub mod config;
pub mod fallback;
pub mod negotiation;
pub mod relay;
pub mod session;

#[cfg(test)]
mod testing;

use audio::{AudioConditioningPipeline, AudioEngine, AudioOutput, SpectralSampler};
use config::{ClientConfig, ConfigError};
use fallback::{FallbackTransport, HttpFetcher};
use negotiation::{HttpSdpExchange, Negotiator, WebRtcPeerFactory};
use relay::RelayClient;
use session::SessionController;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Log-Filter, falls `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_FILTER: &str = "spinlink_lib=debug,spinlink=debug,webrtc=warn";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    Http(String),
}

// ============================================================================
// LOGGING
// ============================================================================

/// Initialisiert das Logging; ein zweiter Aufruf ist wirkungslos
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

/// Verdrahtet Relay, Verhandlung, Fallback und Audio aus einer Konfiguration
pub struct AppState {
    config: ClientConfig,
    engine: Arc<AudioEngine>,
    sampler: Arc<SpectralSampler>,
    relay: Arc<RelayClient>,
    controller: SessionController,
}

impl AppState {
    pub fn new(config: ClientConfig, output: Arc<dyn AudioOutput>) -> Result<Self, AppError> {
        config.validate()?;

        tracing::info!(
            "Initializing Spinlink (relay {}, streams {})...",
            config.relay_url,
            config.stream_url
        );

        let http = reqwest::Client::builder()
            .connect_timeout(config.http_timeout())
            .build()
            .map_err(|e| AppError::Http(e.to_string()))?;

        let engine = Arc::new(AudioEngine::new(output));
        let sampler = Arc::new(SpectralSampler::new(config.spectral_interval()));
        let pipeline = AudioConditioningPipeline::new(Arc::clone(&engine), Arc::clone(&sampler));

        let relay = Arc::new(RelayClient::new(
            http.clone(),
            &config.relay_url,
            config.http_timeout(),
        ));

        let negotiator = Negotiator::new(
            Arc::new(WebRtcPeerFactory::new(&config.ice_servers)),
            Arc::new(HttpSdpExchange::new(http.clone(), config.http_timeout())),
            &config.stream_url,
            config.ice_gather_wait(),
            config.track_timeout(),
        );

        let fallback = FallbackTransport::new(
            Arc::new(HttpFetcher::new(http, config.http_timeout())),
            pipeline.clone(),
            &config.stream_url,
            config.fallback_timeout(),
        );

        let controller = SessionController::new(
            Arc::clone(&relay) as Arc<dyn relay::RelayActivator>,
            negotiator,
            fallback,
            pipeline,
            config.relay_grace(),
            config.first_frame_timeout(),
        );

        Ok(Self {
            config,
            engine,
            sampler,
            relay,
            controller,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    pub fn sampler(&self) -> &Arc<SpectralSampler> {
        &self.sampler
    }

    /// Stoppt die Session und schließt den Audio-Kontext
    pub fn shutdown(&self) {
        self.controller.stop();
        self.engine.shutdown();
        tracing::info!("Spinlink shut down");
    }
}

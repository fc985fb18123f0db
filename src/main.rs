//! Spinlink - Kommandozeile
//!
//! `spinlink [vinyl|cd]` startet die Wiedergabe der Quelle und läuft bis Ctrl-C.

use anyhow::Context;
use spinlink_lib::audio::{AudioOutput, CpalOutput, NullOutput};
use spinlink_lib::config::ClientConfig;
use spinlink_lib::session::{SessionEvent, Source};
use spinlink_lib::AppState;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    spinlink_lib::init_tracing();

    let config = ClientConfig::load().context("Failed to load configuration")?;

    let source = match std::env::args().nth(1) {
        Some(arg) => arg.parse::<Source>().map_err(anyhow::Error::msg)?,
        None => Source::default(),
    };

    let output: Arc<dyn AudioOutput> = if config.headless {
        Arc::new(NullOutput::new())
    } else {
        Arc::new(CpalOutput::new())
    };

    let app = AppState::new(config, output)?;

    match app.relay().health().await {
        Ok(health) => tracing::info!(
            "Relay {} reports {} at {}",
            app.relay().base_url(),
            health.status,
            health.timestamp
        ),
        Err(e) => tracing::warn!("Relay {} not reachable: {}", app.relay().base_url(), e),
    }

    // Session Events
    let mut events = app.controller().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => {
                    tracing::info!("Session state: {:?}", state);
                }
                Ok(SessionEvent::Error(message)) => {
                    tracing::error!("Session error: {}", message);
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Skipped {} session events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // Spektrale Snapshots
    let mut snapshots = app.sampler().subscribe();
    tokio::spawn(async move {
        loop {
            match snapshots.recv().await {
                Ok(snapshot) => {
                    let peaks: Vec<String> = snapshot
                        .peaks
                        .iter()
                        .map(|peak| format!("{:.0} Hz ({})", peak.frequency_hz, peak.amplitude))
                        .collect();
                    tracing::debug!("Spectral peaks: [{}]", peaks.join(", "));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Err(e) = app.controller().start(source).await {
        app.shutdown();
        return Err(e).context(format!("Could not play {}", source));
    }

    tracing::info!("Playing {}. Press Ctrl-C to stop.", source);
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    app.shutdown();
    Ok(())
}

//! Audio Output - Lautsprecher-Streams hinter einem schmalen Trait
//!
//! Verwendet cpal für Cross-Platform Audio Output. Jeder geöffnete Stream
//! zieht 48kHz Stereo aus einem Render-Callback; Resampling und
//! Kanal-Mapping auf das Gerät passieren hier.

use super::media::{MEDIA_CHANNELS, MEDIA_SAMPLE_RATE};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Render-Callback: füllt einen Puffer mit interleaved Stereo @ 48kHz
pub type RenderCallback = Box<dyn FnMut(&mut [f32]) + Send + 'static>;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum AudioError {
    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),

    #[error("Failed to pause audio stream: {0}")]
    StreamPauseError(String),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Quelle für Output-Streams (Gerät oder Null-Senke)
pub trait AudioOutput: Send + Sync {
    /// Öffnet einen laufenden Stream, der `render` periodisch aufruft
    fn open(&self, label: &str, render: RenderCallback)
        -> Result<Box<dyn OutputStream>, AudioError>;
}

/// Ein geöffneter Output-Stream. Drop schließt ihn.
pub trait OutputStream: Send {
    fn pause(&self) -> Result<(), AudioError>;
    fn resume(&self) -> Result<(), AudioError>;
}

// ============================================================================
// CPAL OUTPUT
// ============================================================================

/// Output über das Default-Gerät des Default-Hosts
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

impl CpalOutput {
    pub fn new() -> Self {
        Self
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

        select_best_config(configs.collect())
    }
}

impl AudioOutput for CpalOutput {
    fn open(
        &self,
        label: &str,
        mut render: RenderCallback,
    ) -> Result<Box<dyn OutputStream>, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::NoOutputDevice)?;

        let config = Self::find_best_output_config(&device)?;

        tracing::info!(
            "Opening output stream '{}': {} Hz, {} channels",
            label,
            config.sample_rate.0,
            config.channels
        );

        let channels = config.channels as usize;
        let ratio = MEDIA_SAMPLE_RATE as f64 / config.sample_rate.0 as f64;
        let mut scratch: Vec<f32> = Vec::new();
        let stream_label = label.to_string();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels.max(1);
                    let source_frames = ((frames as f64) * ratio).ceil() as usize;
                    if source_frames == 0 {
                        data.fill(0.0);
                        return;
                    }

                    scratch.resize(source_frames * MEDIA_CHANNELS, 0.0);
                    render(&mut scratch);

                    // Resampling (nearest) und Stereo auf Gerätekanäle verteilen
                    for i in 0..frames {
                        let src = ((i as f64 * ratio) as usize).min(source_frames - 1);
                        let left = scratch[src * MEDIA_CHANNELS];
                        let right = scratch[src * MEDIA_CHANNELS + 1];
                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = match (channels, c) {
                                    (1, _) => (left + right) * 0.5,
                                    (_, 0) => left,
                                    (_, 1) => right,
                                    _ => 0.0,
                                };
                            }
                        }
                    }
                },
                move |err| {
                    tracing::error!("Audio output error on '{}': {}", stream_label, err);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

        Ok(Box::new(CpalStream { stream }))
    }
}

/// Hält einen laufenden cpal Stream
struct CpalStream {
    stream: Stream,
}

// cpal::Stream ist nicht Send; der Stream wird nur über &self pausiert
// und beim Drop geschlossen
unsafe impl Send for CpalStream {}

impl OutputStream for CpalStream {
    fn pause(&self) -> Result<(), AudioError> {
        self.stream
            .pause()
            .map_err(|e| AudioError::StreamPauseError(e.to_string()))
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.stream
            .play()
            .map_err(|e| AudioError::StreamPlayError(e.to_string()))
    }
}

/// Wählt die beste Konfiguration aus einer Liste
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    // Priorität: 48kHz F32 > F32 mit bester Rate
    let target_rate = cpal::SampleRate(MEDIA_SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 output configuration found".to_string(),
    ))
}

// ============================================================================
// NULL OUTPUT
// ============================================================================

/// Output ohne Gerät, für Headless-Betrieb und Tests.
///
/// Streams werden nur gerendert, wenn `render` aufgerufen wird.
#[derive(Clone, Default)]
pub struct NullOutput {
    inner: Arc<Mutex<NullOutputInner>>,
}

#[derive(Default)]
struct NullOutputInner {
    next_id: u64,
    streams: Vec<NullSlot>,
    failing: Vec<String>,
}

struct NullSlot {
    id: u64,
    label: String,
    render: Arc<Mutex<RenderCallback>>,
    paused: Arc<AtomicBool>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output, dessen `open` für die genannten Label-Präfixe fehlschlägt
    pub fn failing(labels: &[&str]) -> Self {
        let output = Self::default();
        output.inner.lock().failing = labels.iter().map(|l| l.to_string()).collect();
        output
    }

    /// Rendert `frames` Stereo-Frames aus dem ersten Stream mit passendem
    /// Label-Präfix. Pausierte Streams liefern Stille.
    pub fn render(&self, label: &str, frames: usize) -> Option<Vec<f32>> {
        let (render, paused) = {
            let inner = self.inner.lock();
            let slot = inner.streams.iter().find(|s| s.label.starts_with(label))?;
            (Arc::clone(&slot.render), Arc::clone(&slot.paused))
        };

        let mut buffer = vec![0.0f32; frames * MEDIA_CHANNELS];
        if !paused.load(Ordering::SeqCst) {
            (render.lock())(&mut buffer);
        }
        Some(buffer)
    }

    /// Labels aller offenen Streams
    pub fn open_streams(&self) -> Vec<String> {
        self.inner
            .lock()
            .streams
            .iter()
            .map(|s| s.label.clone())
            .collect()
    }
}

impl AudioOutput for NullOutput {
    fn open(
        &self,
        label: &str,
        render: RenderCallback,
    ) -> Result<Box<dyn OutputStream>, AudioError> {
        let mut inner = self.inner.lock();
        if inner.failing.iter().any(|f| label.starts_with(f.as_str())) {
            return Err(AudioError::NoOutputDevice);
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let paused = Arc::new(AtomicBool::new(false));
        inner.streams.push(NullSlot {
            id,
            label: label.to_string(),
            render: Arc::new(Mutex::new(render)),
            paused: Arc::clone(&paused),
        });

        tracing::debug!("Null output stream '{}' opened", label);

        Ok(Box::new(NullStream {
            id,
            paused,
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct NullStream {
    id: u64,
    paused: Arc<AtomicBool>,
    inner: Arc<Mutex<NullOutputInner>>,
}

impl OutputStream for NullStream {
    fn pause(&self) -> Result<(), AudioError> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for NullStream {
    fn drop(&mut self) {
        self.inner.lock().streams.retain(|s| s.id != self.id);
    }
}

//! Raw Playback - ungefilterte Wiedergabe eines Feeds
//!
//! Entspricht einem Media-Element neben dem Graphen: eigener Output-Stream,
//! eigener Tap, eigene Lautstärke. Solange eine Conditioning-Chain aktiv
//! ist, läuft der Raw-Pfad stumm.

use super::media::MediaSource;
use super::output::{AudioError, AudioOutput, OutputStream};

pub struct RawPlayback {
    volume: f32,
    stream: Option<Box<dyn OutputStream>>,
}

impl RawPlayback {
    /// Startet die Wiedergabe von `media` mit der gegebenen Lautstärke
    pub fn start(
        output: &dyn AudioOutput,
        media: &MediaSource,
        volume: f32,
    ) -> Result<Self, AudioError> {
        let tap = media.tap();
        let volume = volume.clamp(0.0, 1.0);

        let stream = output.open(
            &format!("raw:{}", media.kind().label()),
            Box::new(move |out: &mut [f32]| {
                tap.read(out);
                for sample in out.iter_mut() {
                    *sample *= volume;
                }
            }),
        )?;

        tracing::info!(
            "Raw playback started for {} feed at volume {:.1}",
            media.kind().label(),
            volume
        );

        Ok(Self {
            volume,
            stream: Some(stream),
        })
    }

    pub fn volume(&self) -> f32 {
        self.volume
    }

    pub fn is_active(&self) -> bool {
        self.stream.is_some()
    }

    /// Stoppt die Wiedergabe. Mehrfacher Aufruf ist ein No-op.
    pub fn stop(&mut self) {
        if self.stream.take().is_some() {
            tracing::debug!("Raw playback stopped");
        }
    }
}

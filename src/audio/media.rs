//! Media Sources - Live-PCM-Feeds mit Fan-out
//!
//! Ein `MediaSource` steht für einen laufenden Audio-Feed (WebRTC-Track,
//! HLS-Segmente oder Direkt-Stream). Der Producer schreibt über den
//! `MediaWriter`, jeder Konsument (Raw-Playback, Source-Node des Graphen)
//! liest über einen eigenen `MediaTap`.
//!
//! Alle Feeds liefern 48kHz Stereo, interleaved `f32`.

use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate aller Media-Feeds (Opus-Standard)
pub const MEDIA_SAMPLE_RATE: u32 = 48000;

/// Channels aller Media-Feeds (interleaved Stereo)
pub const MEDIA_CHANNELS: usize = 2;

/// Puffer pro Tap: 2 Sekunden Stereo
const TAP_CAPACITY: usize = MEDIA_SAMPLE_RATE as usize * MEDIA_CHANNELS * 2;

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Herkunft eines Media-Feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    /// Eingehender WebRTC-Audio-Track
    PeerTrack,
    /// HLS-Segmente (`stream.m3u8`)
    Segmented,
    /// Progressiver Direkt-Stream
    Direct,
}

impl MediaKind {
    pub fn label(self) -> &'static str {
        match self {
            MediaKind::PeerTrack => "peer",
            MediaKind::Segmented => "segmented",
            MediaKind::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedStatus {
    Pending,
    Flowing,
    Ended,
}

type TapBuffer = Mutex<HeapRb<f32>>;

struct MediaShared {
    taps: Mutex<Vec<Weak<TapBuffer>>>,
    status: watch::Sender<FeedStatus>,
    delivered: AtomicBool,
    ended: AtomicBool,
}

impl MediaShared {
    fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
        self.status.send_replace(FeedStatus::Ended);
    }
}

/// Konsumentenseite eines Live-Feeds
#[derive(Clone)]
pub struct MediaSource {
    id: Uuid,
    kind: MediaKind,
    shared: Arc<MediaShared>,
}

/// Producerseite eines Live-Feeds
pub struct MediaWriter {
    shared: Arc<MediaShared>,
}

impl MediaSource {
    /// Erstellt einen neuen Feed samt zugehörigem Writer
    pub fn new(kind: MediaKind) -> (Self, MediaWriter) {
        let (status, _) = watch::channel(FeedStatus::Pending);
        let shared = Arc::new(MediaShared {
            taps: Mutex::new(Vec::new()),
            status,
            delivered: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        });

        let source = Self {
            id: Uuid::new_v4(),
            kind,
            shared: Arc::clone(&shared),
        };

        (source, MediaWriter { shared })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Öffnet einen neuen Tap. Er sieht nur Samples, die nach seiner
    /// Erstellung geschrieben werden.
    pub fn tap(&self) -> MediaTap {
        let buffer = Arc::new(Mutex::new(HeapRb::new(TAP_CAPACITY)));
        self.shared.taps.lock().push(Arc::downgrade(&buffer));
        MediaTap { buffer }
    }

    /// Wurde mindestens ein Frame geliefert?
    pub fn has_first_frame(&self) -> bool {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Wartet auf den ersten Frame.
    ///
    /// Gibt `false` zurück, wenn der Feed endet, ohne je Daten zu liefern.
    pub async fn wait_first_frame(&self) -> bool {
        let mut rx = self.shared.status.subscribe();
        let _ = rx.wait_for(|status| *status != FeedStatus::Pending).await;
        self.has_first_frame()
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    /// Beendet den Feed von Konsumentenseite; der Producer hört beim
    /// nächsten `push` auf.
    pub fn close(&self) {
        self.shared.end();
    }

    /// Anzahl lebender Taps
    pub fn tap_count(&self) -> usize {
        let mut taps = self.shared.taps.lock();
        taps.retain(|tap| tap.strong_count() > 0);
        taps.len()
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("has_first_frame", &self.has_first_frame())
            .field("is_ended", &self.is_ended())
            .finish()
    }
}

impl MediaWriter {
    /// Schreibt interleaved Stereo-Samples in alle Taps.
    ///
    /// Volle Taps verwerfen die ältesten Samples. Gibt `false` zurück,
    /// sobald der Feed beendet wurde.
    pub fn push(&self, samples: &[f32]) -> bool {
        if self.is_closed() {
            return false;
        }
        if samples.is_empty() {
            return true;
        }

        self.shared.taps.lock().retain(|tap| match tap.upgrade() {
            Some(buffer) => {
                buffer.lock().push_slice_overwrite(samples);
                true
            }
            None => false,
        });

        if !self.shared.delivered.swap(true, Ordering::SeqCst) {
            self.shared.status.send_replace(FeedStatus::Flowing);
        }
        true
    }

    /// Markiert das Ende des Feeds
    pub fn finish(&self) {
        self.shared.end();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }
}

/// Ohne Producer endet der Feed
impl Drop for MediaWriter {
    fn drop(&mut self) {
        self.shared.end();
    }
}

// ============================================================================
// MEDIA TAP
// ============================================================================

/// Lesezugriff eines Konsumenten auf einen Feed
pub struct MediaTap {
    buffer: Arc<TapBuffer>,
}

impl MediaTap {
    /// Füllt `out` mit gepufferten Samples, der Rest wird Stille.
    /// Gibt die Anzahl echter Samples zurück.
    pub fn read(&self, out: &mut [f32]) -> usize {
        let read = self.buffer.lock().pop_slice(out);
        out[read..].fill(0.0);
        read
    }

    pub fn available(&self) -> usize {
        self.buffer.lock().occupied_len()
    }
}

// ============================================================================
// FORMAT CONVERSION
// ============================================================================

/// Konvertiert i16 PCM nach f32
pub fn pcm_i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Bringt interleaved PCM beliebiger Rate/Kanalzahl ins Media-Format
/// (48kHz Stereo). Mono wird dupliziert, weitere Kanäle verworfen.
pub fn to_media_format(samples: &[f32], channels: usize, sample_rate: u32) -> Vec<f32> {
    if channels == 0 || sample_rate == 0 {
        return Vec::new();
    }

    let frames = samples.len() / channels;
    let mut stereo = Vec::with_capacity(frames * MEDIA_CHANNELS);
    for frame in samples.chunks_exact(channels) {
        let left = frame[0];
        let right = if channels > 1 { frame[1] } else { left };
        stereo.push(left);
        stereo.push(right);
    }

    if sample_rate == MEDIA_SAMPLE_RATE {
        return stereo;
    }

    // Einfaches Linear-Resampling
    let ratio = MEDIA_SAMPLE_RATE as f64 / sample_rate as f64;
    let out_frames = (frames as f64 * ratio) as usize;
    let mut out = Vec::with_capacity(out_frames * MEDIA_CHANNELS);
    for i in 0..out_frames {
        let src = i as f64 / ratio;
        let idx = src as usize;
        let frac = (src - idx as f64) as f32;
        for c in 0..MEDIA_CHANNELS {
            let s1 = stereo.get(idx * MEDIA_CHANNELS + c).copied().unwrap_or(0.0);
            let s2 = stereo
                .get((idx + 1) * MEDIA_CHANNELS + c)
                .copied()
                .unwrap_or(s1);
            out.push(s1 + (s2 - s1) * frac);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_to_all_taps() {
        let (media, writer) = MediaSource::new(MediaKind::Direct);
        let a = media.tap();
        let b = media.tap();

        assert!(writer.push(&[0.1, 0.2, 0.3, 0.4]));

        let mut out = [0.0f32; 4];
        assert_eq!(a.read(&mut out), 4);
        assert_eq!(out, [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(b.available(), 4);
    }

    #[test]
    fn test_tap_pads_with_silence() {
        let (media, writer) = MediaSource::new(MediaKind::Direct);
        let tap = media.tap();
        writer.push(&[0.5, 0.5]);

        let mut out = [1.0f32; 6];
        assert_eq!(tap.read(&mut out), 2);
        assert_eq!(out, [0.5, 0.5, 0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_dropped_taps_are_pruned() {
        let (media, writer) = MediaSource::new(MediaKind::PeerTrack);
        let tap = media.tap();
        assert_eq!(media.tap_count(), 1);
        drop(tap);
        writer.push(&[0.0, 0.0]);
        assert_eq!(media.tap_count(), 0);
    }

    #[test]
    fn test_close_stops_writer() {
        let (media, writer) = MediaSource::new(MediaKind::Segmented);
        media.close();
        assert!(!writer.push(&[0.0, 0.0]));
        assert!(media.is_ended());
    }

    #[tokio::test]
    async fn test_wait_first_frame() {
        let (media, writer) = MediaSource::new(MediaKind::PeerTrack);
        assert!(!media.has_first_frame());
        writer.push(&[0.0, 0.0]);
        assert!(media.wait_first_frame().await);
    }

    #[tokio::test]
    async fn test_wait_first_frame_on_empty_end() {
        let (media, writer) = MediaSource::new(MediaKind::Direct);
        writer.finish();
        assert!(!media.wait_first_frame().await);
    }

    #[test]
    fn test_mono_is_duplicated() {
        let out = to_media_format(&[0.25, -0.25], 1, MEDIA_SAMPLE_RATE);
        assert_eq!(out, vec![0.25, 0.25, -0.25, -0.25]);
    }

    #[test]
    fn test_resample_length() {
        let input = vec![0.0f32; 44100 * 2];
        let out = to_media_format(&input, 2, 44100);
        assert_eq!(out.len(), 48000 * 2);
    }
}

//! Fallback Transport - Wiedergabe ohne WebRTC
//!
//! Reihenfolge:
//! 1. Segmentiert: `{base}stream.m3u8`, Segmente dekodieren, konditioniert
//!    über die gemeinsame Pipeline abspielen
//! 2. Direkt: `{base}` progressiv laden, ungefiltert mit voller Lautstärke
//!
//! Scheitert auch der Direkt-Pfad, ist der Fallback erschöpft.

use super::fetch::MediaFetcher;
use super::playlist::{
    parse_playlist, segment_extension, MediaPlaylist, Playlist, PlaylistError, Segment,
};
use crate::audio::{
    decode_segment, decode_stream, AudioConditioningPipeline, ChannelReader, CodecError,
    FilterSpec, MediaKind, MediaSource, MediaWriter, PlaybackHandle, MEDIA_CHANNELS,
    MEDIA_SAMPLE_RATE,
};
use crate::session::{PlaybackMode, SessionTicket, Source};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use url::Url;

/// Start an der Live-Kante: so viele Segmente vom Ende der Playlist
const LIVE_EDGE_SEGMENTS: usize = 3;

/// Aufeinanderfolgende Fehler, nach denen der Segment-Feed aufgibt
const MAX_SEGMENT_FAILURES: u32 = 3;

/// Maximaler Vorlauf des Feeders gegenüber der Wiedergabe
const MAX_LEAD: Duration = Duration::from_millis(1000);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum FallbackError {
    #[error("Fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("{url} answered with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Playlist error: {0}")]
    Playlist(#[from] PlaylistError),

    #[error("Decode error: {0}")]
    Decode(#[from] CodecError),

    #[error("No audio from {url} within {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Segmented playback failed ({segmented}); direct playback failed ({direct})")]
    Exhausted {
        segmented: Box<FallbackError>,
        direct: Box<FallbackError>,
    },

    #[error("Fallback cancelled")]
    Cancelled,
}

// ============================================================================
// FALLBACK STREAM
// ============================================================================

/// Laufende Fallback-Wiedergabe
pub struct FallbackStream {
    media: MediaSource,
    mode: PlaybackMode,
    playback: PlaybackHandle,
    feeder: JoinHandle<()>,
    url: Url,
    released: bool,
}

impl FallbackStream {
    pub fn media(&self) -> &MediaSource {
        &self.media
    }

    pub fn mode(&self) -> PlaybackMode {
        self.mode
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn playback(&self) -> &PlaybackHandle {
        &self.playback
    }

    pub fn is_conditioned(&self) -> bool {
        self.playback.is_conditioned()
    }

    pub fn raw_volume(&self) -> f32 {
        self.playback.raw_volume()
    }

    /// Filter des verbundenen Graphen (leer beim Direkt-Pfad)
    pub fn active_filters(&self) -> Vec<FilterSpec> {
        self.playback.active_filters()
    }

    pub fn has_graph(&self) -> bool {
        self.playback.has_graph()
    }

    /// Stoppt Feeder und Wiedergabe. Mehrfacher Aufruf ist ein No-op.
    pub fn release(&mut self, pipeline: &AudioConditioningPipeline) {
        if self.released {
            return;
        }
        self.released = true;

        self.feeder.abort();
        self.media.close();
        pipeline.release(&mut self.playback);
        tracing::info!("{} fallback from {} released", self.mode, self.url);
    }
}

impl Drop for FallbackStream {
    fn drop(&mut self) {
        self.feeder.abort();
        self.media.close();
    }
}

impl std::fmt::Debug for FallbackStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackStream")
            .field("mode", &self.mode)
            .field("url", &self.url.as_str())
            .field("released", &self.released)
            .finish()
    }
}

// ============================================================================
// FALLBACK TRANSPORT
// ============================================================================

#[derive(Clone)]
pub struct FallbackTransport {
    fetcher: Arc<dyn MediaFetcher>,
    pipeline: AudioConditioningPipeline,
    stream_url: String,
    startup_timeout: Duration,
}

impl FallbackTransport {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        pipeline: AudioConditioningPipeline,
        stream_url: &str,
        startup_timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            pipeline,
            stream_url: stream_url.to_string(),
            startup_timeout,
        }
    }

    /// Startet den Fallback für `source`: erst segmentiert, dann direkt
    pub async fn acquire(
        &self,
        source: Source,
        ticket: &SessionTicket,
    ) -> Result<FallbackStream, FallbackError> {
        let base_str = source.stream_base(&self.stream_url);
        let base = Url::parse(&base_str).map_err(|e| FallbackError::Fetch {
            url: base_str.clone(),
            reason: e.to_string(),
        })?;

        let segmented = match self.acquire_segmented(&base, ticket).await {
            Ok(stream) => return Ok(stream),
            Err(FallbackError::Cancelled) => return Err(FallbackError::Cancelled),
            Err(e) => {
                tracing::warn!("Segmented fallback for {} failed: {}", source, e);
                e
            }
        };

        match self.acquire_direct(&base, ticket).await {
            Ok(stream) => Ok(stream),
            Err(FallbackError::Cancelled) => Err(FallbackError::Cancelled),
            Err(direct) => {
                tracing::error!("Direct fallback for {} failed: {}", source, direct);
                Err(FallbackError::Exhausted {
                    segmented: Box::new(segmented),
                    direct: Box::new(direct),
                })
            }
        }
    }

    // ========================================================================
    // SEGMENTED
    // ========================================================================

    async fn acquire_segmented(
        &self,
        base: &Url,
        ticket: &SessionTicket,
    ) -> Result<FallbackStream, FallbackError> {
        let playlist_url = base.join("stream.m3u8").map_err(|e| PlaylistError::InvalidUri {
            uri: "stream.m3u8".to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!("Trying segmented playback from {}", playlist_url);

        let startup = async {
            let (media_url, playlist) = self.resolve_media_playlist(&playlist_url).await?;
            ensure_live(ticket)?;

            let mut feed = HlsFeed::new(Arc::clone(&self.fetcher), media_url, playlist);
            let first = feed
                .next_chunk(ticket)
                .await?
                .ok_or(FallbackError::Decode(CodecError::NoAudio))?;
            Ok::<_, FallbackError>((feed, first))
        };

        let (feed, first) = tokio::time::timeout(self.startup_timeout, startup)
            .await
            .map_err(|_| FallbackError::Timeout {
                url: playlist_url.to_string(),
                timeout: self.startup_timeout,
            })??;
        ensure_live(ticket)?;

        let (media, writer) = MediaSource::new(MediaKind::Segmented);
        let playback = self
            .pipeline
            .play_conditioned(&media)
            .map_err(|e| FallbackError::Playback(e.to_string()))?;

        let mut pacer = Pacer::new();
        writer.push(&first);
        pacer.account(first.len());
        let feeder = tokio::spawn(feed.run(writer, pacer));

        tracing::info!("Segmented playback started from {}", playlist_url);

        Ok(FallbackStream {
            media,
            mode: PlaybackMode::Segmented,
            playback: PlaybackHandle::Conditioned(playback),
            feeder,
            url: playlist_url,
            released: false,
        })
    }

    /// Folgt einer Master-Playlist bis zur Media-Playlist
    async fn resolve_media_playlist(
        &self,
        url: &Url,
    ) -> Result<(Url, MediaPlaylist), FallbackError> {
        let text = self.fetcher.fetch_text(url).await?;
        match parse_playlist(url, &text)? {
            Playlist::Media(playlist) => Ok((url.clone(), playlist)),
            Playlist::Master(master) => {
                let media_url = master.preferred_media()?.clone();
                tracing::debug!("Master playlist {} -> {}", url, media_url);
                let text = self.fetcher.fetch_text(&media_url).await?;
                match parse_playlist(&media_url, &text)? {
                    Playlist::Media(playlist) => Ok((media_url, playlist)),
                    Playlist::Master(_) => Err(PlaylistError::UnexpectedMaster.into()),
                }
            }
        }
    }

    // ========================================================================
    // DIRECT
    // ========================================================================

    async fn acquire_direct(
        &self,
        base: &Url,
        ticket: &SessionTicket,
    ) -> Result<FallbackStream, FallbackError> {
        tracing::info!("Trying direct playback from {}", base);
        let timeout_error = || FallbackError::Timeout {
            url: base.to_string(),
            timeout: self.startup_timeout,
        };
        let deadline = Instant::now() + self.startup_timeout;

        let chunks = tokio::time::timeout_at(deadline, self.fetcher.open_stream(base))
            .await
            .map_err(|_| timeout_error())??;
        ensure_live(ticket)?;

        let (media, writer) = MediaSource::new(MediaKind::Direct);
        let mut raw = self
            .pipeline
            .play_raw(&media)
            .map_err(|e| FallbackError::Playback(e.to_string()))?;

        let (started_tx, started_rx) = oneshot::channel();
        let extension = segment_extension(base);
        let url = base.to_string();
        let feeder = tokio::task::spawn_blocking(move || {
            let reader = ChannelReader::new(chunks);
            if let Err(e) = decode_stream(reader, extension.as_deref(), &writer, Some(started_tx)) {
                tracing::warn!("Direct stream {} decode stopped: {}", url, e);
            }
            writer.finish();
        });

        let started = tokio::time::timeout_at(deadline, started_rx).await;
        let failure = match started {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(FallbackError::Decode(e)),
            Ok(Err(_)) => Some(FallbackError::Decode(CodecError::NoAudio)),
            Err(_) => Some(timeout_error()),
        };
        let failure = failure.or_else(|| (!ticket.is_live()).then_some(FallbackError::Cancelled));

        if let Some(e) = failure {
            media.close();
            raw.stop();
            return Err(e);
        }

        tracing::info!("Direct playback started from {}", base);

        Ok(FallbackStream {
            media,
            mode: PlaybackMode::Direct,
            playback: PlaybackHandle::Raw(raw),
            feeder,
            url: base.clone(),
            released: false,
        })
    }
}

fn ensure_live(ticket: &SessionTicket) -> Result<(), FallbackError> {
    if ticket.is_live() {
        Ok(())
    } else {
        Err(FallbackError::Cancelled)
    }
}

// ============================================================================
// HLS FEED
// ============================================================================

/// Hält den Feeder höchstens `MAX_LEAD` vor der Echtzeit
struct Pacer {
    started: Instant,
    pushed: Duration,
}

impl Pacer {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            pushed: Duration::ZERO,
        }
    }

    fn account(&mut self, samples: usize) {
        let frames = samples / MEDIA_CHANNELS;
        self.pushed += Duration::from_secs_f64(frames as f64 / MEDIA_SAMPLE_RATE as f64);
    }

    async fn wait(&self) {
        let ahead = self.pushed.saturating_sub(self.started.elapsed());
        if ahead > MAX_LEAD {
            tokio::time::sleep(ahead - MAX_LEAD).await;
        }
    }
}

/// Liest eine Live-Media-Playlist und dekodiert neue Segmente
struct HlsFeed {
    fetcher: Arc<dyn MediaFetcher>,
    playlist_url: Url,
    playlist: MediaPlaylist,
    init: Option<(Url, Vec<u8>)>,
    pending: VecDeque<Segment>,
    next_sequence: u64,
    failures: u32,
}

impl HlsFeed {
    fn new(fetcher: Arc<dyn MediaFetcher>, playlist_url: Url, playlist: MediaPlaylist) -> Self {
        let pending: VecDeque<Segment> = playlist
            .live_edge(LIVE_EDGE_SEGMENTS)
            .iter()
            .cloned()
            .collect();
        let next_sequence = pending
            .back()
            .map(|s| s.sequence + 1)
            .unwrap_or(playlist.media_sequence);

        Self {
            fetcher,
            playlist_url,
            playlist,
            init: None,
            pending,
            next_sequence,
            failures: 0,
        }
    }

    /// Nächster dekodierter Block; `None` wenn die Playlist beendet ist
    async fn next_chunk(
        &mut self,
        ticket: &SessionTicket,
    ) -> Result<Option<Vec<f32>>, FallbackError> {
        loop {
            while let Some(segment) = self.pending.pop_front() {
                match self.decode(&segment).await {
                    Ok(samples) if !samples.is_empty() => {
                        self.failures = 0;
                        return Ok(Some(samples));
                    }
                    Ok(_) => tracing::debug!("Segment {} carried no audio", segment.sequence),
                    Err(e) => self.record_failure(e)?,
                }
                ensure_live(ticket)?;
            }

            if self.playlist.ended {
                return Ok(None);
            }

            tokio::time::sleep(self.playlist.refresh_interval()).await;
            ensure_live(ticket)?;
            if let Err(e) = self.refresh().await {
                self.record_failure(e)?;
            }
        }
    }

    fn record_failure(&mut self, e: FallbackError) -> Result<(), FallbackError> {
        self.failures += 1;
        tracing::warn!(
            "Segment feed error ({}/{}): {}",
            self.failures,
            MAX_SEGMENT_FAILURES,
            e
        );
        if self.failures >= MAX_SEGMENT_FAILURES {
            Err(e)
        } else {
            Ok(())
        }
    }

    async fn refresh(&mut self) -> Result<(), FallbackError> {
        let text = self.fetcher.fetch_text(&self.playlist_url).await?;
        let playlist = match parse_playlist(&self.playlist_url, &text)? {
            Playlist::Media(playlist) => playlist,
            Playlist::Master(_) => return Err(PlaylistError::UnexpectedMaster.into()),
        };

        for segment in playlist.segments_from(self.next_sequence) {
            self.pending.push_back(segment.clone());
            self.next_sequence = segment.sequence + 1;
        }
        self.playlist = playlist;
        Ok(())
    }

    async fn decode(&mut self, segment: &Segment) -> Result<Vec<f32>, FallbackError> {
        let mut bytes = match self.init_segment().await? {
            Some(init) => init,
            None => Vec::new(),
        };
        bytes.extend(self.fetcher.fetch(&segment.uri).await?);

        let extension = segment_extension(&segment.uri);
        let samples = tokio::task::spawn_blocking(move || decode_segment(bytes, extension.as_deref()))
            .await
            .map_err(|e| FallbackError::Playback(format!("decoder task failed: {}", e)))??;
        Ok(samples)
    }

    /// Init-Segment (`EXT-X-MAP`), einmal pro URI geladen
    async fn init_segment(&mut self) -> Result<Option<Vec<u8>>, FallbackError> {
        let Some(url) = self.playlist.init.clone() else {
            return Ok(None);
        };
        if let Some((cached, bytes)) = &self.init {
            if *cached == url {
                return Ok(Some(bytes.clone()));
            }
        }

        let bytes = self.fetcher.fetch(&url).await?;
        self.init = Some((url, bytes.clone()));
        Ok(Some(bytes))
    }

    /// Feeder-Task: schreibt neue Segmente bis Feed oder Playlist enden
    async fn run(mut self, writer: MediaWriter, mut pacer: Pacer) {
        let ticket = SessionTicket::detached();
        loop {
            pacer.wait().await;
            if writer.is_closed() {
                break;
            }

            match self.next_chunk(&ticket).await {
                Ok(Some(samples)) => {
                    if !writer.push(&samples) {
                        break;
                    }
                    pacer.account(samples.len());
                }
                Ok(None) => {
                    tracing::info!("Playlist {} ended", self.playlist_url);
                    break;
                }
                Err(e) => {
                    tracing::warn!("Segment feed {} stopped: {}", self.playlist_url, e);
                    break;
                }
            }
        }
        writer.finish();
    }
}

//! Audio Conditioning Pipeline
//!
//! Baut aus einem Media-Feed die feste Chain
//! Source → 12 Biquads → Analyser → Gain → Destination
//! und verbindet sie mit dem gemeinsamen Audio Context. Beide
//! Wiedergabepfade (WebRTC und Segmente) gehen durch `play_conditioned`.

use super::analyser::AnalyserTap;
use super::context::{AudioContext, AudioEngine, AudioGraphError, LOCK_TIMEOUT};
use super::filters::{BiquadFilter, FilterSpec, FILTER_CASCADE, OUTPUT_GAIN};
use super::media::{MediaSource, MediaTap, MEDIA_CHANNELS};
use super::output::AudioError;
use super::playback::RawPlayback;
use super::sampler::SpectralSampler;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

// ============================================================================
// CONDITIONING CHAIN
// ============================================================================

/// Knoten-Kette, die im Render-Thread der Destination läuft
pub(crate) struct ConditioningChain {
    source: Option<MediaTap>,
    filters: Vec<BiquadFilter>,
    analyser: AnalyserTap,
    gain: f32,
    scratch: Vec<f32>,
}

impl ConditioningChain {
    /// Rendert die Chain und addiert das Ergebnis auf `out`
    pub(crate) fn render_add(&mut self, out: &mut [f32]) {
        let Some(source) = self.source.as_ref() else {
            return;
        };

        self.scratch.resize(out.len(), 0.0);
        source.read(&mut self.scratch);

        for filter in self.filters.iter_mut() {
            filter.process_interleaved(&mut self.scratch);
        }
        self.analyser.push_interleaved(&self.scratch, MEDIA_CHANNELS);

        for (o, s) in out.iter_mut().zip(&self.scratch) {
            *o += s * self.gain;
        }
    }

    /// Löst alle Knoten voneinander
    fn disconnect_all(&mut self) {
        self.source = None;
        self.filters.clear();
        self.scratch.clear();
    }
}

// ============================================================================
// GRAPH HANDLE
// ============================================================================

/// Knotentyp in der Topologie eines Graphen
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeKind {
    Source,
    Filter(FilterSpec),
    Analyser,
    Gain(f32),
    Destination,
}

/// Lebende Instanz der Conditioning-Chain
pub struct AudioGraphHandle {
    id: Uuid,
    context: Arc<AudioContext>,
    chain: Arc<Mutex<ConditioningChain>>,
    analyser: AnalyserTap,
    topology: Vec<NodeKind>,
    released: bool,
}

impl AudioGraphHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn analyser(&self) -> AnalyserTap {
        self.analyser.clone()
    }

    pub fn topology(&self) -> &[NodeKind] {
        &self.topology
    }

    /// Filter in Kaskadenreihenfolge
    pub fn filters(&self) -> Vec<FilterSpec> {
        self.topology
            .iter()
            .filter_map(|node| match node {
                NodeKind::Filter(spec) => Some(*spec),
                _ => None,
            })
            .collect()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Trennt den Graphen von der Destination und löst die Knoten.
    ///
    /// Jeder Schritt läuft unabhängig; Fehler werden geloggt. Wiederholter
    /// Aufruf ist ein No-op.
    pub fn teardown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = self.context.disconnect(self.id) {
            tracing::warn!("Graph {}: detaching from destination failed: {}", self.id, e);
        }

        match self.chain.try_lock_for(LOCK_TIMEOUT) {
            Some(mut chain) => chain.disconnect_all(),
            None => tracing::warn!("Graph {}: node chain busy, not disconnected", self.id),
        }

        self.analyser.reset();
        tracing::debug!("Graph {} torn down", self.id);
    }
}

impl Drop for AudioGraphHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Baut und verbindet die Chain. Vor jedem Schritt wird geprüft, ob der
/// Context noch offen ist.
pub(crate) fn build_graph(
    context: &Arc<AudioContext>,
    media: &MediaSource,
) -> Result<AudioGraphHandle, AudioGraphError> {
    context.ensure_open()?;
    let source = media.tap();

    context.ensure_open()?;
    let filters: Vec<BiquadFilter> = FILTER_CASCADE
        .iter()
        .map(|spec| BiquadFilter::new(*spec, context.sample_rate(), MEDIA_CHANNELS))
        .collect();
    let analyser = AnalyserTap::new(context.sample_rate());

    context.ensure_open()?;
    let mut topology = vec![NodeKind::Source];
    topology.extend(filters.iter().map(|f| NodeKind::Filter(f.spec())));
    topology.push(NodeKind::Analyser);
    topology.push(NodeKind::Gain(OUTPUT_GAIN));
    topology.push(NodeKind::Destination);

    let chain = Arc::new(Mutex::new(ConditioningChain {
        source: Some(source),
        filters,
        analyser: analyser.clone(),
        gain: OUTPUT_GAIN,
        scratch: Vec::new(),
    }));
    let id = context.connect(Arc::clone(&chain))?;

    tracing::info!(
        "Conditioning graph {} connected ({} filters) for {} feed",
        id,
        FILTER_CASCADE.len(),
        media.kind().label()
    );

    Ok(AudioGraphHandle {
        id,
        context: Arc::clone(context),
        chain,
        analyser,
        topology,
        released: false,
    })
}

// ============================================================================
// CONDITIONED PLAYBACK
// ============================================================================

/// Graph plus stummer Raw-Pfad
pub struct ConditionedPlayback {
    graph: AudioGraphHandle,
    raw: RawPlayback,
}

impl ConditionedPlayback {
    pub fn graph(&self) -> &AudioGraphHandle {
        &self.graph
    }

    pub fn raw_volume(&self) -> f32 {
        self.raw.volume()
    }

    pub fn is_active(&self) -> bool {
        !self.graph.is_released()
    }

    fn release(&mut self) {
        self.graph.teardown();
        self.raw.stop();
    }
}

/// Aktive Wiedergabe eines Feeds, konditioniert oder roh
pub enum PlaybackHandle {
    Conditioned(ConditionedPlayback),
    Raw(RawPlayback),
}

impl PlaybackHandle {
    pub fn is_conditioned(&self) -> bool {
        matches!(self, PlaybackHandle::Conditioned(_))
    }

    /// Ist ein Graph mit der Destination verbunden?
    pub fn has_graph(&self) -> bool {
        matches!(self, PlaybackHandle::Conditioned(p) if p.is_active())
    }

    pub fn raw_volume(&self) -> f32 {
        match self {
            PlaybackHandle::Conditioned(p) => p.raw_volume(),
            PlaybackHandle::Raw(r) => r.volume(),
        }
    }

    /// Filter des verbundenen Graphen; leer bei roher Wiedergabe
    pub fn active_filters(&self) -> Vec<FilterSpec> {
        match self {
            PlaybackHandle::Conditioned(p) if p.is_active() => p.graph().filters(),
            _ => Vec::new(),
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Clone)]
pub struct AudioConditioningPipeline {
    engine: Arc<AudioEngine>,
    sampler: Arc<SpectralSampler>,
}

impl AudioConditioningPipeline {
    pub fn new(engine: Arc<AudioEngine>, sampler: Arc<SpectralSampler>) -> Self {
        Self { engine, sampler }
    }

    pub fn engine(&self) -> &Arc<AudioEngine> {
        &self.engine
    }

    pub fn sampler(&self) -> &Arc<SpectralSampler> {
        &self.sampler
    }

    /// Baut einen Graphen auf dem (ggf. neu erstellten) Context
    pub fn build(&self, media: &MediaSource) -> Result<AudioGraphHandle, AudioGraphError> {
        if media.is_ended() {
            return Err(AudioGraphError::NoUsableSource(format!(
                "{} feed already ended",
                media.kind().label()
            )));
        }
        let context = self.engine.acquire()?;
        build_graph(&context, media)
    }

    /// Gemeinsamer Helfer beider Pfade: Raw stumm starten, Graph bauen,
    /// Sampler starten. Bei Fehlern ist alles wieder abgebaut.
    pub fn play_conditioned(
        &self,
        media: &MediaSource,
    ) -> Result<ConditionedPlayback, AudioGraphError> {
        let raw = RawPlayback::start(self.engine.output().as_ref(), media, 0.0)?;
        let graph = self.build(media)?;
        self.sampler.start(graph.analyser());

        Ok(ConditionedPlayback { graph, raw })
    }

    /// Ungefilterte Wiedergabe mit voller Lautstärke
    pub fn play_raw(&self, media: &MediaSource) -> Result<RawPlayback, AudioError> {
        RawPlayback::start(self.engine.output().as_ref(), media, 1.0)
    }

    /// Baut eine konditionierte Wiedergabe ab und stoppt den Sampler
    pub fn teardown(&self, playback: &mut ConditionedPlayback) {
        self.sampler.stop();
        playback.release();
    }

    /// Konditioniert abspielen; lässt sich kein Graph bauen, läuft der Feed
    /// ungefiltert mit voller Lautstärke
    pub fn play(&self, media: &MediaSource) -> Result<PlaybackHandle, AudioError> {
        match self.play_conditioned(media) {
            Ok(playback) => Ok(PlaybackHandle::Conditioned(playback)),
            Err(e) => {
                tracing::warn!("Conditioning unavailable, playing unfiltered: {}", e);
                self.play_raw(media).map(PlaybackHandle::Raw)
            }
        }
    }

    /// Gibt eine Wiedergabe frei. Mehrfacher Aufruf ist ein No-op.
    pub fn release(&self, handle: &mut PlaybackHandle) {
        match handle {
            PlaybackHandle::Conditioned(playback) => {
                if playback.is_active() {
                    self.teardown(playback);
                }
            }
            PlaybackHandle::Raw(raw) => raw.stop(),
        }
    }
}

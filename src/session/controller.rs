//! Session Controller
//!
//! Koordiniert eine Wiedergabe-Session:
//! - Aktivierung der Quelle auf dem Relay (best-effort)
//! - WHEP-Verhandlung, bei Fehlschlag der Fallback
//! - Übergabe des Feeds an die Conditioning-Pipeline
//! - Überwachung der Verbindung und Abbau bei `stop`
//!
//! Es gibt höchstens eine Session. Jeder `start` zieht ein neues Ticket;
//! Arbeit mit abgelaufenem Ticket gibt ihre Ressourcen frei und meldet
//! `SessionError::Cancelled`, ohne den Status anzufassen.

use super::source::Source;
use super::state::{PlaybackMode, SessionEvent, SessionState};
use super::ticket::{GenerationCounter, SessionTicket};
use crate::audio::{AudioConditioningPipeline, FilterSpec, MediaSource, PlaybackHandle};
use crate::fallback::{FallbackError, FallbackStream, FallbackTransport};
use crate::negotiation::{NegotiatedStream, NegotiationError, Negotiator, PeerEvent};
use crate::relay::RelayActivator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Stream unavailable: negotiation failed ({negotiation}); fallback failed ({fallback})")]
    FallbackExhausted {
        negotiation: NegotiationError,
        fallback: FallbackError,
    },

    #[error("connection lost")]
    ConnectivityLost,

    #[error("No audio received within {0:?}")]
    NoMedia(Duration),

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Session cancelled")]
    Cancelled,
}

// ============================================================================
// ACTIVE SESSION
// ============================================================================

enum ActiveTransport {
    Peer {
        peer_id: Uuid,
        media: MediaSource,
        playback: PlaybackHandle,
        monitor: JoinHandle<()>,
    },
    Fallback(FallbackStream),
}

struct ActiveSession {
    source: Source,
    transport: ActiveTransport,
}

impl ActiveSession {
    fn playback(&self) -> &PlaybackHandle {
        match &self.transport {
            ActiveTransport::Peer { playback, .. } => playback,
            ActiveTransport::Fallback(stream) => stream.playback(),
        }
    }
}

// ============================================================================
// SESSION CONTROLLER
// ============================================================================

#[derive(Clone)]
pub struct SessionController {
    relay: Arc<dyn RelayActivator>,
    negotiator: Negotiator,
    fallback: FallbackTransport,
    pipeline: AudioConditioningPipeline,
    relay_grace: Duration,
    first_frame_timeout: Duration,
    generations: GenerationCounter,
    state: Arc<Mutex<SessionState>>,
    selected: Arc<Mutex<Source>>,
    active: Arc<Mutex<Option<ActiveSession>>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    pub fn new(
        relay: Arc<dyn RelayActivator>,
        negotiator: Negotiator,
        fallback: FallbackTransport,
        pipeline: AudioConditioningPipeline,
        relay_grace: Duration,
        first_frame_timeout: Duration,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        Self {
            relay,
            negotiator,
            fallback,
            pipeline,
            relay_grace,
            first_frame_timeout,
            generations: GenerationCounter::default(),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            selected: Arc::new(Mutex::new(Source::default())),
            active: Arc::new(Mutex::new(None)),
            event_tx,
        }
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    pub fn selected_source(&self) -> Source {
        *self.selected.lock()
    }

    pub fn has_peer_session(&self) -> bool {
        self.negotiator.has_session()
    }

    /// Ist ein Conditioning-Graph mit der Destination verbunden? Zählt auch
    /// eine Session, die noch auf ihren ersten Frame wartet.
    pub fn has_audio_graph(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.playback().has_graph())
            .unwrap_or(false)
    }

    /// Lautstärke des Raw-Pfads der aktiven Session
    pub fn raw_volume(&self) -> Option<f32> {
        self.active.lock().as_ref().map(|s| s.playback().raw_volume())
    }

    pub fn active_filters(&self) -> Vec<FilterSpec> {
        self.active
            .lock()
            .as_ref()
            .map(|s| s.playback().active_filters())
            .unwrap_or_default()
    }

    pub fn pipeline(&self) -> &AudioConditioningPipeline {
        &self.pipeline
    }

    /// Startet eine Session für `source`; eine laufende wird vorher beendet
    pub async fn start(&self, source: Source) -> Result<PlaybackMode, SessionError> {
        self.stop();

        let ticket = self.generations.issue();
        *self.selected.lock() = source;
        self.set_state(SessionState::Connecting { source });
        tracing::info!("Starting {} session (generation {})", source, ticket.generation());

        match self.run(source, &ticket).await {
            Ok(mode) => Ok(mode),
            Err(SessionError::Cancelled) => {
                tracing::debug!("{} session superseded", source);
                Err(SessionError::Cancelled)
            }
            Err(e) => {
                tracing::error!("{} session failed: {}", source, e);
                self.fail(&ticket, e.to_string());
                Err(e)
            }
        }
    }

    /// Beendet die aktuelle Session. Mehrfacher Aufruf ist ein No-op.
    pub fn stop(&self) {
        self.generations.invalidate();

        let session = self.active.lock().take();
        if let Some(session) = session {
            self.release(session);
        }
        self.negotiator.release();

        let changed = {
            let mut state = self.state.lock();
            if *state == SessionState::Idle {
                false
            } else {
                *state = SessionState::Idle;
                true
            }
        };
        if changed {
            tracing::info!("Session stopped");
            let _ = self
                .event_tx
                .send(SessionEvent::StateChanged(SessionState::Idle));
        }
    }

    /// Wählt eine neue Quelle; eine aktive Session wird dabei beendet
    pub async fn switch_source(
        &self,
        source: Source,
        auto_restart: bool,
    ) -> Result<Option<PlaybackMode>, SessionError> {
        if self.state().is_active() {
            self.stop();
        }
        *self.selected.lock() = source;
        tracing::info!("Source switched to {}", source);

        if auto_restart {
            self.start(source).await.map(Some)
        } else {
            Ok(None)
        }
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn run(&self, source: Source, ticket: &SessionTicket) -> Result<PlaybackMode, SessionError> {
        if let Err(e) = self.relay.activate(source).await {
            tracing::warn!("Relay activation for {} failed, continuing: {}", source, e);
        }
        check(ticket)?;

        // Dem Encoder Zeit geben, den Stream zu publizieren
        tokio::time::sleep(self.relay_grace).await;
        check(ticket)?;

        match self.negotiator.negotiate(source, ticket).await {
            Ok(stream) => self.play_negotiated(source, stream, ticket).await,
            Err(NegotiationError::Cancelled) => Err(SessionError::Cancelled),
            Err(negotiation) => {
                tracing::warn!("Negotiation for {} failed: {}", source, negotiation);
                self.play_fallback(source, negotiation, ticket).await
            }
        }
    }

    async fn play_negotiated(
        &self,
        source: Source,
        stream: NegotiatedStream,
        ticket: &SessionTicket,
    ) -> Result<PlaybackMode, SessionError> {
        let NegotiatedStream {
            media,
            events,
            endpoint,
            peer_id,
        } = stream;

        let playback = match self.pipeline.play(&media) {
            Ok(playback) => playback,
            Err(e) => {
                media.close();
                self.negotiator.release_session(peer_id);
                return Err(SessionError::Playback(e.to_string()));
            }
        };

        let conditioned = playback.is_conditioned();
        let monitor = self.spawn_monitor(events, ticket.clone(), peer_id);
        let session = ActiveSession {
            source,
            transport: ActiveTransport::Peer {
                peer_id,
                media: media.clone(),
                playback,
                monitor,
            },
        };

        self.stage(ticket, session)?;
        self.activate(
            ticket,
            &media,
            SessionState::Playing {
                source,
                mode: PlaybackMode::WebRtc,
                conditioned,
            },
        )
        .await?;

        tracing::info!(
            "Playing {} via {} ({})",
            source,
            endpoint,
            if conditioned { "conditioned" } else { "unfiltered" }
        );
        Ok(PlaybackMode::WebRtc)
    }

    async fn play_fallback(
        &self,
        source: Source,
        negotiation: NegotiationError,
        ticket: &SessionTicket,
    ) -> Result<PlaybackMode, SessionError> {
        let stream = match self.fallback.acquire(source, ticket).await {
            Ok(stream) => stream,
            Err(FallbackError::Cancelled) => return Err(SessionError::Cancelled),
            Err(fallback) => {
                return Err(SessionError::FallbackExhausted {
                    negotiation,
                    fallback,
                })
            }
        };

        let media = stream.media().clone();
        let mode = stream.mode();
        let conditioned = stream.is_conditioned();
        let url = stream.url().to_string();
        let session = ActiveSession {
            source,
            transport: ActiveTransport::Fallback(stream),
        };

        self.stage(ticket, session)?;
        self.activate(
            ticket,
            &media,
            SessionState::Playing {
                source,
                mode,
                conditioned,
            },
        )
        .await?;

        tracing::info!("Playing {} via {} fallback from {}", source, mode, url);
        Ok(mode)
    }

    /// Legt die Session vor dem Warten auf den ersten Frame ab, damit `stop`
    /// sie synchron freigeben kann. Bei abgelaufenem Ticket wird sie sofort
    /// freigegeben.
    fn stage(&self, ticket: &SessionTicket, session: ActiveSession) -> Result<(), SessionError> {
        let rejected = {
            let mut active = self.active.lock();
            if ticket.is_live() {
                *active = Some(session);
                None
            } else {
                Some(session)
            }
        };

        match rejected {
            Some(session) => {
                self.release(session);
                Err(SessionError::Cancelled)
            }
            None => Ok(()),
        }
    }

    /// Wartet auf den ersten Frame der abgelegten Session und wechselt dann
    /// nach `state`. Wer das Ticket entwertet hat, hat die Session bereits
    /// aus dem Slot genommen.
    async fn activate(
        &self,
        ticket: &SessionTicket,
        media: &MediaSource,
        state: SessionState,
    ) -> Result<(), SessionError> {
        let delivered = tokio::time::timeout(self.first_frame_timeout, media.wait_first_frame())
            .await
            .unwrap_or(false);

        let session = {
            let mut active = self.active.lock();
            if !ticket.is_live() {
                return Err(SessionError::Cancelled);
            }
            if delivered {
                self.set_state(state);
                return Ok(());
            }
            active.take()
        };

        if let Some(session) = session {
            self.release(session);
        }
        Err(SessionError::NoMedia(self.first_frame_timeout))
    }

    fn release(&self, mut session: ActiveSession) {
        match &mut session.transport {
            ActiveTransport::Peer {
                peer_id,
                media,
                playback,
                monitor,
            } => {
                monitor.abort();
                self.pipeline.release(playback);
                media.close();
                self.negotiator.release_session(*peer_id);
            }
            ActiveTransport::Fallback(stream) => stream.release(&self.pipeline),
        }
        tracing::debug!("{} session released", session.source);
    }

    /// Überwacht die Peer Session; Verbindungsverlust beendet die Session
    fn spawn_monitor(
        &self,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        ticket: SessionTicket,
        peer_id: Uuid,
    ) -> JoinHandle<()> {
        let controller = self.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::StateChanged(state) if state.is_lost() => {
                        tracing::warn!("Peer session {} lost: {:?}", peer_id, state);
                        controller.connection_lost(&ticket);
                        return;
                    }
                    PeerEvent::StateChanged(state) => {
                        tracing::debug!("Peer session {} state: {:?}", peer_id, state)
                    }
                    PeerEvent::Track(_) => {
                        tracing::debug!("Peer session {}: ignoring additional track", peer_id)
                    }
                }
            }
        })
    }

    fn connection_lost(&self, ticket: &SessionTicket) {
        let message = SessionError::ConnectivityLost.to_string();
        let session = {
            let mut active = self.active.lock();
            if !ticket.is_live() {
                return;
            }
            self.generations.invalidate();
            self.set_state(SessionState::Error {
                message: message.clone(),
            });
            active.take()
        };

        if let Some(session) = session {
            self.release(session);
        }
        let _ = self.event_tx.send(SessionEvent::Error(message));
    }

    fn fail(&self, ticket: &SessionTicket, message: String) {
        {
            let _active = self.active.lock();
            if !ticket.is_live() {
                return;
            }
            self.set_state(SessionState::Error {
                message: message.clone(),
            });
        }
        let _ = self.event_tx.send(SessionEvent::Error(message));
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state.clone();
        let _ = self.event_tx.send(SessionEvent::StateChanged(state));
    }
}

fn check(ticket: &SessionTicket) -> Result<(), SessionError> {
    if ticket.is_live() {
        Ok(())
    } else {
        Err(SessionError::Cancelled)
    }
}

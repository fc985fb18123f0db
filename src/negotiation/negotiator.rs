//! Negotiator - WHEP-Verhandlung mit geordneten Endpunkten
//!
//! Ablauf pro Versuch:
//! 1. Peer Session erstellen, Offer setzen
//! 2. kurz auf ICE-Kandidaten warten
//! 3. Offer nacheinander an die Endpunkte schicken, erste gültige Antwort gewinnt
//! 4. Antwort anwenden und auf den ersten Audio-Track warten
//!
//! Es existiert höchstens eine Peer Session; jede neue Verhandlung gibt die
//! alte vorher frei.

use super::exchange::SdpExchange;
use super::peer::{ConnectivityState, PeerEvent, PeerFactory, PeerSession};
use super::sdp::{extract_answer, has_media_line};
use crate::audio::MediaSource;
use crate::session::{SessionTicket, Source, StreamEndpointSet};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} answered with HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Answer from {url} has no audio or video media line")]
    SdpValidation { url: String },

    #[error("Invalid answer: {0}")]
    InvalidAnswer(String),

    #[error("All {attempts} endpoints failed, last error: {last}")]
    Exhausted {
        attempts: usize,
        last: Box<NegotiationError>,
    },

    #[error("Failed to apply remote description: {0}")]
    RemoteDescription(String),

    #[error("No inbound audio track within {0:?}")]
    TrackTimeout(Duration),

    #[error("Peer connection failed before media arrived")]
    ConnectionFailed,

    #[error("Negotiation cancelled")]
    Cancelled,
}

// ============================================================================
// NEGOTIATED STREAM
// ============================================================================

/// Ergebnis einer erfolgreichen Verhandlung
#[derive(Debug)]
pub struct NegotiatedStream {
    pub media: MediaSource,
    /// Weitere Peer-Events (Connectivity) für das Monitoring
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
    pub endpoint: String,
    pub peer_id: Uuid,
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

#[derive(Clone)]
pub struct Negotiator {
    peers: Arc<dyn PeerFactory>,
    exchange: Arc<dyn SdpExchange>,
    stream_url: String,
    ice_gather_wait: Duration,
    track_timeout: Duration,
    current: Arc<Mutex<Option<Arc<dyn PeerSession>>>>,
}

impl Negotiator {
    pub fn new(
        peers: Arc<dyn PeerFactory>,
        exchange: Arc<dyn SdpExchange>,
        stream_url: &str,
        ice_gather_wait: Duration,
        track_timeout: Duration,
    ) -> Self {
        Self {
            peers,
            exchange,
            stream_url: stream_url.to_string(),
            ice_gather_wait,
            track_timeout,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Verhandelt eine Session für `source`
    pub async fn negotiate(
        &self,
        source: Source,
        ticket: &SessionTicket,
    ) -> Result<NegotiatedStream, NegotiationError> {
        self.release();

        let peer = self.peers.create().await?;
        if !ticket.is_live() {
            peer.close();
            return Err(NegotiationError::Cancelled);
        }
        *self.current.lock() = Some(Arc::clone(&peer));

        match self.run(&peer, source, ticket).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                self.release_peer(&peer);
                Err(e)
            }
        }
    }

    /// Gibt die aktuelle Peer Session frei. Mehrfacher Aufruf ist ein No-op.
    pub fn release(&self) {
        if let Some(peer) = self.current.lock().take() {
            peer.close();
        }
    }

    /// Gibt die Session nur frei, wenn sie noch `peer_id` ist
    pub fn release_session(&self, peer_id: Uuid) {
        let peer = {
            let mut slot = self.current.lock();
            if slot.as_ref().is_some_and(|p| p.id() == peer_id) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(peer) = peer {
            peer.close();
        }
    }

    pub fn has_session(&self) -> bool {
        self.current.lock().is_some()
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    async fn run(
        &self,
        peer: &Arc<dyn PeerSession>,
        source: Source,
        ticket: &SessionTicket,
    ) -> Result<NegotiatedStream, NegotiationError> {
        let mut events = peer
            .take_events()
            .ok_or_else(|| NegotiationError::WebRTC("peer events already taken".to_string()))?;

        peer.create_offer().await?;
        ensure_live(ticket)?;

        // Kein Trickle-ICE: kurz warten, damit Kandidaten im Offer landen
        tokio::time::sleep(self.ice_gather_wait).await;
        ensure_live(ticket)?;

        let offer = peer
            .local_description()
            .await
            .ok_or_else(|| NegotiationError::WebRTC("no local description".to_string()))?;

        let endpoints = StreamEndpointSet::from_base(&source.stream_base(&self.stream_url));
        let (endpoint, answer) = self.exchange_offer(&endpoints, &offer, ticket).await?;

        peer.apply_answer(answer).await?;
        ensure_live(ticket)?;

        let media = self.await_track(&mut events).await?;
        ensure_live(ticket)?;

        tracing::info!("Negotiated {} stream via {}", source, endpoint);

        Ok(NegotiatedStream {
            media,
            events,
            endpoint,
            peer_id: peer.id(),
        })
    }

    /// Probiert die Endpunkte strikt nacheinander
    async fn exchange_offer(
        &self,
        endpoints: &StreamEndpointSet,
        offer: &str,
        ticket: &SessionTicket,
    ) -> Result<(String, String), NegotiationError> {
        let mut last = None;
        let mut attempts = 0;

        for url in endpoints.iter() {
            ensure_live(ticket)?;
            attempts += 1;
            tracing::debug!("Posting offer to {}", url);

            let response = match self.exchange.post_offer(url, offer).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::warn!("Endpoint {} failed: {}", url, e);
                    last = Some(e);
                    continue;
                }
            };
            ensure_live(ticket)?;

            if !response.is_success() {
                tracing::warn!("Endpoint {} answered HTTP {}", url, response.status);
                last = Some(NegotiationError::HttpStatus {
                    url: url.to_string(),
                    status: response.status,
                });
                continue;
            }

            let answer = match extract_answer(response.content_type.as_deref(), &response.body) {
                Ok(answer) => answer,
                Err(e) => {
                    tracing::warn!("Endpoint {} returned an unusable answer: {}", url, e);
                    last = Some(e);
                    continue;
                }
            };

            if !has_media_line(&answer) {
                tracing::warn!("Endpoint {} answer has no media line", url);
                last = Some(NegotiationError::SdpValidation {
                    url: url.to_string(),
                });
                continue;
            }

            return Ok((url.to_string(), answer));
        }

        Err(NegotiationError::Exhausted {
            attempts,
            last: Box::new(last.unwrap_or_else(|| {
                NegotiationError::InvalidAnswer("no endpoint candidates".to_string())
            })),
        })
    }

    /// Wartet auf den ersten Audio-Track
    async fn await_track(
        &self,
        events: &mut mpsc::UnboundedReceiver<PeerEvent>,
    ) -> Result<MediaSource, NegotiationError> {
        let wait = async {
            while let Some(event) = events.recv().await {
                match event {
                    PeerEvent::Track(media) => return Ok(media),
                    PeerEvent::StateChanged(
                        ConnectivityState::Failed | ConnectivityState::Closed,
                    ) => return Err(NegotiationError::ConnectionFailed),
                    PeerEvent::StateChanged(state) => {
                        tracing::debug!("Waiting for track, peer state {:?}", state)
                    }
                }
            }
            Err(NegotiationError::ConnectionFailed)
        };

        tokio::time::timeout(self.track_timeout, wait)
            .await
            .unwrap_or(Err(NegotiationError::TrackTimeout(self.track_timeout)))
    }

    fn release_peer(&self, peer: &Arc<dyn PeerSession>) {
        self.release_session(peer.id());
        peer.close();
    }
}

fn ensure_live(ticket: &SessionTicket) -> Result<(), NegotiationError> {
    if ticket.is_live() {
        Ok(())
    } else {
        Err(NegotiationError::Cancelled)
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("stream_url", &self.stream_url)
            .field("has_session", &self.has_session())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExchange, FakePeerBehavior, FakePeerFactory, FakeReply, ANSWER_SDP};

    const STREAM_URL: &str = "http://host:8889";

    fn negotiator(
        peers: &Arc<FakePeerFactory>,
        exchange: &Arc<FakeExchange>,
    ) -> Negotiator {
        Negotiator::new(
            Arc::clone(peers) as Arc<dyn PeerFactory>,
            Arc::clone(exchange) as Arc<dyn SdpExchange>,
            STREAM_URL,
            Duration::from_millis(10),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_skips_failed_and_duplicate_candidates() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Status(404))
                .reply("http://host:8889/vinyl/webrtc", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);

        let stream = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap();

        assert_eq!(stream.endpoint, "http://host:8889/vinyl/webrtc");
        assert_eq!(
            exchange.calls(),
            vec![
                "http://host:8889/vinyl/whep".to_string(),
                "http://host:8889/vinyl/webrtc".to_string(),
            ]
        );
        assert!(negotiator.has_session());
    }

    #[tokio::test]
    async fn test_first_valid_answer_wins() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/cd/whep", FakeReply::Json(ANSWER_SDP.to_string()))
                .reply("http://host:8889/cd/webrtc", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);

        let stream = negotiator
            .negotiate(Source::Cd, &SessionTicket::detached())
            .await
            .unwrap();

        assert_eq!(stream.endpoint, "http://host:8889/cd/whep");
        assert_eq!(exchange.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_media_line_is_skipped() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer("v=0\r\ns=-\r\n".to_string()))
                .reply("http://host:8889/vinyl/webrtc", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);

        let stream = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap();
        assert_eq!(stream.endpoint, "http://host:8889/vinyl/webrtc");
    }

    #[tokio::test]
    async fn test_all_candidates_fail() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::TransportError)
                .reply("http://host:8889/vinyl/webrtc", FakeReply::Status(503)),
        );
        let negotiator = negotiator(&peers, &exchange);

        let err = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap_err();

        match err {
            NegotiationError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, NegotiationError::HttpStatus { status: 503, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!negotiator.has_session());
        assert!(peers.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_remote_description_failure_is_terminal() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior {
            fail_remote: true,
            ..Default::default()
        }));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer(ANSWER_SDP.to_string()))
                .reply("http://host:8889/vinyl/webrtc", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);

        let err = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, NegotiationError::RemoteDescription(_)));
        assert_eq!(exchange.calls().len(), 1);
        assert!(!negotiator.has_session());
    }

    #[tokio::test]
    async fn test_failed_connection_before_track() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior {
            deliver_track: false,
            fail_before_track: true,
            ..Default::default()
        }));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);

        let err = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::ConnectionFailed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_timeout() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior {
            deliver_track: false,
            ..Default::default()
        }));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);

        let err = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::TrackTimeout(_)));
        assert!(!negotiator.has_session());
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);
        negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap();

        negotiator.release();
        negotiator.release();
        assert!(!negotiator.has_session());
        assert!(peers.last().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_release_session_ignores_other_peers() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);
        let stream = negotiator
            .negotiate(Source::Vinyl, &SessionTicket::detached())
            .await
            .unwrap();

        negotiator.release_session(Uuid::new_v4());
        assert!(negotiator.has_session());

        negotiator.release_session(stream.peer_id);
        assert!(!negotiator.has_session());
    }

    #[tokio::test]
    async fn test_new_negotiation_releases_previous_peer() {
        let peers = Arc::new(FakePeerFactory::new(FakePeerBehavior::default()));
        let exchange = Arc::new(
            FakeExchange::new()
                .reply("http://host:8889/vinyl/whep", FakeReply::Answer(ANSWER_SDP.to_string())),
        );
        let negotiator = negotiator(&peers, &exchange);
        let ticket = SessionTicket::detached();

        negotiator.negotiate(Source::Vinyl, &ticket).await.unwrap();
        negotiator.negotiate(Source::Vinyl, &ticket).await.unwrap();

        let created = peers.created();
        assert_eq!(created.len(), 2);
        assert!(created[0].is_closed());
        assert!(!created[1].is_closed());
    }
}

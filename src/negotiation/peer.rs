//! Peer Sessions - Empfangsseitige WebRTC-Verbindung
//!
//! Der Negotiator spricht nur mit den Traits; `WebRtcPeerFactory` ist die
//! Implementierung mit webrtc-rs. Pro Session wird genau ein eingehender
//! Audio-Track angenommen und über Opus in einen `MediaSource` dekodiert.

use super::negotiator::NegotiationError;
use crate::audio::{MediaKind, MediaSource, MediaWriter, OpusDecoder};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// CONNECTIVITY
// ============================================================================

/// Verbindungsstatus einer Peer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    /// Verbindung verloren (beendet eine laufende Wiedergabe)
    pub fn is_lost(self) -> bool {
        matches!(self, ConnectivityState::Failed | ConnectivityState::Disconnected)
    }
}

impl From<RTCPeerConnectionState> for ConnectivityState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => {
                ConnectivityState::New
            }
            RTCPeerConnectionState::Connecting => ConnectivityState::Connecting,
            RTCPeerConnectionState::Connected => ConnectivityState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectivityState::Failed,
            RTCPeerConnectionState::Closed => ConnectivityState::Closed,
        }
    }
}

/// Events einer Peer Session
#[derive(Debug)]
pub enum PeerEvent {
    /// Erster eingehender Audio-Track
    Track(MediaSource),
    StateChanged(ConnectivityState),
}

// ============================================================================
// TRAITS
// ============================================================================

/// Erstellt Peer Sessions
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self) -> Result<Arc<dyn PeerSession>, NegotiationError>;
}

/// Eine empfangende Peer Session (recv-only Audio)
#[async_trait]
pub trait PeerSession: Send + Sync {
    fn id(&self) -> Uuid;

    /// Erstellt das Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<String, NegotiationError>;

    /// Aktuelle Local Description inkl. gesammelter Kandidaten
    async fn local_description(&self) -> Option<String>;

    async fn apply_answer(&self, sdp: String) -> Result<(), NegotiationError>;

    /// Event-Receiver; kann genau einmal abgeholt werden
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>>;

    fn connectivity(&self) -> ConnectivityState;

    /// Schließt die Session; das eigentliche Schließen läuft im Hintergrund.
    /// Mehrfacher Aufruf ist ein No-op.
    fn close(&self);
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

pub struct WebRtcPeerFactory {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_urls: &[String]) -> Self {
        let ice_servers = if ice_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_urls.to_vec(),
                ..Default::default()
            }]
        };
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        let peer = WebRtcPeer::connect(self.ice_servers.clone()).await?;
        Ok(Arc::new(peer))
    }
}

pub struct WebRtcPeer {
    id: Uuid,
    pc: Arc<RTCPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    connectivity: Arc<Mutex<ConnectivityState>>,
    readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    /// Erstellt die Peer Connection mit einem recv-only Audio-Transceiver
    async fn connect(ice_servers: Vec<RTCIceServer>) -> Result<Self, NegotiationError> {
        // Media Engine mit Default-Codecs (Opus)
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| NegotiationError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| NegotiationError::WebRTC(e.to_string()))?,
        );

        pc.add_transceiver_from_kind(
            RTPCodecType::Audio,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .map_err(|e| NegotiationError::WebRTC(e.to_string()))?;

        let id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connectivity = Arc::new(Mutex::new(ConnectivityState::New));
        let readers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        Self::setup_handlers(&pc, id, event_tx, Arc::clone(&connectivity), Arc::clone(&readers));

        tracing::debug!("Peer session {} created", id);

        Ok(Self {
            id,
            pc,
            events: Mutex::new(Some(event_rx)),
            connectivity,
            readers,
            closed: AtomicBool::new(false),
        })
    }

    /// Registriert Event Handler für die Peer Connection
    fn setup_handlers(
        pc: &Arc<RTCPeerConnection>,
        id: Uuid,
        event_tx: mpsc::UnboundedSender<PeerEvent>,
        connectivity: Arc<Mutex<ConnectivityState>>,
        readers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        // Connection State Handler
        let state_tx = event_tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = ConnectivityState::from(s);
            tracing::info!("Peer session {} state: {:?}", id, state);
            *connectivity.lock() = state;
            let _ = state_tx.send(PeerEvent::StateChanged(state));
            Box::pin(async {})
        }));

        // Track Handler, nur der erste Audio-Track zählt
        let track_taken = Arc::new(AtomicBool::new(false));
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let event_tx = event_tx.clone();
            let track_taken = Arc::clone(&track_taken);
            let readers = Arc::clone(&readers);

            Box::pin(async move {
                if track.kind() != RTPCodecType::Audio {
                    tracing::debug!("Peer session {}: ignoring {:?} track", id, track.kind());
                    return;
                }
                if track_taken.swap(true, Ordering::SeqCst) {
                    tracing::warn!("Peer session {}: ignoring additional audio track", id);
                    return;
                }

                let codec = track.codec();
                tracing::info!(
                    "Peer session {}: inbound audio track {} @ {} Hz",
                    id,
                    codec.capability.mime_type,
                    codec.capability.clock_rate
                );

                let channels = codec.capability.channels.clamp(1, 2) as usize;
                let (media, writer) = MediaSource::new(MediaKind::PeerTrack);
                readers
                    .lock()
                    .push(tokio::spawn(read_opus_track(track, writer, channels)));
                let _ = event_tx.send(PeerEvent::Track(media));
            })
        }));
    }
}

/// Liest RTP-Pakete und dekodiert sie in den Feed
async fn read_opus_track(track: Arc<TrackRemote>, writer: MediaWriter, channels: usize) {
    let mut decoder = match OpusDecoder::new(channels) {
        Ok(decoder) => decoder,
        Err(e) => {
            tracing::error!("Failed to create opus decoder: {}", e);
            writer.finish();
            return;
        }
    };

    loop {
        match track.read_rtp().await {
            Ok((packet, _attributes)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                match decoder.decode(&packet.payload) {
                    Ok(samples) => {
                        if !writer.push(&samples) {
                            tracing::debug!("Track feed closed by consumer");
                            break;
                        }
                    }
                    Err(e) => tracing::debug!("Dropping undecodable opus packet: {}", e),
                }
            }
            Err(e) => {
                tracing::debug!("Track read ended: {}", e);
                break;
            }
        }
    }

    writer.finish();
}

#[async_trait]
impl PeerSession for WebRtcPeer {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| NegotiationError::WebRTC(e.to_string()))?;

        Ok(offer.sdp)
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|d| d.sdp)
    }

    async fn apply_answer(&self, sdp: String) -> Result<(), NegotiationError> {
        let answer = RTCSessionDescription::answer(sdp)
            .map_err(|e| NegotiationError::RemoteDescription(e.to_string()))?;

        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| NegotiationError::RemoteDescription(e.to_string()))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().take()
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.lock()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        *self.connectivity.lock() = ConnectivityState::Closed;

        let pc = Arc::clone(&self.pc);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pc.close().await {
                        tracing::warn!("Peer session {} close failed: {}", id, e);
                    }
                });
            }
            Err(_) => tracing::warn!("Peer session {} closed outside a runtime", id),
        }
        tracing::debug!("Peer session {} released", id);
    }
}

impl std::fmt::Debug for WebRtcPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcPeer")
            .field("id", &self.id)
            .field("connectivity", &self.connectivity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::sdp::{direction_of, media_kinds};

    #[test]
    fn test_connectivity_mapping() {
        assert_eq!(
            ConnectivityState::from(RTCPeerConnectionState::Failed),
            ConnectivityState::Failed
        );
        assert!(ConnectivityState::Disconnected.is_lost());
        assert!(ConnectivityState::Failed.is_lost());
        assert!(!ConnectivityState::Closed.is_lost());
        assert!(!ConnectivityState::Connecting.is_lost());
    }

    #[tokio::test]
    async fn test_offer_is_single_recvonly_audio() {
        let factory = WebRtcPeerFactory::new(&[]);
        let peer = factory.create().await.unwrap();

        let offer = peer.create_offer().await.unwrap();
        assert_eq!(media_kinds(&offer), vec!["audio"]);
        assert_eq!(direction_of(&offer, "audio"), Some("recvonly"));
        assert!(peer.take_events().is_some());
        assert!(peer.take_events().is_none());

        peer.close();
        peer.close();
        assert_eq!(peer.connectivity(), ConnectivityState::Closed);
    }
}

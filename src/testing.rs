//! Test-Doubles für Relay, SDP-Austausch, Peer Sessions und HTTP-Abruf

use crate::audio::{MediaKind, MediaSource, MediaWriter};
use crate::fallback::{FallbackError, MediaFetcher};
use crate::negotiation::{
    ConnectivityState, NegotiationError, PeerEvent, PeerFactory, PeerSession, SdpExchange,
    SdpResponse,
};
use crate::relay::{ActivationResponse, ActivationStatus, RelayActivator, RelayError};
use crate::session::Source;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

pub(crate) const ANSWER_SDP: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=sendonly\r\n";

const OFFER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=recvonly\r\n";

/// Minimale 16-bit PCM WAV-Datei
pub(crate) fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;
    let mut out = Vec::with_capacity(44 + samples.len() * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVEfmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&(sample_rate * channels as u32 * 2).to_le_bytes());
    out.extend_from_slice(&(channels * 2).to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

// ============================================================================
// RELAY
// ============================================================================

#[derive(Default)]
pub(crate) struct FakeRelay {
    calls: Mutex<Vec<Source>>,
    fail: bool,
}

impl FakeRelay {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<Source> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RelayActivator for FakeRelay {
    async fn activate(&self, source: Source) -> Result<ActivationResponse, RelayError> {
        self.calls.lock().push(source);
        if self.fail {
            return Err(RelayError::Request("connection refused".to_string()));
        }
        Ok(ActivationResponse {
            status: ActivationStatus::Started,
            message: Some(format!("{} stream started", source)),
            pid: Some(4242),
        })
    }
}

// ============================================================================
// SDP EXCHANGE
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) enum FakeReply {
    /// 200 mit `application/sdp`
    Answer(String),
    /// 200 mit `{"sdp": ...}`
    Json(String),
    Status(u16),
    TransportError,
}

/// Antwortet pro URL; unbekannte URLs liefern 404
#[derive(Default)]
pub(crate) struct FakeExchange {
    replies: Mutex<HashMap<String, FakeReply>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl FakeExchange {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply(self, url: &str, reply: FakeReply) -> Self {
        self.replies.lock().insert(url.to_string(), reply);
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SdpExchange for FakeExchange {
    async fn post_offer(&self, url: &str, _offer_sdp: &str) -> Result<SdpResponse, NegotiationError> {
        self.calls.lock().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .replies
            .lock()
            .get(url)
            .cloned()
            .unwrap_or(FakeReply::Status(404));

        match reply {
            FakeReply::Answer(sdp) => Ok(SdpResponse {
                status: 201,
                content_type: Some("application/sdp".to_string()),
                body: sdp,
            }),
            FakeReply::Json(sdp) => Ok(SdpResponse {
                status: 200,
                content_type: Some("application/json".to_string()),
                body: serde_json::json!({ "type": "answer", "sdp": sdp }).to_string(),
            }),
            FakeReply::Status(status) => Ok(SdpResponse {
                status,
                content_type: Some("text/plain".to_string()),
                body: "not found".to_string(),
            }),
            FakeReply::TransportError => Err(NegotiationError::Transport {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            }),
        }
    }
}

// ============================================================================
// PEER SESSIONS
// ============================================================================

#[derive(Debug, Clone)]
pub(crate) struct FakePeerBehavior {
    /// Track nach dem Answer liefern
    pub deliver_track: bool,
    /// Track liefert nie einen Frame
    pub silent_track: bool,
    pub fail_remote: bool,
    pub fail_before_track: bool,
}

impl Default for FakePeerBehavior {
    fn default() -> Self {
        Self {
            deliver_track: true,
            silent_track: false,
            fail_remote: false,
            fail_before_track: false,
        }
    }
}

pub(crate) struct FakePeer {
    id: Uuid,
    behavior: FakePeerBehavior,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    writer: Mutex<Option<MediaWriter>>,
    local: Mutex<Option<String>>,
    connectivity: Mutex<ConnectivityState>,
    closed: AtomicBool,
}

impl FakePeer {
    fn new(behavior: FakePeerBehavior) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: Uuid::new_v4(),
            behavior,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            writer: Mutex::new(None),
            local: Mutex::new(None),
            connectivity: Mutex::new(ConnectivityState::New),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simuliert einen Verbindungswechsel
    pub(crate) fn emit(&self, state: ConnectivityState) {
        *self.connectivity.lock() = state;
        let _ = self.events_tx.send(PeerEvent::StateChanged(state));
    }

    /// Schreibt Samples in den Track
    pub(crate) fn push_audio(&self, samples: &[f32]) -> bool {
        self.writer
            .lock()
            .as_ref()
            .map(|writer| writer.push(samples))
            .unwrap_or(false)
    }
}

#[async_trait]
impl PeerSession for FakePeer {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn create_offer(&self) -> Result<String, NegotiationError> {
        *self.local.lock() = Some(OFFER_SDP.to_string());
        Ok(OFFER_SDP.to_string())
    }

    async fn local_description(&self) -> Option<String> {
        self.local.lock().clone()
    }

    async fn apply_answer(&self, _sdp: String) -> Result<(), NegotiationError> {
        if self.behavior.fail_remote {
            return Err(NegotiationError::RemoteDescription(
                "answer does not match offer".to_string(),
            ));
        }
        self.emit(ConnectivityState::Connecting);

        if self.behavior.deliver_track {
            let (media, writer) = MediaSource::new(MediaKind::PeerTrack);
            if !self.behavior.silent_track {
                writer.push(&[0.0; 960 * 2]);
            }
            *self.writer.lock() = Some(writer);
            let _ = self.events_tx.send(PeerEvent::Track(media));
            self.emit(ConnectivityState::Connected);
        }
        if self.behavior.fail_before_track {
            self.emit(ConnectivityState::Failed);
        }
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events_rx.lock().take()
    }

    fn connectivity(&self) -> ConnectivityState {
        *self.connectivity.lock()
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.connectivity.lock() = ConnectivityState::Closed;
        self.writer.lock().take();
    }
}

pub(crate) struct FakePeerFactory {
    behavior: FakePeerBehavior,
    created: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub(crate) fn new(behavior: FakePeerBehavior) -> Self {
        Self {
            behavior,
            created: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn created(&self) -> Vec<Arc<FakePeer>> {
        self.created.lock().clone()
    }

    pub(crate) fn last(&self) -> Option<Arc<FakePeer>> {
        self.created.lock().last().cloned()
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(&self) -> Result<Arc<dyn PeerSession>, NegotiationError> {
        let peer = Arc::new(FakePeer::new(self.behavior.clone()));
        self.created.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

// ============================================================================
// FETCHER
// ============================================================================

/// Liefert registrierte Ressourcen; alles andere ist 404
#[derive(Default)]
pub(crate) struct FakeFetcher {
    resources: Mutex<HashMap<String, Vec<u8>>>,
    streams: Mutex<HashMap<String, Vec<Vec<u8>>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeFetcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resource(self, url: &str, bytes: Vec<u8>) -> Self {
        self.set_resource(url, bytes);
        self
    }

    pub(crate) fn set_resource(&self, url: &str, bytes: Vec<u8>) {
        self.resources.lock().insert(url.to_string(), bytes);
    }

    pub(crate) fn stream(self, url: &str, chunks: Vec<Vec<u8>>) -> Self {
        self.streams.lock().insert(url.to_string(), chunks);
        self
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    fn not_found(url: &Url) -> FallbackError {
        FallbackError::HttpStatus {
            url: url.to_string(),
            status: 404,
        }
    }
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FallbackError> {
        self.requests.lock().push(url.to_string());
        self.resources
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| Self::not_found(url))
    }

    async fn open_stream(&self, url: &Url) -> Result<mpsc::Receiver<Vec<u8>>, FallbackError> {
        self.requests.lock().push(url.to_string());
        let chunks = self
            .streams
            .lock()
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| Self::not_found(url))?;

        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            let _ = tx.try_send(chunk);
        }
        Ok(rx)
    }
}

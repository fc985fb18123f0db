//! Negotiation Module - WHEP-Verhandlung mit dem Media-Server
//!
//! Verwaltet:
//! - Die empfangende Peer Session (webrtc-rs)
//! - Offer/Answer über HTTP an geordnete Endpunkte
//! - Das Warten auf den eingehenden Audio-Track

mod exchange;
mod negotiator;
mod peer;
pub mod sdp;

pub use exchange::{HttpSdpExchange, SdpExchange, SdpResponse};
pub use negotiator::{NegotiatedStream, NegotiationError, Negotiator};
pub use peer::{
    ConnectivityState, PeerEvent, PeerFactory, PeerSession, WebRtcPeer, WebRtcPeerFactory,
};

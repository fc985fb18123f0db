//! Session-Status und Events

use super::source::Source;
use serde::Serialize;
use std::fmt;

/// Transport, über den das Audio tatsächlich läuft
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    /// WHEP-Session, konditioniert
    WebRtc,
    /// HLS-Segmente, konditioniert
    Segmented,
    /// Progressiver Direkt-Stream, ungefiltert
    Direct,
}

impl fmt::Display for PlaybackMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PlaybackMode::WebRtc => "webrtc",
            PlaybackMode::Segmented => "segmented",
            PlaybackMode::Direct => "direct",
        })
    }
}

/// Aktueller Status einer Session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Keine Session aktiv
    Idle,
    /// Aktivierung und Verhandlung laufen
    Connecting { source: Source },
    /// Audio läuft; `conditioned` = über die Filterkaskade
    Playing {
        source: Source,
        mode: PlaybackMode,
        conditioned: bool,
    },
    /// Session beendet mit Fehler
    Error { message: String },
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting { .. } | SessionState::Playing { .. }
        )
    }
}

/// Events die vom SessionController ausgelöst werden
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    Error(String),
}

//! Session Module - Steuerung einer Wiedergabe-Session
//!
//! Verwaltet:
//! - Quellenauswahl und Stream-Endpunkte
//! - Session-Status und Events
//! - Generationen-Tickets gegen verspätete Abschlüsse

mod controller;
mod source;
mod state;
mod ticket;

pub use controller::{SessionController, SessionError};
pub use source::{Source, StreamEndpointSet};
pub use state::{PlaybackMode, SessionEvent, SessionState};
pub use ticket::SessionTicket;

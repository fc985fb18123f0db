//! Relay Module - Aktivierung der Streams auf dem Relay
//!
//! - `POST /start_vinyl`, `POST /start_cd`
//! - `GET /health`

mod client;
mod messages;

pub use client::{parse_activation, RelayActivator, RelayClient, RelayError};
pub use messages::{ActivationResponse, ActivationStatus, HealthResponse};

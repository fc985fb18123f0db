//! HTTP-Transport für Offer/Answer (WHEP-Stil)

use super::negotiator::NegotiationError;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::time::Duration;

/// Rohantwort eines Endpunkts
#[derive(Debug, Clone)]
pub struct SdpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl SdpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Schickt ein Offer an einen Endpunkt
#[async_trait]
pub trait SdpExchange: Send + Sync {
    async fn post_offer(&self, url: &str, offer_sdp: &str) -> Result<SdpResponse, NegotiationError>;
}

pub struct HttpSdpExchange {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpSdpExchange {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }
}

#[async_trait]
impl SdpExchange for HttpSdpExchange {
    async fn post_offer(&self, url: &str, offer_sdp: &str) -> Result<SdpResponse, NegotiationError> {
        let transport = |e: reqwest::Error| NegotiationError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .http
            .post(url)
            .header(CONTENT_TYPE, "application/sdp")
            .header(ACCEPT, "application/sdp")
            .timeout(self.timeout)
            .body(offer_sdp.to_string())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(transport)?;

        Ok(SdpResponse {
            status,
            content_type,
            body,
        })
    }
}

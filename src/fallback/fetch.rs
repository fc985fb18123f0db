//! HTTP-Abruf für Playlists, Segmente und den Direkt-Stream

use super::transport::FallbackError;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

/// Puffer zwischen HTTP-Body und Decoder (Anzahl Chunks)
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Lädt eine Ressource vollständig
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FallbackError>;

    /// Öffnet einen progressiven Download; die Chunks kommen über den Kanal
    /// bis der Body endet oder der Empfänger verworfen wird.
    async fn open_stream(&self, url: &Url) -> Result<mpsc::Receiver<Vec<u8>>, FallbackError>;

    async fn fetch_text(&self, url: &Url) -> Result<String, FallbackError> {
        let bytes = self.fetch(url).await?;
        String::from_utf8(bytes).map_err(|e| FallbackError::Fetch {
            url: url.to_string(),
            reason: format!("body is not UTF-8: {}", e),
        })
    }
}

pub struct HttpFetcher {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(http: reqwest::Client, timeout: Duration) -> Self {
        Self { http, timeout }
    }

    async fn get(&self, url: &Url, timeout: Option<Duration>) -> Result<reqwest::Response, FallbackError> {
        let mut request = self.http.get(url.clone());
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(|e| FallbackError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FallbackError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl MediaFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FallbackError> {
        let response = self.get(url, Some(self.timeout)).await?;
        let bytes = response.bytes().await.map_err(|e| FallbackError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }

    async fn open_stream(&self, url: &Url) -> Result<mpsc::Receiver<Vec<u8>>, FallbackError> {
        // Kein Gesamt-Timeout: der Body läuft so lange wie der Stream
        let response = self.get(url, None).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let url = url.to_string();

        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(chunk) => {
                        if tx.send(chunk.to_vec()).await.is_err() {
                            tracing::debug!("Direct stream {} no longer consumed", url);
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Direct stream {} interrupted: {}", url, e);
                        return;
                    }
                }
            }
            tracing::info!("Direct stream {} ended", url);
        });

        Ok(rx)
    }
}

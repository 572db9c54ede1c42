//! Client for the audio-URL resolution sidecar.
//!
//! The sidecar turns an opaque track id into a short-lived direct media
//! URL. Resolved URLs expire within minutes, so they are fetched per
//! request and never cached across tracks.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// The sidecar needs time to talk to the upstream catalog.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("track unavailable: {0}")]
    Unavailable(String),
    #[error("resolver timed out")]
    Timeout,
    #[error("resolver request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A playable upstream URL and what we know about it.
#[derive(Debug, Clone)]
pub struct ResolvedAudio {
    pub url: String,
    pub content_type: String,
    pub duration_secs: Option<f64>,
    pub bitrate: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractResponse {
    success: bool,
    audio_url: Option<String>,
    content_type: Option<String>,
    duration: Option<f64>,
    bitrate: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

#[derive(Clone)]
pub struct AudioResolver {
    http: reqwest::Client,
    base_url: String,
}

impl AudioResolver {
    pub fn new(base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn resolve(&self, track_id: &str) -> Result<ResolvedAudio, ResolverError> {
        let url = format!("{}/extract/{}", self.base_url, track_id);
        let response = self
            .http
            .get(&url)
            .timeout(RESOLVE_TIMEOUT)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ResolverError::Timeout
                } else {
                    ResolverError::Http(e)
                }
            })?;

        let body: ExtractResponse = response.json().await?;
        if !body.success {
            return Err(ResolverError::Unavailable(
                body.error.unwrap_or_else(|| "unknown".into()),
            ));
        }
        let audio_url = body
            .audio_url
            .ok_or_else(|| ResolverError::Unavailable("no audio url in response".into()))?;

        Ok(ResolvedAudio {
            url: audio_url,
            content_type: body
                .content_type
                .unwrap_or_else(|| "application/octet-stream".into()),
            duration_secs: body.duration,
            bitrate: body.bitrate,
        })
    }

    /// Shared HTTP client, reused by the stream proxy for upstream
    /// fetches so connection pools are shared.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Probe for the admin health endpoint.
    pub async fn health(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).timeout(HEALTH_TIMEOUT).send().await {
            Ok(response) => response
                .json::<HealthResponse>()
                .await
                .map(|h| h.status == "healthy")
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

//! HTTP embedding producer backend.
//!
//! Talks to an external embedding service that clones a repository at a
//! commit and returns one vector per file. The service is slow and
//! failure-prone, so errors are split into transient (retry) and permanent
//! (do not retry) classes for the job scheduler.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use gitvec_core::{EmbeddedFile, EmbeddingProducer, Error, Result};

/// Default producer service endpoint.
pub const DEFAULT_PRODUCER_URL: &str = "http://localhost:8811";

/// Timeout for a whole embed run (seconds). Cloning and embedding a large
/// repository can legitimately take minutes.
pub const PRODUCER_TIMEOUT_SECS: u64 = gitvec_core::defaults::PRODUCER_TIMEOUT_SECS;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    repository_url: &'a str,
    commit_id: &'a str,
    branch: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    files: Vec<EmbeddedFile>,
}

/// Embedding producer backed by an HTTP embedding service.
pub struct HttpEmbeddingProducer {
    client: Client,
    base_url: String,
}

impl HttpEmbeddingProducer {
    /// Create a producer for the given service URL.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let timeout = std::env::var("GITVEC_PRODUCER_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(PRODUCER_TIMEOUT_SECS);

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into();
        info!(
            subsystem = "producer",
            url = %base_url,
            timeout_secs = timeout,
            "initializing HTTP embedding producer"
        );

        Ok(Self { client, base_url })
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("GITVEC_PRODUCER_URL")
            .unwrap_or_else(|_| DEFAULT_PRODUCER_URL.to_string());
        Self::new(base_url)
    }

    fn classify_transport_error(e: reqwest::Error) -> Error {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            Error::ProducerTransient(e.to_string())
        } else {
            Error::ProducerPermanent(e.to_string())
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> Error {
        // 5xx and 429 are the service having a bad time; everything else in
        // the 4xx range means this repository/commit will never embed.
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Error::ProducerTransient(format!("producer returned {status}: {body}"))
        } else {
            Error::ProducerPermanent(format!("producer returned {status}: {body}"))
        }
    }
}

#[async_trait]
impl EmbeddingProducer for HttpEmbeddingProducer {
    async fn embed_repository(
        &self,
        repository_url: &str,
        commit_id: &str,
        branch: &str,
    ) -> Result<Vec<EmbeddedFile>> {
        let start = Instant::now();
        let url = format!("{}/embed", self.base_url);

        debug!(
            subsystem = "producer",
            repository_url,
            commit_id,
            branch,
            "requesting repository embedding"
        );

        let response = self
            .client
            .post(&url)
            .json(&EmbedRequest {
                repository_url,
                commit_id,
                branch,
            })
            .send()
            .await
            .map_err(Self::classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                subsystem = "producer",
                repository_url,
                status = %status,
                "embedding request failed"
            );
            return Err(Self::classify_status(status, &body));
        }

        // A success status with an undecodable body is a service contract
        // violation, not a flake.
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::ProducerPermanent(format!("malformed producer response: {e}")))?;

        info!(
            subsystem = "producer",
            repository_url,
            commit_id,
            record_count = parsed.files.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "repository embedded"
        );

        Ok(parsed.files)
    }
}

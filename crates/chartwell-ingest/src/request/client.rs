//! Executes request envelopes with per-attempt timeouts and immediate retries

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::envelope::RequestEnvelope;
use crate::error::{IngestError, Result};

/// Header carrying the envelope's correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Body and status of a completed call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// Why a single attempt did not produce a usable response
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("timed out after {0} ms")]
    Timeout(u128),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

/// Performs exactly one attempt of an envelope
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: &RequestEnvelope) -> std::result::Result<Response, AttemptError>;
}

/// `reqwest`-backed transport
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("chartwell-ingest/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IngestError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: &RequestEnvelope) -> std::result::Result<Response, AttemptError> {
        let mut request = self
            .client
            .request(envelope.method().into(), envelope.endpoint())
            .timeout(envelope.timeout())
            .header(REQUEST_ID_HEADER, envelope.request_id());

        if !envelope.params().is_empty() {
            request = request.query(envelope.params());
        }

        for (name, value) in envelope.headers() {
            request = request.header(name.as_str(), value.as_str());
        }

        if let Some(body) = envelope.body() {
            request = request.body(body.to_string());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AttemptError::Timeout(envelope.timeout().as_millis())
            } else {
                AttemptError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AttemptError::Transport(e.to_string()))?;

        Ok(Response { status, body })
    }
}

/// Retry loop around a [`Transport`]
///
/// An envelope with `max_retries = N` gets at most `N + 1` attempts. Each
/// attempt is bounded by the envelope timeout; timeouts, transport errors and
/// non-2xx statuses all consume one attempt. There is no backoff between
/// attempts.
#[derive(Clone)]
pub struct RequestClient {
    transport: Arc<dyn Transport>,
}

impl RequestClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Client over the default HTTP transport
    pub fn http() -> Result<Self> {
        Ok(Self::new(Arc::new(HttpTransport::new()?)))
    }

    pub async fn execute(&self, envelope: &RequestEnvelope) -> Result<Response> {
        let total = envelope.total_attempts();
        let mut last_error: Option<AttemptError> = None;

        for attempt in 1..=total {
            debug!(
                request_id = %envelope.request_id(),
                method = envelope.method().as_str(),
                endpoint = %envelope.endpoint(),
                attempt,
                total,
                "Sending request"
            );

            let outcome =
                match tokio::time::timeout(envelope.timeout(), self.transport.send(envelope)).await {
                    Ok(Ok(response)) if response.is_success() => return Ok(response),
                    Ok(Ok(response)) => AttemptError::Status {
                        status: response.status,
                        body: response.body,
                    },
                    Ok(Err(e)) => e,
                    Err(_) => AttemptError::Timeout(envelope.timeout().as_millis()),
                };

            warn!(
                request_id = %envelope.request_id(),
                endpoint = %envelope.endpoint(),
                attempt,
                total,
                error = %outcome,
                "Request attempt failed"
            );
            last_error = Some(outcome);
        }

        Err(IngestError::RequestFailed {
            request_id: envelope.request_id().to_string(),
            endpoint: envelope.endpoint().to_string(),
            attempts: total,
            cause: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempt was made".to_string()),
        })
    }

    /// Execute and decode a JSON response body
    pub async fn execute_json<T: DeserializeOwned>(&self, envelope: &RequestEnvelope) -> Result<T> {
        self.execute(envelope).await?.json()
    }
}

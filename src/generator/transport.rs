use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Fetches are bounded by one wall-clock timeout; there is no per-chunk limit.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_REDIRECTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub bearer_token: String,
    pub body: String,
}

/// A completed exchange. Non-2xx statuses are still responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection could not be opened or the body could not be read.
    #[error("connection failed (status {status}): {reason}")]
    Connection { status: u16, reason: String },
}

/// One blocking POST. Called from background threads only.
pub trait Transport: Send + Sync + 'static {
    fn post_json(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError>;
}

pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration, max_redirects: u32) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .redirects(max_redirects)
            .build();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT, DEFAULT_MAX_REDIRECTS)
    }
}

impl Transport for UreqTransport {
    fn post_json(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        debug!(url = %request.url, bytes = request.body.len(), "POST");

        let result = self
            .agent
            .post(&request.url)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", request.bearer_token))
            .send_string(&request.body);

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(ureq::Error::Transport(transport)) => {
                return Err(TransportError::Connection {
                    status: 0,
                    reason: transport.to_string(),
                });
            }
        };

        let status = response.status();
        let body = response
            .into_string()
            .map_err(|e| TransportError::Connection {
                status,
                reason: e.to_string(),
            })?;

        Ok(HttpResponse { status, body })
    }
}

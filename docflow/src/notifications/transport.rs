//! Outbound webhook transport.

use async_trait::async_trait;
use thiserror::Error;

/// One signed POST to a campaign endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRequest {
    /// Target URL.
    pub url: String,
    /// Extra headers (signature, event, delivery id, attempt).
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Vec<u8>,
}

impl WebhookRequest {
    /// Returns the value of a header, matched case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the endpoint answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WebhookResponse {
    /// HTTP status code.
    pub status: u16,
}

impl WebhookResponse {
    /// Returns true for 2xx answers.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Why a request never got an answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request exceeded its timeout.
    #[error("request timed out")]
    Timeout,
    /// The endpoint could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Sends webhook requests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    /// Sends one request and returns the response status.
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError>;
}

/// [`WebhookTransport`] over `reqwest`.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpTransport {
    /// Builds a client with the configured timeout and user agent.
    ///
    /// # Errors
    ///
    /// [`DocflowError::Config`](crate::errors::DocflowError::Config) if the
    /// client cannot be built.
    pub fn new(config: &crate::config::NotificationConfig) -> Result<Self, crate::errors::DocflowError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|err| crate::errors::DocflowError::Config(format!("failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(&self, request: &WebhookRequest) -> Result<WebhookResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout
            } else if err.is_builder() {
                TransportError::InvalidRequest(err.to_string())
            } else {
                TransportError::Connection(err.to_string())
            }
        })?;
        Ok(WebhookResponse {
            status: response.status().as_u16(),
        })
    }
}

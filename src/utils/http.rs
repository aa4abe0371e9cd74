//! HTTP client utilities shared by the provider adapters.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::sources::SourceError;

/// Shared HTTP client with sensible defaults
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Arc<Client>,
}

impl HttpClient {
    /// Create a client with the crate user agent
    pub fn new(timeout: Duration) -> Self {
        Self::with_user_agent(
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
            timeout,
        )
    }

    /// Create a client identifying a contact address, as polite-pool APIs
    /// (OpenAlex, Crossref) ask for.
    pub fn with_mailto(mailto: Option<&str>, timeout: Duration) -> Self {
        match mailto {
            Some(mailto) => Self::with_user_agent(
                &format!(
                    "{}/{} (mailto:{})",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                    mailto
                ),
                timeout,
            ),
            None => Self::new(timeout),
        }
    }

    /// Create a client with a custom user agent
    pub fn with_user_agent(user_agent: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            });

        Self {
            client: Arc::new(client),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Send a request and map non-success statuses to [`SourceError`]
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, SourceError> {
        let response = request.send().await?;
        check_status(response)
    }

    /// Send a request and decode a JSON body
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, SourceError> {
        let body = self.send(request).await?.text().await?;
        serde_json::from_str(&body).map_err(SourceError::from)
    }

    /// Send a request and return the body as text
    pub async fn get_text(&self, request: RequestBuilder) -> Result<String, SourceError> {
        Ok(self.send(request).await?.text().await?)
    }
}

/// Map an HTTP status to the provider error taxonomy.
///
/// 429 becomes `RateLimited` carrying `Retry-After`, 401/403 `AuthFailure`,
/// 5xx and 408 `Transient`, any other 4xx `Malformed`.
pub fn check_status(response: Response) -> Result<Response, SourceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(status, response.headers()))
}

pub(crate) fn status_error(status: StatusCode, headers: &HeaderMap) -> SourceError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => SourceError::RateLimited {
            retry_after: retry_after(headers),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            SourceError::AuthFailure(format!("HTTP {}", status))
        }
        StatusCode::REQUEST_TIMEOUT => SourceError::Transient(format!("HTTP {}", status)),
        s if s.is_server_error() => SourceError::Transient(format!("HTTP {}", status)),
        _ => SourceError::Malformed(format!("unexpected HTTP {}", status)),
    }
}

/// `Retry-After` in delta-seconds form
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

//! Provider adapters with an extensible trait-based architecture.
//!
//! Every bibliographic provider implements the [`Source`] trait. An adapter
//! translates a [`Query`] into the provider's own query syntax, fetches one page
//! of raw results at a time, and maps each raw row into a canonical
//! [`Document`]. The orchestrator drives pagination through opaque
//! [`ContinuationToken`]s and never looks inside them.
//!
//! # Pagination modes
//!
//! | Provider | Mode | Token content |
//! |---|---|---|
//! | OpenAlex | cursor | `meta.next_cursor` |
//! | Crossref | cursor | `message.next-cursor` |
//! | Semantic Scholar | bulk token | `token` of the bulk search endpoint |
//! | arXiv | offset | start index |
//! | PubMed | session history | `WebEnv`, `query_key` and `retstart` |
//!
//! # Adding a provider
//!
//! 1. Create a struct that implements `Source`
//! 2. Give it a `with_base_url` constructor so it can be exercised against a mock server
//! 3. Register it in [`SourceRegistry::from_config`]

mod arxiv;
mod crossref;
pub mod mock;
mod openalex;
mod pubmed;
mod registry;
mod semantic;

pub use arxiv::ArxivSource;
pub use crossref::CrossrefSource;
pub use mock::MockSource;
pub use openalex::OpenAlexSource;
pub use pubmed::PubMedSource;
pub use registry::{ProviderEntry, RegistryError, SourceRegistry, KNOWN_PROVIDERS};
pub use semantic::SemanticScholarSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{Document, Query};
use crate::normalize::NormalizationError;
use crate::utils::RateLimitError;

/// How a provider pages through results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationMode {
    Cursor,
    Offset,
    BulkToken,
    SessionHistory,
}

/// Opaque pagination state; only the adapter that issued it interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn from_offset(offset: usize) -> Self {
        Self(offset.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Read the token as an offset, for offset-paginated providers
    pub fn offset(&self) -> Result<usize, SourceError> {
        self.0
            .parse()
            .map_err(|_| SourceError::Malformed(format!("not an offset token: {}", self.0)))
    }
}

/// One provider-specific result row, consumed by [`Source::normalize`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub provider: String,
    pub payload: serde_json::Value,
}

impl RawRecord {
    pub fn new(provider: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            provider: provider.into(),
            payload,
        }
    }
}

/// One page of raw results
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<RawRecord>,
    pub next: Option<ContinuationToken>,
    pub has_more: bool,
}

impl Page {
    /// A page with a follow-up token
    pub fn more(records: Vec<RawRecord>, next: ContinuationToken) -> Self {
        Self {
            records,
            next: Some(next),
            has_more: true,
        }
    }

    /// The final page
    pub fn last(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            next: None,
            has_more: false,
        }
    }

    /// Whether fetching should stop after this page
    pub fn is_exhausted(&self) -> bool {
        !self.has_more || self.next.is_none()
    }
}

/// The Source trait defines the interface for all provider adapters.
///
/// Adapters are stateless apart from their HTTP client; rate limiting is
/// applied by the caller through the limiter registered next to the adapter.
#[async_trait]
pub trait Source: Send + Sync + std::fmt::Debug {
    /// Unique identifier (`openalex`, `crossref`, ...). Also the provider
    /// name written into every [`Document`] this source produces.
    fn id(&self) -> &str;

    /// Human-readable name of this source
    fn name(&self) -> &str;

    /// Pagination mode used by [`Source::fetch_page`]
    fn pagination(&self) -> PaginationMode;

    /// Translate a query into the provider-native query string.
    ///
    /// Pure; the result is stored in run metadata and checkpoints.
    fn translate_query(&self, query: &Query) -> String;

    /// Fetch one page of raw results.
    ///
    /// `token` is `None` for the first page, otherwise a token previously
    /// returned by this adapter.
    async fn fetch_page(
        &self,
        provider_query: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Page, SourceError>;

    /// Map one raw row to a canonical document
    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError>;
}

/// Errors that can occur when interacting with a provider
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SourceError {
    /// Network failure, timeout or 5xx response
    #[error("Transient provider error: {0}")]
    Transient(String),

    /// The provider (or the local limiter) asked us to slow down
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    /// Response body could not be understood
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl SourceError {
    /// Transient and rate-limit failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SourceError::Transient(_) | SourceError::RateLimited { .. }
        )
    }

    /// Delay requested by the provider, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return SourceError::Malformed(err.to_string());
        }
        match err.status() {
            Some(status) if status == reqwest::StatusCode::TOO_MANY_REQUESTS => {
                SourceError::RateLimited { retry_after: None }
            }
            Some(status)
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN =>
            {
                SourceError::AuthFailure(err.to_string())
            }
            Some(status) if status.is_client_error() => SourceError::Malformed(err.to_string()),
            _ => SourceError::Transient(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for SourceError {
    fn from(err: serde_json::Error) -> Self {
        SourceError::Malformed(format!("JSON: {}", err))
    }
}

impl From<RateLimitError> for SourceError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { .. } => SourceError::RateLimited { retry_after: None },
            RateLimitError::InvalidQuota { .. } => SourceError::Transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(SourceError::Transient("timeout".into()).is_retryable());
        assert!(SourceError::RateLimited { retry_after: None }.is_retryable());
        assert!(!SourceError::AuthFailure("401".into()).is_retryable());
        assert!(!SourceError::Malformed("bad json".into()).is_retryable());
    }

    #[test]
    fn test_retry_after() {
        let err = SourceError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(SourceError::Transient("x".into()).retry_after(), None);
    }

    #[test]
    fn test_token_offset() {
        assert_eq!(ContinuationToken::from_offset(200).offset(), Ok(200));
        assert!(matches!(
            ContinuationToken::new("abc").offset(),
            Err(SourceError::Malformed(_))
        ));
    }

    #[test]
    fn test_page_exhaustion() {
        assert!(Page::last(Vec::new()).is_exhausted());
        assert!(!Page::more(Vec::new(), ContinuationToken::new("c")).is_exhausted());
        let inconsistent = Page {
            records: Vec::new(),
            next: None,
            has_more: true,
        };
        assert!(inconsistent.is_exhausted());
    }

    #[test]
    fn test_rate_limit_error_is_retryable() {
        let err: SourceError = RateLimitError::Exceeded {
            provider: "crossref".into(),
            waited: Duration::from_millis(10),
        }
        .into();
        assert!(err.is_retryable());
    }
}

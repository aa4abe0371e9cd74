//! Utility modules supporting the search pipeline.
//!
//! - [`HttpClient`]: shared reqwest client plus the status-to-error mapping used by every adapter
//! - [`RateLimiter`]: per-provider token bucket
//! - [`RetryConfig`] / [`with_retry`]: exponential backoff with jitter for retryable provider errors
//! - [`JsonlWriter`] / [`read_jsonl`] / [`write_json_atomic`]: output streams and checkpoint files
//!
//! # Retry with Backoff
//!
//! ```rust,no_run
//! use research_nexus::sources::SourceError;
//! use research_nexus::utils::{with_retry, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn fetch_data() -> Result<String, SourceError> { Ok("data".to_string()) }
//! # #[tokio::main]
//! # async fn main() -> Result<(), SourceError> {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let data = with_retry(&config, &cancel, || fetch_data()).await?;
//! # Ok(())
//! # }
//! ```

mod http;
mod jsonl;
mod rate_limit;
mod retry;

pub use http::{check_status, HttpClient};
pub use jsonl::{read_json, read_jsonl, write_json_atomic, JsonlError, JsonlWriter};
pub use rate_limit::{default_capacity, RateLimitError, RateLimiter};
pub use retry::{with_retry, RetryConfig};

pub(crate) use retry::duration_secs;

//! # Research Nexus
//!
//! Concurrent, resumable literature search across bibliographic providers,
//! followed by duplicate clustering and record fusion.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`models`]: Core data structures (Document, Query)
//! - [`sources`]: Provider adapters behind the [`Source`] trait, and the registry pairing each with its rate limiter
//! - [`orchestrator`]: Units of (provider, query), worker pool, checkpoints and resume
//! - [`normalize`]: Identifier and text normalization shared by adapters and dedup
//! - [`dedup`]: Union-find duplicate clustering
//! - [`fusion`]: Trust-ranked merge of a cluster into one record
//! - [`utils`]: HTTP client, rate limiter, retry and JSONL output
//! - [`config`]: Configuration management

pub mod config;
pub mod dedup;
pub mod fusion;
pub mod models;
pub mod normalize;
pub mod orchestrator;
pub mod sources;
pub mod utils;

// Re-export commonly used types
pub use dedup::{DedupConfig, DedupStrategy, Deduplicator};
pub use fusion::{fuse, TrustRanking};
pub use models::{Document, Query};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunSummary};
pub use sources::{Source, SourceRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Configuration management.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration. Provider entries given in a file are merged over the
//! built-in provider table rather than replacing it.

mod file_config;

pub use file_config::{find_config_file, load_config, load_env_config, save_config, ConfigError};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::dedup::DedupConfig;
use crate::fusion::TrustRanking;
use crate::utils::RetryConfig;

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Search run settings
    pub search: SearchConfig,

    /// Per-provider settings keyed by provider id
    pub providers: BTreeMap<String, ProviderConfig>,

    /// Retry policy for provider requests
    pub retry: RetryConfig,

    /// Duplicate clustering settings
    pub dedup: DedupConfig,

    /// Provider trust ranking used by fusion
    pub fusion: FusionConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            search: SearchConfig::default(),
            providers: default_providers(),
            retry: RetryConfig::default(),
            dedup: DedupConfig::default(),
            fusion: FusionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Add built-in providers missing from the table
    pub fn fill_default_providers(&mut self) {
        for (id, provider) in default_providers() {
            self.providers.entry(id).or_insert(provider);
        }
    }

    /// Ids of enabled providers, in id order
    pub fn enabled_providers(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Reject values the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search.max_workers == 0 {
            return Err(ConfigError::Invalid("search.max_workers must be at least 1".into()));
        }
        if let (Some(min), Some(max)) = (self.search.year_min, self.search.year_max) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "search.year_min ({}) is after search.year_max ({})",
                    min, max
                )));
            }
        }
        for (id, provider) in &self.providers {
            if !provider.rate_limit.is_finite() || provider.rate_limit <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "providers.{}.rate_limit must be positive",
                    id
                )));
            }
            if provider.burst == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "providers.{}.burst must be at least 1",
                    id
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.dedup.fuzzy_threshold) {
            return Err(ConfigError::Invalid(
                "dedup.fuzzy_threshold must be within 0..=100".into(),
            ));
        }
        if self.dedup.max_year_gap < 0 {
            return Err(ConfigError::Invalid(
                "dedup.max_year_gap must not be negative".into(),
            ));
        }
        Ok(())
    }
}

/// Search run settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Base directory; each run writes to `<output_dir>/<run_id>`
    pub output_dir: PathBuf,

    /// Result cap per (provider, query) unit
    pub max_results: Option<usize>,

    /// Units running at the same time
    pub max_workers: usize,

    /// Continue from checkpoints instead of starting over
    pub resume: bool,

    /// Earliest publication year, unless a query sets its own
    pub year_min: Option<i32>,

    /// Latest publication year, unless a query sets its own
    pub year_max: Option<i32>,

    /// Contact address for polite-pool APIs
    pub mailto: Option<String>,

    /// Consecutive malformed pages tolerated before a unit gives up
    pub max_consecutive_malformed: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("results/outputs"),
            max_results: None,
            max_workers: 4,
            resume: false,
            year_min: None,
            year_max: None,
            mailto: None,
            max_consecutive_malformed: 3,
        }
    }
}

/// Settings for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub enabled: bool,

    /// Steady-state requests per second (fractional allowed)
    pub rate_limit: f64,

    /// Bucket capacity; defaults to five seconds' worth of requests
    pub burst: Option<u32>,

    /// HTTP request timeout in seconds
    pub timeout_secs: u64,

    /// Longest wait for a rate-limiter token, in seconds
    pub acquire_timeout_secs: f64,

    pub api_key: Option<String>,

    /// Overrides `search.mailto` for this provider
    pub mailto: Option<String>,

    /// Alternative API endpoint
    pub base_url: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit: 1.0,
            burst: None,
            timeout_secs: 30,
            acquire_timeout_secs: 30.0,
            api_key: None,
            mailto: None,
            base_url: None,
        }
    }
}

impl ProviderConfig {
    fn with_rate(rate_limit: f64) -> Self {
        Self {
            rate_limit,
            ..Self::default()
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.acquire_timeout_secs.max(0.0))
    }
}

/// Built-in provider table
pub fn default_providers() -> BTreeMap<String, ProviderConfig> {
    let mut providers = BTreeMap::new();
    providers.insert("openalex".to_string(), ProviderConfig::with_rate(5.0));
    providers.insert("crossref".to_string(), ProviderConfig::with_rate(1.0));
    providers.insert("arxiv".to_string(), ProviderConfig::with_rate(0.5));
    providers.insert("pubmed".to_string(), ProviderConfig::with_rate(3.0));
    providers.insert(
        "semantic_scholar".to_string(),
        ProviderConfig {
            // the public tier is heavily throttled without an API key
            enabled: false,
            ..ProviderConfig::with_rate(1.0)
        },
    );
    providers
}

/// Fusion settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Provider ids from most to least trusted; ids on one line share a rank
    /// when written as `"crossref|pubmed"`
    pub trust_order: Vec<String>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            trust_order: TrustRanking::default().to_config(),
        }
    }
}

impl FusionConfig {
    pub fn ranking(&self) -> TrustRanking {
        TrustRanking::from_config(&self.trust_order)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

//! Explicit provider registry.
//!
//! Maps provider id to its adapter and the rate limiter every unit of that
//! provider shares. Built once from configuration and handed to the
//! orchestrator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{
    ArxivSource, CrossrefSource, OpenAlexSource, PubMedSource, SemanticScholarSource, Source,
};
use crate::config::{Config, ProviderConfig};
use crate::utils::{default_capacity, RateLimitError, RateLimiter};

/// Provider ids with a built-in adapter
pub const KNOWN_PROVIDERS: &[&str] = &["arxiv", "crossref", "openalex", "pubmed", "semantic_scholar"];

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// An adapter with its shared limiter
#[derive(Debug, Clone)]
pub struct ProviderEntry {
    pub source: Arc<dyn Source>,
    pub limiter: Arc<RateLimiter>,
    /// Longest wait for a limiter token before the request counts as rate limited
    pub acquire_timeout: Duration,
}

impl ProviderEntry {
    pub fn new(source: Arc<dyn Source>, limiter: RateLimiter, acquire_timeout: Duration) -> Self {
        Self {
            source,
            limiter: Arc::new(limiter),
            acquire_timeout,
        }
    }
}

/// Registry for the providers taking part in a run
#[derive(Debug, Clone, Default)]
pub struct SourceRegistry {
    entries: BTreeMap<String, ProviderEntry>,
}

impl SourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every enabled provider of the configuration.
    ///
    /// Unknown provider ids in the configuration are an error only when enabled.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for id in config.enabled_providers() {
            if let Some(provider) = config.providers.get(&id) {
                let source = build_source(&id, provider, config.search.mailto.as_deref())?;
                let capacity = provider
                    .burst
                    .unwrap_or_else(|| default_capacity(provider.rate_limit));
                let limiter = RateLimiter::new(&id, provider.rate_limit, capacity)?;
                tracing::debug!(
                    "Registered provider {} ({}/s, burst {})",
                    id,
                    provider.rate_limit,
                    capacity
                );
                registry.register(ProviderEntry::new(
                    source,
                    limiter,
                    provider.acquire_timeout(),
                ));
            }
        }
        Ok(registry)
    }

    /// Register an entry under its source id, replacing any previous one
    pub fn register(&mut self, entry: ProviderEntry) {
        self.entries.insert(entry.source.id().to_string(), entry);
    }

    pub fn get(&self, id: &str) -> Option<&ProviderEntry> {
        self.entries.get(id)
    }

    /// Provider ids in id order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProviderEntry)> {
        self.entries.iter().map(|(id, entry)| (id.as_str(), entry))
    }

    /// Keep only providers for which `keep` returns true
    pub fn retain(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.entries.retain(|id, _| keep(id));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn build_source(
    id: &str,
    provider: &ProviderConfig,
    default_mailto: Option<&str>,
) -> Result<Arc<dyn Source>, RegistryError> {
    let mailto = provider.mailto.clone().or_else(|| default_mailto.map(str::to_string));
    let timeout = provider.timeout();
    let base_url = provider.base_url.as_deref();

    let source: Arc<dyn Source> = match id {
        "openalex" => {
            let source = OpenAlexSource::new(mailto, timeout);
            Arc::new(match base_url {
                Some(url) => source.with_base_url(url),
                None => source,
            })
        }
        "crossref" => {
            let source = CrossrefSource::new(mailto, timeout);
            Arc::new(match base_url {
                Some(url) => source.with_base_url(url),
                None => source,
            })
        }
        "semantic_scholar" => {
            let source = SemanticScholarSource::new(provider.api_key.clone(), timeout);
            Arc::new(match base_url {
                Some(url) => source.with_base_url(url),
                None => source,
            })
        }
        "arxiv" => {
            let source = ArxivSource::new(timeout);
            Arc::new(match base_url {
                Some(url) => source.with_base_url(url),
                None => source,
            })
        }
        "pubmed" => {
            let source = PubMedSource::new(provider.api_key.clone(), mailto, timeout);
            Arc::new(match base_url {
                Some(url) => source.with_base_url(url),
                None => source,
            })
        }
        other => return Err(RegistryError::UnknownProvider(other.to_string())),
    };
    Ok(source)
}

//! Configuration file support.
//!
//! TOML files are read through the `config` crate, with `NEXUS_`-prefixed
//! environment variables layered on top (`__` separates nesting levels, so
//! `NEXUS_SEARCH__MAX_WORKERS=8` sets `search.max_workers`).
//!
//! # Configuration File Format
//!
//! ```toml
//! [search]
//! output_dir = "results/outputs"
//! max_results = 500
//! max_workers = 4
//! year_min = 2015
//! mailto = "you@example.org"
//!
//! [providers.openalex]
//! rate_limit = 5.0
//!
//! [providers.semantic_scholar]
//! enabled = true
//! api_key = "..."
//!
//! [retry]
//! max_attempts = 5
//! initial_delay = 1.0
//!
//! [dedup]
//! strategy = "conservative"
//! fuzzy_threshold = 97
//! max_year_gap = 1
//!
//! [fusion]
//! trust_order = ["crossref|pubmed", "openalex", "semantic_scholar", "arxiv"]
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::path::{Path, PathBuf};

use super::Config;

const ENV_PREFIX: &str = "NEXUS";
const CONFIG_FILE_NAME: &str = "nexus.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Load configuration from a TOML file plus environment overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    build(Some(path))
}

/// Configuration from environment overrides and defaults only
pub fn load_env_config() -> Result<Config, ConfigError> {
    build(None)
}

fn build(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).format(config::FileFormat::Toml));
    }
    let settings = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let mut config: Config = settings.try_deserialize()?;
    config.fill_default_providers();
    config.validate()?;
    Ok(config)
}

/// Write configuration as TOML
pub fn save_config(config: &Config, path: &Path) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

/// Find a configuration file: `./nexus.toml`, then
/// `<config dir>/research-nexus/config.toml`.
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    dirs::config_dir()
        .map(|dir| dir.join("research-nexus").join("config.toml"))
        .filter(|path| path.is_file())
}

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use research_nexus::config::{
    find_config_file, load_config, load_env_config, save_config, Config, LogFormat,
};
use research_nexus::dedup::{self, deduplicate_files, DedupStrategy};
use research_nexus::models::{load_queries, Query};
use research_nexus::orchestrator::{new_run_id, Orchestrator, OrchestratorConfig, UnitStatus};
use research_nexus::sources::{SourceRegistry, KNOWN_PROVIDERS};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Research Nexus - resumable literature search with duplicate clustering
#[derive(Parser, Debug)]
#[command(name = "research-nexus")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "hongkongkiwi")]
#[command(about = "Search bibliographic providers, then cluster and fuse duplicate records", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging (-v debug, -vv trace)
    #[arg(long, short, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Configuration file path
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Clustering strategy
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    /// Identifier, exact-title and fuzzy-title matching
    Conservative,
    /// Embedding similarity (not implemented)
    Semantic,
    /// Conservative plus embeddings (not implemented)
    Hybrid,
}

impl From<Strategy> for DedupStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Conservative => DedupStrategy::Conservative,
            Strategy::Semantic => DedupStrategy::Semantic,
            Strategy::Hybrid => DedupStrategy::Hybrid,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every (provider, query) unit and write per-unit JSONL streams
    #[command(alias = "s")]
    Search {
        /// Query file (YAML or JSON)
        #[arg(long, conflicts_with = "query")]
        queries: Option<PathBuf>,

        /// A single ad-hoc query
        #[arg(long, required_unless_present = "queries")]
        query: Option<String>,

        /// Id for the ad-hoc query
        #[arg(long, default_value = "Q01")]
        query_id: String,

        /// Only use these providers (repeatable)
        #[arg(long = "provider", short = 'p')]
        providers: Vec<String>,

        /// Skip these providers (repeatable)
        #[arg(long = "skip-provider")]
        skip_providers: Vec<String>,

        /// Earliest publication year
        #[arg(long)]
        year_min: Option<i32>,

        /// Latest publication year
        #[arg(long)]
        year_max: Option<i32>,

        /// Result cap per unit
        #[arg(long, short)]
        max_results: Option<usize>,

        /// Units running at the same time
        #[arg(long)]
        max_workers: Option<usize>,

        /// Base output directory
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Run id; defaults to a timestamp
        #[arg(long)]
        run_id: Option<String>,

        /// Continue the run given by --run-id from its checkpoints
        #[arg(long, requires = "run_id")]
        resume: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Cluster duplicates across result files and write fused records
    #[command(alias = "d")]
    Dedup {
        /// JSONL files or run directories
        #[arg(long = "input", short, required = true)]
        inputs: Vec<PathBuf>,

        /// Output directory; defaults to the first input's directory
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Clustering strategy
        #[arg(long, value_enum)]
        strategy: Option<Strategy>,

        /// Fuzzy title threshold (0-100)
        #[arg(long)]
        threshold: Option<f64>,

        /// Largest year difference a fuzzy merge may bridge
        #[arg(long)]
        max_year_gap: Option<i32>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List providers and their settings
    Providers,

    /// Write the default configuration to a file
    InitConfig {
        /// Destination path
        #[arg(default_value = "nexus.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn load_configuration(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => load_config(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => match find_config_file() {
            Some(path) => load_config(&path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => load_env_config()?,
        },
    };
    Ok(config)
}

fn init_tracing(config: &Config, verbose: u8, quiet: bool) {
    let level = if quiet {
        "error".to_string()
    } else {
        match verbose {
            0 => config.logging.level.clone(),
            1 => "debug".to_string(),
            _ => "trace".to_string(),
        }
    };
    let directive = if level.contains('=') {
        level
    } else {
        format!("research_nexus={}", level)
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_configuration(cli.config.as_deref())?;
    init_tracing(&config, cli.verbose, cli.quiet);

    match cli.command {
        Commands::Search {
            queries,
            query,
            query_id,
            providers,
            skip_providers,
            year_min,
            year_max,
            max_results,
            max_workers,
            output,
            run_id,
            resume,
            json,
        } => {
            let mut config = config;
            select_providers(&mut config, &providers, &skip_providers)?;
            if let Some(dir) = output {
                config.search.output_dir = dir;
            }
            config.search.year_min = year_min.or(config.search.year_min);
            config.search.year_max = year_max.or(config.search.year_max);
            config.search.max_results = max_results.or(config.search.max_results);
            config.search.max_workers = max_workers.unwrap_or(config.search.max_workers);
            config.search.resume = resume || config.search.resume;
            config.validate()?;

            let queries = match (queries, query) {
                (Some(path), _) => load_queries(&path)
                    .with_context(|| format!("reading queries from {}", path.display()))?,
                (None, Some(text)) => vec![Query::new(query_id, text)],
                (None, None) => bail!("either --queries or --query is required"),
            };

            let registry = SourceRegistry::from_config(&config)?;
            let run_id = run_id.unwrap_or_else(new_run_id);
            let orchestrator =
                Orchestrator::new(registry, OrchestratorConfig::from_config(&config, run_id));

            let cancel = orchestrator.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, finishing in-flight requests");
                    cancel.cancel();
                }
            });

            let summary = orchestrator.run(&queries).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else if !cli.quiet {
                println!("Run {} -> {}", summary.run_id, summary.output_dir.display());
                for unit in &summary.units {
                    println!(
                        "  {:<18} {:<12} {:<12} {:>6} records {:>4} pages{}",
                        unit.provider,
                        unit.query_id,
                        unit.status.as_str(),
                        unit.records_emitted,
                        unit.pages,
                        unit.error
                            .as_deref()
                            .map(|e| format!("  ({})", e))
                            .unwrap_or_default()
                    );
                }
                println!(
                    "{} records; {} complete, {} partial, {} failed",
                    summary.records_emitted(),
                    summary.count(UnitStatus::Complete),
                    summary.count(UnitStatus::Partial),
                    summary.count(UnitStatus::Failed)
                );
                if !summary.success {
                    println!(
                        "Resume with: research-nexus search --run-id {} --resume ...",
                        summary.run_id
                    );
                }
            }

            Ok(if summary.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            })
        }

        Commands::Dedup {
            inputs,
            output,
            strategy,
            threshold,
            max_year_gap,
            json,
        } => {
            let mut dedup_config = config.dedup.clone();
            if let Some(strategy) = strategy {
                dedup_config.strategy = strategy.into();
            }
            if let Some(threshold) = threshold {
                if !(0.0..=100.0).contains(&threshold) {
                    bail!("--threshold must be within 0..=100");
                }
                dedup_config.fuzzy_threshold = threshold;
            }
            if let Some(gap) = max_year_gap {
                if gap < 0 {
                    bail!("--max-year-gap must not be negative");
                }
                dedup_config.max_year_gap = gap;
            }

            let output_dir = match output {
                Some(dir) => dir,
                None => default_dedup_dir(&inputs)?,
            };
            let report = deduplicate_files(
                &inputs,
                &output_dir,
                &dedup_config,
                &config.fusion.ranking(),
            )?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if !cli.quiet {
                let stats = &report.stats;
                println!(
                    "{} records from {} files -> {} unique ({} exact, {} fuzzy duplicates, {:.1}% duplicate rate)",
                    stats.identified,
                    report.inputs.len(),
                    stats.unique,
                    stats.exact_duplicates_removed,
                    stats.fuzzy_duplicates_removed,
                    stats.duplicate_rate * 100.0
                );
                println!("  {}", report.clusters_path.display());
                println!("  {}", report.fused_path.display());
                println!("  {}", output_dir.join(dedup::SUMMARY_FILE).display());
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Providers => {
            for (id, provider) in &config.providers {
                println!(
                    "{:<18} {:<8} {:>6.2}/s  burst {:<4} {}",
                    id,
                    if provider.enabled { "enabled" } else { "disabled" },
                    provider.rate_limit,
                    provider
                        .burst
                        .map(|b| b.to_string())
                        .unwrap_or_else(|| "auto".to_string()),
                    if KNOWN_PROVIDERS.contains(&id.as_str()) {
                        ""
                    } else {
                        "(no adapter)"
                    }
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            save_config(&Config::default(), &path)?;
            println!("Wrote {}", path.display());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Apply --provider / --skip-provider to the provider table
fn select_providers(config: &mut Config, only: &[String], skip: &[String]) -> Result<()> {
    for id in only.iter().chain(skip) {
        if !KNOWN_PROVIDERS.contains(&id.as_str()) {
            bail!(
                "Unknown provider '{}' (known: {})",
                id,
                KNOWN_PROVIDERS.join(", ")
            );
        }
    }
    if !only.is_empty() {
        for id in only {
            config.providers.entry(id.clone()).or_default();
        }
        for (id, provider) in config.providers.iter_mut() {
            provider.enabled = only.contains(id);
        }
    }
    for id in skip {
        if let Some(provider) = config.providers.get_mut(id) {
            provider.enabled = false;
        }
    }
    Ok(())
}

/// The first input's directory, or its parent for a file
fn default_dedup_dir(inputs: &[PathBuf]) -> Result<PathBuf> {
    let first = inputs.first().context("no input given")?;
    if first.is_dir() {
        return Ok(first.clone());
    }
    Ok(first
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

//! Search orchestration.
//!
//! Every (provider, query) pair is an independent unit. Units run on spawned
//! tasks with at most `max_workers` in flight. Each unit pages through its
//! provider, appends normalized records to its own JSONL stream and
//! checkpoints after every page, so an interrupted run can be resumed without
//! emitting a record twice.

mod checkpoint;

pub use checkpoint::{file_component, Checkpoint, UnitPaths, UnitStatus, CHECKPOINT_VERSION};

use chrono::{DateTime, Local, Utc};
use futures_util::{stream, FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::models::{Document, Query};
use crate::normalize;
use crate::sources::{ProviderEntry, SourceError, SourceRegistry};
use crate::utils::{read_jsonl, with_retry, write_json_atomic, JsonlError, JsonlWriter, RetryConfig};

/// Run metadata file name
pub const RUN_METADATA_FILE: &str = "run_metadata.json";

/// Per-provider aggregate file name
pub const AGGREGATE_FILE: &str = "all_results.jsonl";

/// Orchestrator errors. Failures inside a unit never surface here; they end
/// up in that unit's [`UnitReport`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("No providers enabled")]
    NoProviders,

    #[error("No queries to run")]
    NoQueries,

    #[error(transparent)]
    Output(#[from] JsonlError),
}

/// Settings of one search run
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub run_id: String,
    /// Run directory, the parent of every provider directory
    pub output_dir: PathBuf,
    /// Result cap per unit
    pub max_results: Option<usize>,
    pub max_workers: usize,
    pub resume: bool,
    pub retry: RetryConfig,
    pub max_consecutive_malformed: u32,
    /// Year bounds for queries that set none
    pub year_min: Option<i32>,
    pub year_max: Option<i32>,
}

impl OrchestratorConfig {
    pub fn new(run_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            output_dir: output_dir.into(),
            max_results: None,
            max_workers: 4,
            resume: false,
            retry: RetryConfig::default(),
            max_consecutive_malformed: 3,
            year_min: None,
            year_max: None,
        }
    }

    /// Settings for a run writing to `<search.output_dir>/<run_id>`
    pub fn from_config(config: &Config, run_id: impl Into<String>) -> Self {
        let run_id = run_id.into();
        Self {
            output_dir: config.search.output_dir.join(&run_id),
            run_id,
            max_results: config.search.max_results,
            max_workers: config.search.max_workers,
            resume: config.search.resume,
            retry: config.retry,
            max_consecutive_malformed: config.search.max_consecutive_malformed,
            year_min: config.search.year_min,
            year_max: config.search.year_max,
        }
    }
}

/// A fresh run id, `run_<date>_<time>` in local time
pub fn new_run_id() -> String {
    Local::now().format("run_%Y-%m-%d_%H%M%S").to_string()
}

/// One line of a unit stream: the document plus the query that found it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub query_id: String,
    #[serde(flatten)]
    pub document: Document,
}

/// Outcome of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReport {
    pub provider: String,
    pub query_id: String,
    pub provider_query: String,
    pub status: UnitStatus,
    pub pages: u64,
    pub records_emitted: usize,
    pub records_dropped: u64,
    pub records_filtered: u64,
    pub duplicates_skipped: u64,
    /// Continued from an earlier checkpoint
    pub resumed: bool,
    pub error: Option<String>,
    pub results_path: PathBuf,
}

impl UnitReport {
    fn new(provider: &str, query_id: &str, provider_query: &str, results_path: PathBuf) -> Self {
        Self {
            provider: provider.to_string(),
            query_id: query_id.to_string(),
            provider_query: provider_query.to_string(),
            status: UnitStatus::InProgress,
            pages: 0,
            records_emitted: 0,
            records_dropped: 0,
            records_filtered: 0,
            duplicates_skipped: 0,
            resumed: false,
            error: None,
            results_path,
        }
    }

    fn record(&mut self, checkpoint: &Checkpoint) {
        self.status = checkpoint.status;
        self.pages = checkpoint.pages;
        self.records_emitted = checkpoint.records_emitted();
        self.records_dropped = checkpoint.records_dropped;
        self.records_filtered = checkpoint.records_filtered;
        self.duplicates_skipped = checkpoint.duplicates_skipped;
        self.error = checkpoint.error.clone();
    }
}

/// Outcome of a run, also written as `run_metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub providers: Vec<String>,
    pub queries: Vec<Query>,
    pub units: Vec<UnitReport>,
    pub cancelled: bool,
    /// Every unit complete
    pub success: bool,
}

impl RunSummary {
    pub fn records_emitted(&self) -> usize {
        self.units.iter().map(|u| u.records_emitted).sum()
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }

    pub fn unit(&self, provider: &str, query_id: &str) -> Option<&UnitReport> {
        self.units
            .iter()
            .find(|u| u.provider == provider && u.query_id == query_id)
    }
}

/// Drives every (provider, query) unit of a run
#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<SourceRegistry>,
    config: Arc<OrchestratorConfig>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(registry: SourceRegistry, config: OrchestratorConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that aborts the run; units stop after their in-flight request
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run every unit to a terminal state, rebuild the per-provider
    /// aggregates and write run metadata.
    pub async fn run(&self, queries: &[Query]) -> Result<RunSummary, OrchestratorError> {
        if self.registry.is_empty() {
            return Err(OrchestratorError::NoProviders);
        }
        if queries.is_empty() {
            return Err(OrchestratorError::NoQueries);
        }

        let started_at = Utc::now();
        let queries: Vec<Query> = queries.iter().map(|q| self.with_default_years(q)).collect();
        let providers: Vec<String> = self.registry.ids().map(str::to_string).collect();

        tracing::info!(
            "Starting run {}: {} queries x {} providers, {} workers, output {}",
            self.config.run_id,
            queries.len(),
            providers.len(),
            self.config.max_workers,
            self.config.output_dir.display()
        );

        let mut units = Vec::new();
        for query in &queries {
            for (_, entry) in self.registry.iter() {
                units.push((entry.clone(), query.clone()));
            }
        }

        let mut reports: Vec<UnitReport> = stream::iter(units)
            .map(|(entry, query)| {
                let config = Arc::clone(&self.config);
                let cancel = self.cancel.clone();
                let provider = entry.source.id().to_string();
                let query_id = query.id.clone();
                let results = UnitPaths::new(&config.output_dir, &provider, &query_id).results;
                tokio::spawn(async move {
                    UnitRunner::new(&entry, &query, &config, &cancel).run().await
                })
                .map(move |joined| {
                    joined.unwrap_or_else(|e| {
                        tracing::error!("Unit {}/{} panicked: {}", provider, query_id, e);
                        let mut report = UnitReport::new(&provider, &query_id, "", results);
                        report.status = UnitStatus::Failed;
                        report.error = Some(format!("unit task failed: {}", e));
                        report
                    })
                })
            })
            .buffer_unordered(self.config.max_workers.max(1))
            .collect()
            .await;

        let order: HashMap<&str, usize> = queries
            .iter()
            .enumerate()
            .map(|(i, q)| (q.id.as_str(), i))
            .collect();
        reports.sort_by(|a, b| {
            let rank = |r: &UnitReport| order.get(r.query_id.as_str()).copied().unwrap_or(usize::MAX);
            rank(a)
                .cmp(&rank(b))
                .then_with(|| a.provider.cmp(&b.provider))
        });

        for provider in &providers {
            let written = rebuild_aggregate(&self.config.output_dir, provider, &queries)?;
            tracing::info!("{}: {} records in {}", provider, written, AGGREGATE_FILE);
        }

        let summary = RunSummary {
            run_id: self.config.run_id.clone(),
            output_dir: self.config.output_dir.clone(),
            started_at,
            finished_at: Utc::now(),
            providers,
            success: reports.iter().all(|r| r.status == UnitStatus::Complete),
            cancelled: self.cancel.is_cancelled(),
            queries,
            units: reports,
        };
        write_json_atomic(&self.config.output_dir.join(RUN_METADATA_FILE), &summary)?;

        tracing::info!(
            "Run {} finished: {} records, {} complete, {} partial, {} failed",
            summary.run_id,
            summary.records_emitted(),
            summary.count(UnitStatus::Complete),
            summary.count(UnitStatus::Partial),
            summary.count(UnitStatus::Failed)
        );
        Ok(summary)
    }

    fn with_default_years(&self, query: &Query) -> Query {
        let year_min = query.year_min.or(self.config.year_min);
        let year_max = query.year_max.or(self.config.year_max);
        query.clone().years(year_min, year_max)
    }
}

/// Rewrite `<out>/<provider>/all_results.jsonl` from the unit streams, in
/// query order, keeping the first line of every record id.
fn rebuild_aggregate(
    output_dir: &Path,
    provider: &str,
    queries: &[Query],
) -> Result<usize, JsonlError> {
    let path = output_dir.join(file_component(provider)).join(AGGREGATE_FILE);
    let mut writer = JsonlWriter::create(&path)?;
    let mut seen = HashSet::new();
    for query in queries {
        let records: Vec<ResultRecord> =
            read_jsonl(&UnitPaths::new(output_dir, provider, &query.id).results)?;
        for record in records {
            if seen.insert(record.document.record_id()) {
                writer.write(&record)?;
            }
        }
    }
    writer.flush()?;
    Ok(seen.len())
}

/// Executes one unit
struct UnitRunner<'a> {
    entry: &'a ProviderEntry,
    query: &'a Query,
    config: &'a OrchestratorConfig,
    cancel: &'a CancellationToken,
    paths: UnitPaths,
}

impl<'a> UnitRunner<'a> {
    fn new(
        entry: &'a ProviderEntry,
        query: &'a Query,
        config: &'a OrchestratorConfig,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            paths: UnitPaths::new(&config.output_dir, entry.source.id(), &query.id),
            entry,
            query,
            config,
            cancel,
        }
    }

    fn provider(&self) -> &str {
        self.entry.source.id()
    }

    async fn run(self) -> UnitReport {
        let provider_query = self.entry.source.translate_query(self.query);
        let mut report = UnitReport::new(
            self.provider(),
            &self.query.id,
            &provider_query,
            self.paths.results.clone(),
        );

        if let Err(e) = self.drive(&provider_query, &mut report).await {
            tracing::error!("{}/{}: output failure: {}", self.provider(), self.query.id, e);
            report.status = if report.records_emitted > 0 {
                UnitStatus::Partial
            } else {
                UnitStatus::Failed
            };
            report.error = Some(e.to_string());
        }

        tracing::info!(
            "{}/{} {}: {} records, {} pages, {} dropped, {} filtered",
            self.provider(),
            self.query.id,
            report.status,
            report.records_emitted,
            report.pages,
            report.records_dropped,
            report.records_filtered
        );
        report
    }

    /// Load the checkpoint to continue from, or reset the unit's files
    fn prepare(&self, provider_query: &str) -> Result<(Checkpoint, bool), JsonlError> {
        if self.config.resume {
            match Checkpoint::load(&self.paths.checkpoint)? {
                Some(mut checkpoint)
                    if checkpoint.resumes(self.provider(), &self.query.id, provider_query) =>
                {
                    // the stream may be a page ahead of the checkpoint
                    let streamed: Vec<Document> = read_jsonl(&self.paths.results)?;
                    checkpoint
                        .emitted_ids
                        .extend(streamed.iter().map(Document::record_id));
                    return Ok((checkpoint, true));
                }
                Some(_) => tracing::info!(
                    "{}/{}: query changed since checkpoint, starting over",
                    self.provider(),
                    self.query.id
                ),
                None => {}
            }
        }

        JsonlWriter::create(&self.paths.results)?;
        let mut checkpoint = Checkpoint::new(self.provider(), &self.query.id, provider_query);
        checkpoint.save(&self.paths.checkpoint)?;
        Ok((checkpoint, false))
    }

    fn cap_reached(&self, checkpoint: &Checkpoint) -> bool {
        self.config
            .max_results
            .is_some_and(|max| checkpoint.records_emitted() >= max)
    }

    /// Stop with an error: partial when anything was emitted, failed otherwise
    fn terminate(checkpoint: &mut Checkpoint, error: String) {
        checkpoint.status = if checkpoint.emitted_ids.is_empty() {
            UnitStatus::Failed
        } else {
            UnitStatus::Partial
        };
        checkpoint.error = Some(error);
    }

    async fn drive(&self, provider_query: &str, report: &mut UnitReport) -> Result<(), JsonlError> {
        let (mut checkpoint, resumed) = self.prepare(provider_query)?;
        report.resumed = resumed;
        report.record(&checkpoint);

        if checkpoint.status == UnitStatus::Complete {
            tracing::info!("{}/{}: already complete, skipping", self.provider(), self.query.id);
            return Ok(());
        }
        if resumed {
            tracing::info!(
                "{}/{}: resuming after {} pages, {} records",
                self.provider(),
                self.query.id,
                checkpoint.pages,
                checkpoint.records_emitted()
            );
        }

        checkpoint.status = UnitStatus::InProgress;
        checkpoint.error = None;
        let mut writer = JsonlWriter::append(&self.paths.results)?;
        let mut malformed_streak = 0u32;

        loop {
            if self.cap_reached(&checkpoint) {
                checkpoint.status = UnitStatus::Complete;
                break;
            }
            if self.cancel.is_cancelled() {
                checkpoint.status = UnitStatus::Partial;
                checkpoint.error = Some("cancelled".to_string());
                break;
            }

            let entry = self.entry;
            let token = checkpoint.continuation.as_ref();
            let fetched = with_retry(&self.config.retry, self.cancel, move || async move {
                entry.limiter.acquire(entry.acquire_timeout).await?;
                entry.source.fetch_page(provider_query, token).await
            })
            .await;

            let page = match fetched {
                Ok(page) => {
                    malformed_streak = 0;
                    page
                }
                Err(_) if self.cancel.is_cancelled() => {
                    checkpoint.status = UnitStatus::Partial;
                    checkpoint.error = Some("cancelled".to_string());
                    break;
                }
                Err(SourceError::Malformed(reason)) => {
                    malformed_streak += 1;
                    tracing::warn!(
                        "{}/{}: dropped malformed page ({}/{}): {}",
                        self.provider(),
                        self.query.id,
                        malformed_streak,
                        self.config.max_consecutive_malformed,
                        reason
                    );
                    if malformed_streak >= self.config.max_consecutive_malformed.max(1) {
                        Self::terminate(
                            &mut checkpoint,
                            format!(
                                "{} consecutive malformed pages: {}",
                                malformed_streak, reason
                            ),
                        );
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!("{}/{}: {}", self.provider(), self.query.id, e);
                    Self::terminate(&mut checkpoint, e.to_string());
                    break;
                }
            };

            checkpoint.pages += 1;
            for raw in &page.records {
                if self.cap_reached(&checkpoint) {
                    break;
                }
                let doc = match self
                    .entry
                    .source
                    .normalize(raw)
                    .and_then(normalize::validate)
                {
                    Ok(doc) => doc,
                    Err(e) => {
                        tracing::debug!("{}/{}: dropped record: {}", self.provider(), self.query.id, e);
                        checkpoint.records_dropped += 1;
                        continue;
                    }
                };
                if !self.query.passes_filters(&doc) {
                    checkpoint.records_filtered += 1;
                    continue;
                }
                if !checkpoint.emitted_ids.insert(doc.record_id()) {
                    checkpoint.duplicates_skipped += 1;
                    continue;
                }
                writer.write(&ResultRecord {
                    query_id: self.query.id.clone(),
                    document: doc,
                })?;
            }
            writer.flush()?;

            tracing::debug!(
                "{}/{}: page {} with {} records, {} emitted so far",
                self.provider(),
                self.query.id,
                checkpoint.pages,
                page.records.len(),
                checkpoint.records_emitted()
            );

            checkpoint.continuation = page.next.clone();
            if page.is_exhausted() || self.cap_reached(&checkpoint) {
                checkpoint.status = UnitStatus::Complete;
                break;
            }
            checkpoint.save(&self.paths.checkpoint)?;
            report.record(&checkpoint);
        }

        checkpoint.save(&self.paths.checkpoint)?;
        report.record(&checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentBuilder;
    use crate::sources::{MockSource, Source};
    use crate::utils::RateLimiter;
    use std::time::Duration;
    use tempfile::tempdir;

    fn docs(prefix: &str, n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| {
                DocumentBuilder::new(format!("{} paper number {}", prefix, i), "mock")
                    .year(Some(2020))
                    .doi(&format!("10.1/{}{}", prefix, i))
                    .build()
            })
            .collect()
    }

    fn registry(sources: Vec<Arc<dyn Source>>) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for source in sources {
            let limiter = RateLimiter::new(source.id(), 1000.0, 100).unwrap();
            registry.register(ProviderEntry::new(source, limiter, Duration::from_secs(1)));
        }
        registry
    }

    fn config(dir: &Path) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new("run_test", dir);
        config.retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: 0.0,
        };
        config
    }

    #[tokio::test]
    async fn test_pages_until_exhausted() {
        let dir = tempdir().unwrap();
        let source = Arc::new(MockSource::new("alpha").with_documents(&docs("a", 5), 2));
        let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config(dir.path()));

        let summary = orchestrator.run(&[Query::new("Q01", "anything")]).await.unwrap();
        assert!(summary.success);
        let unit = summary.unit("alpha", "Q01").unwrap();
        assert_eq!(unit.status, UnitStatus::Complete);
        assert_eq!(unit.pages, 3);
        assert_eq!(unit.records_emitted, 5);
        assert_eq!(unit.provider_query, "mock:anything");
        assert_eq!(source.call_count(), 3);

        let stream: Vec<ResultRecord> = read_jsonl(&unit.results_path).unwrap();
        assert_eq!(stream.len(), 5);
        assert!(stream.iter().all(|r| r.query_id == "Q01"));
        assert!(dir.path().join(RUN_METADATA_FILE).exists());
        assert!(dir.path().join("alpha").join(AGGREGATE_FILE).exists());
    }

    #[tokio::test]
    async fn test_result_cap_completes_unit() {
        let dir = tempdir().unwrap();
        let source = Arc::new(MockSource::new("alpha").with_documents(&docs("a", 10), 4));
        let mut config = config(dir.path());
        config.max_results = Some(5);
        let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config);

        let summary = orchestrator.run(&[Query::new("Q01", "x")]).await.unwrap();
        let unit = summary.unit("alpha", "Q01").unwrap();
        assert_eq!(unit.status, UnitStatus::Complete);
        assert_eq!(unit.records_emitted, 5);
        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            MockSource::new("alpha")
                .with_documents(&docs("a", 4), 2)
                .fail_page(1, SourceError::Transient("503".into()), 2),
        );
        let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config(dir.path()));

        let summary = orchestrator.run(&[Query::new("Q01", "x")]).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.unit("alpha", "Q01").unwrap().records_emitted, 4);
        assert_eq!(source.call_count(), 4);
    }

    #[tokio::test]
    async fn test_auth_failure_before_records_fails_unit() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            MockSource::new("alpha")
                .with_documents(&docs("a", 2), 2)
                .fail_page(0, SourceError::AuthFailure("401".into()), 1),
        );
        let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config(dir.path()));

        let summary = orchestrator.run(&[Query::new("Q01", "x")]).await.unwrap();
        let unit = summary.unit("alpha", "Q01").unwrap();
        assert_eq!(unit.status, UnitStatus::Failed);
        assert!(unit.error.as_deref().unwrap_or("").contains("401"));
        assert!(!summary.success);
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_pages_end_unit() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            MockSource::new("alpha")
                .with_documents(&docs("a", 4), 2)
                .fail_page(1, SourceError::Malformed("bad json".into()), 5),
        );
        let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config(dir.path()));

        let summary = orchestrator.run(&[Query::new("Q01", "x")]).await.unwrap();
        let unit = summary.unit("alpha", "Q01").unwrap();
        assert_eq!(unit.status, UnitStatus::Partial);
        assert_eq!(unit.records_emitted, 2);
        // first page plus three malformed attempts at the second
        assert_eq!(source.call_count(), 4);
    }

    #[tokio::test]
    async fn test_malformed_page_recovers() {
        let dir = tempdir().unwrap();
        let source = Arc::new(
            MockSource::new("alpha")
                .with_documents(&docs("a", 4), 2)
                .fail_page(1, SourceError::Malformed("truncated".into()), 2),
        );
        let orchestrator = Orchestrator::new(registry(vec![source]), config(dir.path()));

        let summary = orchestrator.run(&[Query::new("Q01", "x")]).await.unwrap();
        assert!(summary.success);
        assert_eq!(summary.unit("alpha", "Q01").unwrap().records_emitted, 4);
    }

    #[tokio::test]
    async fn test_invalid_records_are_dropped_and_filters_applied() {
        let dir = tempdir().unwrap();
        let pages = vec![vec![
            serde_json::json!({"title": "Wheat rust in Kenya", "provider": "alpha", "doi": "10.1/1"}),
            serde_json::json!({"doi": "10.1/2"}),
            serde_json::json!({"title": "   ", "provider": "alpha", "doi": "10.1/3"}),
            serde_json::json!({"title": "Rice blast review", "provider": "alpha", "doi": "10.1/4"}),
            serde_json::json!({"title": "Wheat rust in Kenya", "provider": "alpha", "doi": "10.1/1"}),
        ]];
        let source = Arc::new(MockSource::new("alpha").with_pages(pages));
        let orchestrator = Orchestrator::new(registry(vec![source]), config(dir.path()));
        let query = Query::new("Q01", "crops").include_any(["wheat"]);

        let summary = orchestrator.run(&[query]).await.unwrap();
        let unit = summary.unit("alpha", "Q01").unwrap();
        assert_eq!(unit.status, UnitStatus::Complete);
        assert_eq!(unit.records_emitted, 1);
        assert_eq!(unit.records_dropped, 2);
        assert_eq!(unit.records_filtered, 1);
        assert_eq!(unit.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn test_cancelled_run_is_partial() {
        let dir = tempdir().unwrap();
        let source = Arc::new(MockSource::new("alpha").with_documents(&docs("a", 4), 2));
        let orchestrator = Orchestrator::new(registry(vec![source.clone()]), config(dir.path()));
        orchestrator.cancellation_token().cancel();

        let summary = orchestrator.run(&[Query::new("Q01", "x")]).await.unwrap();
        assert!(summary.cancelled);
        assert!(!summary.success);
        assert_eq!(summary.unit("alpha", "Q01").unwrap().status, UnitStatus::Partial);
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_default_years_apply_to_queries() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.year_min = Some(2015);
        let orchestrator = Orchestrator::new(
            registry(vec![Arc::new(MockSource::new("alpha"))]),
            config,
        );

        let summary = orchestrator
            .run(&[Query::new("Q01", "x"), Query::new("Q02", "y").years(Some(2020), None)])
            .await
            .unwrap();
        assert_eq!(summary.queries[0].year_min, Some(2015));
        assert_eq!(summary.queries[1].year_min, Some(2020));
    }

    #[tokio::test]
    async fn test_empty_inputs_are_errors() {
        let dir = tempdir().unwrap();
        let orchestrator = Orchestrator::new(SourceRegistry::new(), config(dir.path()));
        assert!(matches!(
            orchestrator.run(&[Query::new("Q01", "x")]).await,
            Err(OrchestratorError::NoProviders)
        ));

        let orchestrator = Orchestrator::new(
            registry(vec![Arc::new(MockSource::new("alpha"))]),
            config(dir.path()),
        );
        assert!(matches!(orchestrator.run(&[]).await, Err(OrchestratorError::NoQueries)));
    }

    #[tokio::test]
    async fn test_aggregate_keeps_first_occurrence() {
        let dir = tempdir().unwrap();
        let shared = docs("s", 3);
        let source = Arc::new(MockSource::new("alpha").with_documents(&shared, 3));
        let orchestrator = Orchestrator::new(registry(vec![source]), config(dir.path()));

        orchestrator
            .run(&[Query::new("Q01", "x"), Query::new("Q02", "y")])
            .await
            .unwrap();
        let aggregate: Vec<ResultRecord> =
            read_jsonl(&dir.path().join("alpha").join(AGGREGATE_FILE)).unwrap();
        assert_eq!(aggregate.len(), 3);
        assert!(aggregate.iter().all(|r| r.query_id == "Q01"));
    }
}

//! File-level dedup pipeline: read document streams, cluster, fuse, write.

use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use super::{DedupConfig, DedupError, DedupStats, Deduplicator};
use crate::fusion::{fuse, TrustRanking};
use crate::models::Document;
use crate::orchestrator::AGGREGATE_FILE;
use crate::utils::{read_jsonl, write_json_atomic, JsonlWriter};

pub const CLUSTERS_FILE: &str = "clusters.json";
pub const FUSED_FILE: &str = "fused.jsonl";
pub const SUMMARY_FILE: &str = "dedup_summary.json";

/// What a dedup run read and wrote
#[derive(Debug, Clone, Serialize)]
pub struct DedupReport {
    pub strategy: String,
    pub fuzzy_threshold: f64,
    pub max_year_gap: i32,
    pub inputs: Vec<PathBuf>,
    /// Lines whose record id had already been read from an earlier input
    pub repeated_records: usize,
    pub stats: DedupStats,
    pub clusters_path: PathBuf,
    pub fused_path: PathBuf,
}

#[derive(Serialize)]
struct ClusterRecord<'a> {
    id: usize,
    members: Vec<&'a str>,
}

#[derive(Serialize)]
struct ClustersFile<'a> {
    clusters: Vec<ClusterRecord<'a>>,
    membership: &'a BTreeMap<String, usize>,
}

/// Expand inputs: files are taken as-is, directories contribute every
/// provider aggregate beneath them (or, failing that, every `.jsonl` file).
pub fn collect_inputs(inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for input in inputs {
        if input.is_dir() {
            let mut aggregates = Vec::new();
            let mut streams = Vec::new();
            walk(input, 0, &mut aggregates, &mut streams);
            aggregates.sort();
            streams.sort();
            files.extend(if aggregates.is_empty() { streams } else { aggregates });
        } else {
            files.push(input.clone());
        }
    }
    files
}

fn walk(dir: &Path, depth: usize, aggregates: &mut Vec<PathBuf>, streams: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::warn!("Cannot read directory {}", dir.display());
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if depth < 3 {
                walk(&path, depth + 1, aggregates, streams);
            }
        } else if path.file_name().is_some_and(|n| n == AGGREGATE_FILE) {
            aggregates.push(path);
        } else if path.extension().is_some_and(|e| e == "jsonl")
            && path.file_name().is_some_and(|n| n != FUSED_FILE)
        {
            streams.push(path);
        }
    }
}

/// Read, cluster, fuse and write `clusters.json`, `fused.jsonl` and
/// `dedup_summary.json` into `output_dir`.
pub fn deduplicate_files(
    inputs: &[PathBuf],
    output_dir: &Path,
    config: &DedupConfig,
    ranking: &TrustRanking,
) -> Result<DedupReport, DedupError> {
    let deduplicator = Deduplicator::new(config.clone())?;
    let files = collect_inputs(inputs);

    let mut docs: Vec<Document> = Vec::new();
    let mut seen = HashSet::new();
    let mut repeated_records = 0;
    for file in &files {
        let batch: Vec<Document> = read_jsonl(file)?;
        tracing::info!("Read {} records from {}", batch.len(), file.display());
        for doc in batch {
            if seen.insert(doc.record_id()) {
                docs.push(doc);
            } else {
                repeated_records += 1;
            }
        }
    }
    if docs.is_empty() {
        return Err(DedupError::NoInput);
    }
    if repeated_records > 0 {
        tracing::debug!("Ignored {} repeated records", repeated_records);
    }

    let result = deduplicator.cluster(&docs);
    let record_ids: Vec<String> = docs.iter().map(Document::record_id).collect();

    let clusters_path = output_dir.join(CLUSTERS_FILE);
    let clusters_file = ClustersFile {
        clusters: result
            .clusters
            .iter()
            .map(|cluster| ClusterRecord {
                id: cluster.id,
                members: cluster
                    .members
                    .iter()
                    .map(|&m| record_ids[m].as_str())
                    .collect(),
            })
            .collect(),
        membership: &result.membership,
    };
    write_json_atomic(&clusters_path, &clusters_file)?;

    let fused_path = output_dir.join(FUSED_FILE);
    let mut slots: Vec<Option<Document>> = docs.into_iter().map(Some).collect();
    let mut writer = JsonlWriter::create(&fused_path)?;
    for cluster in &result.clusters {
        let members: Vec<Document> = cluster
            .members
            .iter()
            .filter_map(|&m| slots[m].take())
            .collect();
        if let Some(fused) = fuse(members, ranking) {
            writer.write(&fused)?;
        }
    }
    writer.flush()?;

    let report = DedupReport {
        strategy: config.strategy.to_string(),
        fuzzy_threshold: config.fuzzy_threshold,
        max_year_gap: config.max_year_gap,
        inputs: files,
        repeated_records,
        stats: result.stats,
        clusters_path,
        fused_path,
    };
    write_json_atomic(&output_dir.join(SUMMARY_FILE), &report)?;

    tracing::info!(
        "Dedup finished: {} records -> {} unique ({:.1}% duplicates)",
        report.stats.identified,
        report.stats.unique,
        report.stats.duplicate_rate * 100.0
    );
    Ok(report)
}

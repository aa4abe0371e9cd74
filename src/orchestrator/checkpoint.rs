//! Per-unit checkpoint records.
//!
//! A checkpoint is rewritten atomically after every page, so it always
//! describes a state the unit's output stream has already reached.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::sources::ContinuationToken;
use crate::utils::{read_json, write_json_atomic, JsonlError};

/// Format version of [`Checkpoint`]; older or newer records are ignored
pub const CHECKPOINT_VERSION: u32 = 1;

/// Lifecycle of a (provider, query) unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    InProgress,
    /// Results exhausted or the result cap reached
    Complete,
    /// Aborted, or stopped by an error after records were emitted
    Partial,
    /// Stopped by an error before any record was emitted
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::InProgress => "in_progress",
            UnitStatus::Complete => "complete",
            UnitStatus::Partial => "partial",
            UnitStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted progress of one unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub provider: String,
    pub query_id: String,
    /// Provider-native query the token belongs to
    pub provider_query: String,
    /// Token of the next page to fetch; `None` means the first page
    pub continuation: Option<ContinuationToken>,
    pub emitted_ids: BTreeSet<String>,
    pub pages: u64,
    pub records_dropped: u64,
    pub records_filtered: u64,
    pub duplicates_skipped: u64,
    pub status: UnitStatus,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(provider: &str, query_id: &str, provider_query: &str) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            provider: provider.to_string(),
            query_id: query_id.to_string(),
            provider_query: provider_query.to_string(),
            continuation: None,
            emitted_ids: BTreeSet::new(),
            pages: 0,
            records_dropped: 0,
            records_filtered: 0,
            duplicates_skipped: 0,
            status: UnitStatus::InProgress,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Load a checkpoint, `None` when absent or written in another format version
    pub fn load(path: &Path) -> Result<Option<Self>, JsonlError> {
        let value: Option<serde_json::Value> = read_json(path)?;
        let Some(value) = value else {
            return Ok(None);
        };
        let version = value.get("version").and_then(serde_json::Value::as_u64);
        if version != Some(u64::from(CHECKPOINT_VERSION)) {
            tracing::warn!(
                "Ignoring checkpoint {} with version {:?}",
                path.display(),
                version
            );
            return Ok(None);
        }
        match serde_json::from_value(value) {
            Ok(checkpoint) => Ok(Some(checkpoint)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable checkpoint {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Stamp and write atomically
    pub fn save(&mut self, path: &Path) -> Result<(), JsonlError> {
        self.updated_at = Utc::now();
        write_json_atomic(path, self)
    }

    /// Whether this checkpoint can continue the given unit
    pub fn resumes(&self, provider: &str, query_id: &str, provider_query: &str) -> bool {
        self.provider == provider
            && self.query_id == query_id
            && self.provider_query == provider_query
    }

    pub fn records_emitted(&self) -> usize {
        self.emitted_ids.len()
    }
}

/// Files owned by one unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPaths {
    pub results: PathBuf,
    pub checkpoint: PathBuf,
}

impl UnitPaths {
    /// `<out>/<provider>/<query_id>_results.jsonl` and
    /// `<out>/<provider>/<query_id>.checkpoint.json`
    pub fn new(output_dir: &Path, provider: &str, query_id: &str) -> Self {
        let dir = output_dir.join(file_component(provider));
        let stem = file_component(query_id);
        Self {
            results: dir.join(format!("{}_results.jsonl", stem)),
            checkpoint: dir.join(format!("{}.checkpoint.json", stem)),
        }
    }
}

/// Replace characters that are unsafe in a file name
pub fn file_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "_".to_string(),
        _ => cleaned,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("openalex/Q01.checkpoint.json");

        let mut checkpoint = Checkpoint::new("openalex", "Q01", "search=x");
        checkpoint.continuation = Some(ContinuationToken::new("IlsxNjk"));
        checkpoint.emitted_ids.insert("openalex:w1".to_string());
        checkpoint.pages = 1;
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded, checkpoint);
        assert!(loaded.resumes("openalex", "Q01", "search=x"));
        assert!(!loaded.resumes("openalex", "Q01", "search=y"));
        assert_eq!(loaded.records_emitted(), 1);
    }

    #[test]
    fn test_other_versions_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("Q01.checkpoint.json");
        std::fs::write(&path, r#"{"version": 0, "provider": "arxiv"}"#).unwrap();
        assert!(Checkpoint::load(&path).unwrap().is_none());

        std::fs::write(&path, r#"{"version": 1, "provider": "arxiv"}"#).unwrap();
        assert!(Checkpoint::load(&path).unwrap().is_none());

        assert!(Checkpoint::load(&dir.path().join("missing.json")).unwrap().is_none());
    }

    #[test]
    fn test_unit_paths() {
        let paths = UnitPaths::new(Path::new("/out"), "crossref", "Q 01/a");
        assert_eq!(paths.results, PathBuf::from("/out/crossref/Q_01_a_results.jsonl"));
        assert_eq!(paths.checkpoint, PathBuf::from("/out/crossref/Q_01_a.checkpoint.json"));
        assert_eq!(file_component(".."), "_");
    }
}

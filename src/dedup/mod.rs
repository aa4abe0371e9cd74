//! Duplicate clustering over an aggregated document set.
//!
//! Clustering runs in three phases over a single [`UnionFind`]:
//!
//! 1. **Identifiers**: documents sharing any normalized identifier value are
//!    merged, whatever the identifier kind.
//! 2. **Exact titles**: documents whose titles reduce to the same
//!    alphanumeric key are merged.
//! 3. **Fuzzy titles**: documents with a year are bucketed into year blocks
//!    of width `2 * max_year_gap + 1`, and only pairs in the same or adjacent
//!    block that are still in different clusters are considered. A cheap
//!    word-overlap filter runs before the edit-distance score. Blocks are
//!    scored in parallel and the accepted pairs merged afterwards.
//!
//! Because union-find merges are commutative the resulting partition does not
//! depend on input order.

mod output;
mod similarity;
mod union_find;

pub use output::{collect_inputs, deduplicate_files, DedupReport, CLUSTERS_FILE, FUSED_FILE, SUMMARY_FILE};
pub use similarity::{title_score, token_overlap, TitleProfile};
pub use union_find::UnionFind;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::models::Document;
use crate::normalize;

/// Minimum share of the smaller title's words the other title must contain
const MIN_TOKEN_OVERLAP: f64 = 0.5;

/// Clustering strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Identifier, exact-title and high-threshold fuzzy title matching
    #[default]
    Conservative,
    /// Embedding similarity; not implemented
    Semantic,
    /// Conservative plus embeddings; not implemented
    Hybrid,
}

impl DedupStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DedupStrategy::Conservative => "conservative",
            DedupStrategy::Semantic => "semantic",
            DedupStrategy::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for DedupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplication errors
#[derive(Debug, thiserror::Error)]
pub enum DedupError {
    #[error("Dedup strategy '{0}' is not implemented")]
    StrategyNotImplemented(DedupStrategy),

    #[error(transparent)]
    Output(#[from] crate::utils::JsonlError),

    #[error("No input documents found")]
    NoInput,
}

/// Deduplication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub strategy: DedupStrategy,

    /// Minimum fuzzy title score (0-100) for a merge
    pub fuzzy_threshold: f64,

    /// Largest publication-year difference a fuzzy merge may bridge
    pub max_year_gap: i32,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::Conservative,
            fuzzy_threshold: 97.0,
            max_year_gap: 1,
        }
    }
}

/// One group of duplicates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: usize,
    /// Indices into the input slice, ordered by record id
    pub members: Vec<usize>,
}

/// Counts in the style of a PRISMA identification step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupStats {
    /// Records going in
    pub identified: usize,
    /// Records merged by identifier or exact title
    pub exact_duplicates_removed: usize,
    /// Further records merged by fuzzy title matching
    pub fuzzy_duplicates_removed: usize,
    /// Clusters coming out
    pub unique: usize,
    /// Share of input records that were duplicates
    pub duplicate_rate: f64,
    /// Size of the largest cluster
    pub largest_cluster: usize,
    /// Input records per provider
    pub per_provider: BTreeMap<String, usize>,
}

/// Clusters plus the record-id membership map
#[derive(Debug, Clone, PartialEq)]
pub struct DedupResult {
    pub clusters: Vec<Cluster>,
    /// `record_id -> cluster id`
    pub membership: BTreeMap<String, usize>,
    pub stats: DedupStats,
}

/// Duplicate clustering engine
#[derive(Debug, Clone)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    /// Fails for strategies that have no implementation
    pub fn new(config: DedupConfig) -> Result<Self, DedupError> {
        match config.strategy {
            DedupStrategy::Conservative => Ok(Self { config }),
            other => Err(DedupError::StrategyNotImplemented(other)),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Cluster `docs`. Cluster ids follow the order of each cluster's
    /// smallest record id.
    pub fn cluster(&self, docs: &[Document]) -> DedupResult {
        let record_ids: Vec<String> = docs.iter().map(Document::record_id).collect();
        let mut uf = UnionFind::new(docs.len());

        merge_by_identifier(docs, &mut uf);
        merge_by_title_key(docs, &mut uf);
        let after_exact = uf.components();

        let edges = self.fuzzy_edges(docs, &uf.roots());
        for (a, b) in edges {
            uf.union(a, b);
        }
        let after_fuzzy = uf.components();

        tracing::info!(
            "Clustered {} records: {} after exact matching, {} after fuzzy matching",
            docs.len(),
            after_exact,
            after_fuzzy
        );

        let mut groups = uf.groups();
        for group in &mut groups {
            group.sort_by(|a, b| record_ids[*a].cmp(&record_ids[*b]).then(a.cmp(b)));
        }
        groups.sort_by(|a, b| record_ids[a[0]].cmp(&record_ids[b[0]]).then(a[0].cmp(&b[0])));

        let clusters: Vec<Cluster> = groups
            .into_iter()
            .enumerate()
            .map(|(id, members)| Cluster { id, members })
            .collect();

        let mut membership = BTreeMap::new();
        for cluster in &clusters {
            for &member in &cluster.members {
                membership.insert(record_ids[member].clone(), cluster.id);
            }
        }

        let mut per_provider = BTreeMap::new();
        for doc in docs {
            *per_provider.entry(doc.provider.clone()).or_insert(0) += 1;
        }

        let identified = docs.len();
        let stats = DedupStats {
            identified,
            exact_duplicates_removed: identified - after_exact,
            fuzzy_duplicates_removed: after_exact - after_fuzzy,
            unique: after_fuzzy,
            duplicate_rate: if identified == 0 {
                0.0
            } else {
                (identified - after_fuzzy) as f64 / identified as f64
            },
            largest_cluster: clusters.iter().map(|c| c.members.len()).max().unwrap_or(0),
            per_provider,
        };

        DedupResult {
            clusters,
            membership,
            stats,
        }
    }

    /// Candidate pairs accepted by the fuzzy phase.
    ///
    /// `roots` is the partition after the exact phases; pairs already in one
    /// cluster are not scored.
    fn fuzzy_edges(&self, docs: &[Document], roots: &[usize]) -> Vec<(usize, usize)> {
        let gap = self.config.max_year_gap.max(0);
        let width = 2 * gap + 1;
        let profiles: Vec<TitleProfile> = docs.iter().map(|d| TitleProfile::new(&d.title)).collect();

        let mut blocks: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
        for (index, doc) in docs.iter().enumerate() {
            if let Some(year) = doc.year {
                if !profiles[index].is_empty() {
                    blocks.entry(year.div_euclid(width)).or_default().push(index);
                }
            }
        }

        let block_keys: Vec<i32> = blocks.keys().copied().collect();
        let accept = |a: usize, b: usize| -> bool {
            if roots[a] == roots[b] {
                return false;
            }
            let (ya, yb) = match (docs[a].year, docs[b].year) {
                (Some(ya), Some(yb)) => (ya, yb),
                _ => return false,
            };
            if (ya - yb).abs() > gap {
                return false;
            }
            if token_overlap(&profiles[a].tokens, &profiles[b].tokens) < MIN_TOKEN_OVERLAP {
                return false;
            }
            title_score(&profiles[a].clean, &profiles[b].clean) >= self.config.fuzzy_threshold
        };

        block_keys
            .par_iter()
            .flat_map_iter(|key| {
                let empty = Vec::new();
                let current = &blocks[key];
                let next = blocks.get(&(key + 1)).unwrap_or(&empty);
                let mut edges = Vec::new();
                for (i, &a) in current.iter().enumerate() {
                    for &b in &current[i + 1..] {
                        if accept(a, b) {
                            edges.push((a, b));
                        }
                    }
                    for &b in next {
                        if accept(a, b) {
                            edges.push((a, b));
                        }
                    }
                }
                edges
            })
            .collect()
    }
}

fn merge_by_identifier(docs: &[Document], uf: &mut UnionFind) {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for (index, doc) in docs.iter().enumerate() {
        for (_, value) in doc.external_ids.iter() {
            match seen.get(value) {
                Some(&first) => {
                    uf.union(first, index);
                }
                None => {
                    seen.insert(value, index);
                }
            }
        }
    }
}

fn merge_by_title_key(docs: &[Document], uf: &mut UnionFind) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (index, doc) in docs.iter().enumerate() {
        let key = normalize::title_key(&doc.title);
        if key.is_empty() {
            continue;
        }
        match seen.get(&key) {
            Some(&first) => {
                uf.union(first, index);
            }
            None => {
                seen.insert(key, index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentBuilder;

    fn engine(threshold: f64, gap: i32) -> Deduplicator {
        Deduplicator::new(DedupConfig {
            strategy: DedupStrategy::Conservative,
            fuzzy_threshold: threshold,
            max_year_gap: gap,
        })
        .unwrap()
    }

    fn doc(title: &str, provider: &str, year: Option<i32>) -> DocumentBuilder {
        DocumentBuilder::new(title, provider).year(year)
    }

    fn partition(result: &DedupResult, docs: &[Document]) -> Vec<Vec<String>> {
        let mut groups: Vec<Vec<String>> = result
            .clusters
            .iter()
            .map(|c| c.members.iter().map(|&m| docs[m].record_id()).collect())
            .collect();
        groups.sort();
        groups
    }

    #[test]
    fn test_unimplemented_strategies_fail_fast() {
        for strategy in [DedupStrategy::Semantic, DedupStrategy::Hybrid] {
            let err = Deduplicator::new(DedupConfig {
                strategy,
                ..DedupConfig::default()
            })
            .unwrap_err();
            assert!(matches!(err, DedupError::StrategyNotImplemented(s) if s == strategy));
            assert!(err.to_string().contains(strategy.as_str()));
        }
    }

    #[test]
    fn test_shared_identifier_any_kind() {
        let docs = vec![
            doc("Alpha", "openalex", Some(2020))
                .external_id("openalex_id", "W1")
                .external_id("pubmed_id", "999")
                .build(),
            doc("Completely different", "pubmed", Some(2010))
                .external_id("pubmed_id", "999")
                .build(),
            doc("Gamma", "crossref", Some(2020)).doi("10.1/g").build(),
        ];
        let result = engine(97.0, 1).cluster(&docs);
        assert_eq!(result.stats.unique, 2);
        assert_eq!(result.stats.exact_duplicates_removed, 1);
        assert_eq!(
            result.membership[&docs[0].record_id()],
            result.membership[&docs[1].record_id()]
        );
    }

    #[test]
    fn test_identifier_normalization_merges() {
        let docs = vec![
            doc("A", "crossref", None).doi("https://doi.org/10.5/XYZ").build(),
            doc("B", "openalex", None).doi("10.5/xyz").build(),
        ];
        let result = engine(97.0, 1).cluster(&docs);
        assert_eq!(result.clusters.len(), 1);
    }

    #[test]
    fn test_exact_title_ignores_year() {
        let docs = vec![
            doc("Graph Neural Networks: A Review", "arxiv", Some(2019)).build(),
            doc("graph neural networks a review", "crossref", Some(2021)).build(),
            doc("", "crossref", None).build(),
            doc("", "openalex", None).build(),
        ];
        let result = engine(97.0, 1).cluster(&docs);
        // empty titles never collapse together
        assert_eq!(result.stats.unique, 3);
    }

    #[test]
    fn test_exact_title_folds_accents() {
        let docs = vec![
            doc("Café rust resistance in Coffea arabica", "crossref", Some(2020)).build(),
            doc("Cafe rust resistance in Coffea arabica", "pubmed", None).build(),
        ];
        let result = engine(97.0, 1).cluster(&docs);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(result.stats.exact_duplicates_removed, 1);
    }

    #[test]
    fn test_fuzzy_respects_threshold_and_year_gap() {
        let base = doc("Deep Learning for Crop Disease", "openalex", Some(2020)).build();
        let near = doc("Deep Learning for Crop Diseases", "arxiv", Some(2021)).build();
        let far = doc("Deep Learning for Crop Diseases", "pubmed", Some(2023)).build();
        let docs = vec![base, near, far];

        let strict = engine(97.0, 1).cluster(&docs);
        assert_eq!(strict.stats.unique, 2); // near and far share a title key
        assert_eq!(strict.stats.fuzzy_duplicates_removed, 0);

        let loose = engine(95.0, 1).cluster(&docs);
        assert_eq!(loose.stats.fuzzy_duplicates_removed, 1);
        assert_eq!(loose.stats.unique, 1);
    }

    #[test]
    fn test_fuzzy_never_merges_beyond_year_gap() {
        let docs = vec![
            doc("Attention is all you need", "arxiv", Some(2017)).build(),
            doc("Attention is all you need!", "crossref", Some(2017))
                .doi("10.9/x")
                .build(),
            doc("Attention is all you needs", "openalex", Some(2019)).build(),
        ];
        let result = engine(90.0, 1).cluster(&docs);
        assert_eq!(result.stats.unique, 2);
    }

    #[test]
    fn test_fuzzy_skips_documents_without_year() {
        let docs = vec![
            doc("Deep Learning for Crop Disease", "openalex", None).build(),
            doc("Deep Learning for Crop Diseases", "arxiv", None).build(),
        ];
        let result = engine(90.0, 1).cluster(&docs);
        assert_eq!(result.stats.unique, 2);
    }

    #[test]
    fn test_token_filter_rejects_low_overlap() {
        // high character similarity, low word overlap
        let docs = vec![
            doc("abcdx efgh ijkl mnop", "openalex", Some(2020)).build(),
            doc("abcd efghx ijkl mnopx", "arxiv", Some(2020)).build(),
        ];
        let result = engine(80.0, 1).cluster(&docs);
        assert_eq!(result.stats.unique, 2);
    }

    #[test]
    fn test_adjacent_blocks_are_compared() {
        // gap 1 gives blocks of three years: 2019..=2021 and 2022..=2024
        let docs = vec![
            doc("Robust crop disease detection", "openalex", Some(2021)).build(),
            doc("Robust crop disease detections", "arxiv", Some(2022)).build(),
        ];
        let result = engine(95.0, 1).cluster(&docs);
        assert_eq!(result.stats.unique, 1);
    }

    #[test]
    fn test_order_invariance() {
        let docs = vec![
            doc("Deep Learning for Crop Disease", "openalex", Some(2020))
                .doi("10.1/a")
                .build(),
            doc("Deep learning for crop disease.", "crossref", Some(2020))
                .doi("10.1/A")
                .build(),
            doc("Deep Learning for Crop Diseases", "arxiv", Some(2021)).build(),
            doc("Unrelated work on soil", "pubmed", Some(2018))
                .external_id("pubmed_id", "1")
                .build(),
            doc("Unrelated work on soils", "openalex", Some(2018)).build(),
        ];
        let mut reversed = docs.clone();
        reversed.reverse();

        let deduper = engine(95.0, 1);
        let a = deduper.cluster(&docs);
        let b = deduper.cluster(&reversed);
        assert_eq!(partition(&a, &docs), partition(&b, &reversed));
        assert_eq!(a.membership, b.membership);
        assert_eq!(a.stats, b.stats);
    }

    #[test]
    fn test_stats() {
        let docs = vec![
            doc("One", "crossref", Some(2020)).doi("10.1/1").build(),
            doc("One", "openalex", Some(2020)).build(),
            doc("Two", "openalex", Some(2020)).build(),
        ];
        let stats = engine(97.0, 1).cluster(&docs).stats;
        assert_eq!(stats.identified, 3);
        assert_eq!(stats.unique, 2);
        assert_eq!(stats.largest_cluster, 2);
        assert_eq!(stats.per_provider["openalex"], 2);
        assert!((stats.duplicate_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input() {
        let result = engine(97.0, 1).cluster(&[]);
        assert!(result.clusters.is_empty());
        assert_eq!(result.stats.unique, 0);
        assert_eq!(result.stats.duplicate_rate, 0.0);
    }
}

//! Golden-record synthesis for duplicate clusters.
//!
//! Every field is chosen independently from the cluster members, walking them
//! from the most to the least trusted provider. Nothing a member knows is
//! discarded: identifiers are unioned, secondary URLs are kept as related
//! links, and author identifiers are borrowed across providers when the match
//! is unambiguous.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::models::{Author, Document, ExternalIds};

/// Abstracts this short are treated as stubs
const MIN_ABSTRACT_LEN: usize = 50;

/// Provider trust ranking; lower rank wins.
///
/// Providers in one tier share a rank. Unlisted providers rank below every
/// tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustRanking {
    tiers: Vec<Vec<String>>,
    ranks: HashMap<String, usize>,
}

impl Default for TrustRanking {
    fn default() -> Self {
        Self::new(vec![
            vec!["crossref".to_string(), "pubmed".to_string()],
            vec!["openalex".to_string()],
            vec!["semantic_scholar".to_string()],
            vec!["arxiv".to_string()],
        ])
    }
}

impl TrustRanking {
    /// Build from tiers, most trusted first
    pub fn new(tiers: Vec<Vec<String>>) -> Self {
        let mut ranks = HashMap::new();
        let mut kept = Vec::new();
        for tier in tiers {
            let tier: Vec<String> = tier
                .into_iter()
                .map(|id| id.trim().to_lowercase())
                .filter(|id| !id.is_empty() && !ranks.contains_key(id))
                .collect();
            if tier.is_empty() {
                continue;
            }
            for id in &tier {
                ranks.insert(id.clone(), kept.len());
            }
            kept.push(tier);
        }
        Self { tiers: kept, ranks }
    }

    /// Parse config entries; `"crossref|pubmed"` puts both in one tier
    pub fn from_config(entries: &[String]) -> Self {
        Self::new(
            entries
                .iter()
                .map(|entry| entry.split('|').map(str::to_string).collect())
                .collect(),
        )
    }

    pub fn to_config(&self) -> Vec<String> {
        self.tiers.iter().map(|tier| tier.join("|")).collect()
    }

    pub fn rank(&self, provider: &str) -> usize {
        self.ranks
            .get(provider)
            .or_else(|| self.ranks.get(&provider.to_lowercase()))
            .copied()
            .unwrap_or(self.tiers.len())
    }
}

fn boilerplate_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(
                r"(?i)^\s*(©|\(c\)|copyright\b|no abstract\b|abstract (is )?not available|not available\b)",
            )
            .ok()
        })
        .as_ref()
}

/// Whether an abstract carries real content
pub fn is_valid_abstract(text: &str) -> bool {
    let text = text.trim();
    if text.chars().count() <= MIN_ABSTRACT_LEN {
        return false;
    }
    !boilerplate_pattern().is_some_and(|re| re.is_match(text))
}

/// Fuse one cluster into a single document.
///
/// A single-member cluster is returned unchanged. Members are ranked by
/// provider trust, then by record id.
pub fn fuse(members: Vec<Document>, ranking: &TrustRanking) -> Option<Document> {
    if members.len() <= 1 {
        return members.into_iter().next();
    }

    let mut ranked: Vec<(usize, String, Document)> = members
        .into_iter()
        .map(|doc| (ranking.rank(&doc.provider), doc.record_id(), doc))
        .collect();
    ranked.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    let docs: Vec<Document> = ranked.into_iter().map(|(_, _, doc)| doc).collect();
    let primary = &docs[0];

    let title = docs
        .iter()
        .map(|d| d.title.trim())
        .find(|t| !t.is_empty())
        .unwrap_or_default()
        .to_string();

    let mut external_ids = ExternalIds::new();
    for doc in &docs {
        external_ids.merge(&doc.external_ids);
    }

    let (url, related_urls) = fuse_urls(&docs);

    Some(Document {
        title,
        authors: fuse_authors(&docs),
        year: docs.iter().find_map(|d| d.year),
        r#abstract: fuse_abstract(&docs),
        external_ids,
        cited_by_count: docs.iter().filter_map(|d| d.cited_by_count).max(),
        url,
        related_urls,
        provider: primary.provider.clone(),
    })
}

/// Longest valid abstract, earliest in trust order on ties; falls back to the
/// longest non-empty one.
fn fuse_abstract(docs: &[Document]) -> Option<String> {
    let longest = |valid_only: bool| {
        let mut best: Option<&str> = None;
        for text in docs.iter().filter_map(|d| d.r#abstract.as_deref()) {
            let text = text.trim();
            if text.is_empty() || (valid_only && !is_valid_abstract(text)) {
                continue;
            }
            if best.map_or(true, |b| text.chars().count() > b.chars().count()) {
                best = Some(text);
            }
        }
        best.map(str::to_string)
    };
    longest(true).or_else(|| longest(false))
}

fn fuse_authors(docs: &[Document]) -> Vec<Author> {
    let Some(base_index) = docs.iter().position(|d| !d.authors.is_empty()) else {
        return Vec::new();
    };

    // name key -> identifiers seen on other members
    let mut known: HashMap<String, BTreeSet<&str>> = HashMap::new();
    for (index, doc) in docs.iter().enumerate() {
        if index == base_index {
            continue;
        }
        for author in &doc.authors {
            if let Some(id) = author.identifier.as_deref() {
                known.entry(author.match_key()).or_default().insert(id);
            }
        }
    }

    docs[base_index]
        .authors
        .iter()
        .map(|author| {
            let mut author = author.clone();
            if author.identifier.is_none() {
                if let Some(ids) = known.get(&author.match_key()) {
                    if ids.len() == 1 {
                        author.identifier = ids.iter().next().map(|id| id.to_string());
                    }
                }
            }
            author
        })
        .collect()
}

fn fuse_urls(docs: &[Document]) -> (Option<String>, Vec<String>) {
    let primary = docs.iter().find_map(|d| d.url.clone());
    let mut related: Vec<String> = Vec::new();
    for doc in docs {
        for url in doc.url.iter().chain(doc.related_urls.iter()) {
            if Some(url) != primary.as_ref() && !related.contains(url) {
                related.push(url.clone());
            }
        }
    }
    (primary, related)
}

//! Normalization of provider records into canonical [`Document`]s.
//!
//! Adapters own the provider-specific field mapping; this module holds the
//! pieces every adapter and the dedup engine share:
//!
//! - identifier normalization (trim, lowercase, DOI prefix stripping)
//! - title keys used for exact-title blocking and fuzzy comparison
//! - text cleanup for abstracts that arrive with markup or as inverted indexes
//! - [`validate`], the final gate a record passes before it is emitted

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::models::Document;

/// Why a raw record could not become a [`Document`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizationError {
    /// The record carries no usable title
    #[error("{provider}: record has no title")]
    MissingTitle { provider: String },

    /// The payload does not have the shape the adapter expects
    #[error("{provider}: invalid payload: {reason}")]
    InvalidPayload { provider: String, reason: String },
}

impl NormalizationError {
    pub fn invalid(provider: &str, reason: impl std::fmt::Display) -> Self {
        NormalizationError::InvalidPayload {
            provider: provider.to_string(),
            reason: reason.to_string(),
        }
    }
}

const DOI_PREFIXES: &[&str] = &[
    "https://doi.org/",
    "http://doi.org/",
    "https://dx.doi.org/",
    "http://dx.doi.org/",
    "doi.org/",
    "doi:",
];

/// Normalize a DOI: strip resolver prefixes, trim and lowercase.
pub fn normalize_doi(raw: &str) -> Option<String> {
    let mut doi = raw.trim().to_lowercase();
    for prefix in DOI_PREFIXES {
        if let Some(rest) = doi.strip_prefix(prefix) {
            doi = rest.trim().to_string();
            break;
        }
    }
    (!doi.is_empty()).then_some(doi)
}

/// Normalize any external identifier value for its kind.
///
/// Returns `None` for values that are empty after trimming.
pub fn normalize_identifier(kind: &str, raw: &str) -> Option<String> {
    if kind == "doi" {
        return normalize_doi(raw);
    }
    let value = raw.trim().to_lowercase();
    (!value.is_empty()).then_some(value)
}

/// Decompose and drop combining marks, so `Café` reads as `Cafe`.
fn fold_diacritics(text: &str) -> impl Iterator<Item = char> + '_ {
    text.nfd().filter(|c| !is_combining_mark(*c))
}

/// Exact-title blocking key: lowercase alphanumerics only, accents folded.
pub fn title_key(title: &str) -> String {
    fold_diacritics(title)
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Lowercase title with accents folded, punctuation removed and whitespace
/// collapsed.
pub fn clean_title(title: &str) -> String {
    fold_diacritics(title)
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Unique lowercase words of a title.
pub fn title_tokens(title: &str) -> HashSet<String> {
    clean_title(title)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Trim and collapse whitespace; `None` when nothing is left.
pub fn clean_text(raw: &str) -> Option<String> {
    let text = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    (!text.is_empty()).then_some(text)
}

fn markup_regex() -> Option<&'static Regex> {
    static MARKUP: OnceLock<Option<Regex>> = OnceLock::new();
    MARKUP.get_or_init(|| Regex::new(r"<[^>]+>").ok()).as_ref()
}

/// Remove XML/HTML tags (Crossref ships JATS abstracts) and clean the rest.
pub fn strip_markup(raw: &str) -> Option<String> {
    match markup_regex() {
        Some(re) => clean_text(&re.replace_all(raw, " ")),
        None => clean_text(raw),
    }
}

/// Rebuild an abstract from an OpenAlex-style inverted index
/// (`word -> [positions]`).
pub fn abstract_from_inverted_index(index: &BTreeMap<String, Vec<usize>>) -> Option<String> {
    let mut positioned: Vec<(usize, &str)> = index
        .iter()
        .flat_map(|(word, positions)| positions.iter().map(move |p| (*p, word.as_str())))
        .collect();
    positioned.sort_unstable_by_key(|(pos, _)| *pos);
    let text = positioned
        .into_iter()
        .map(|(_, word)| word)
        .collect::<Vec<_>>()
        .join(" ");
    clean_text(&text)
}

/// Pull a plausible publication year out of a date string (`2021-03-04`,
/// `2021 Mar`, `2021`).
pub fn parse_year(raw: &str) -> Option<i32> {
    raw.split(|c: char| !c.is_ascii_digit())
        .filter(|part| part.len() == 4)
        .filter_map(|part| part.parse::<i32>().ok())
        .find(|year| (1000..3000).contains(year))
}

/// Final gate for a normalized record.
pub fn validate(mut doc: Document) -> Result<Document, NormalizationError> {
    match clean_text(&doc.title) {
        Some(title) => doc.title = title,
        None => {
            return Err(NormalizationError::MissingTitle {
                provider: doc.provider,
            })
        }
    }
    doc.r#abstract = doc.r#abstract.as_deref().and_then(clean_text);
    doc.url = doc.url.as_deref().and_then(clean_text);
    Ok(doc)
}

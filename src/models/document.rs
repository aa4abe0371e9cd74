//! Canonical bibliographic record shared by every pipeline stage.

use serde::de::Deserializer;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::normalize;

/// An author as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    /// Display name
    pub name: String,

    /// Persistent author identifier (ORCID, provider author id)
    #[serde(default)]
    pub identifier: Option<String>,
}

impl Author {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifier: None,
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        let identifier = identifier.into();
        if !identifier.trim().is_empty() {
            self.identifier = Some(identifier.trim().to_string());
        }
        self
    }

    /// Case and punctuation insensitive form of the name, for matching
    /// the same person across providers.
    pub fn match_key(&self) -> String {
        normalize::clean_title(&self.name)
    }
}

/// External identifiers keyed by kind (`doi`, `arxiv_id`, `openalex_id`, ...).
///
/// Values are normalized on insert, and a kind may hold several values. When
/// serialized as part of a [`Document`] each kind becomes a top-level key whose
/// value is a string, or an array when more than one value is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExternalIds(BTreeMap<String, BTreeSet<String>>);

impl ExternalIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a normalized value; empty values are ignored.
    ///
    /// Returns whether the value was new.
    pub fn insert(&mut self, kind: &str, value: &str) -> bool {
        let kind = kind.trim().to_lowercase();
        match normalize::normalize_identifier(&kind, value) {
            Some(value) if !kind.is_empty() => self.0.entry(kind).or_default().insert(value),
            _ => false,
        }
    }

    pub fn get(&self, kind: &str) -> Option<&BTreeSet<String>> {
        self.0.get(kind)
    }

    /// Smallest value of a kind
    pub fn first(&self, kind: &str) -> Option<&str> {
        self.0
            .get(kind)
            .and_then(|values| values.iter().next())
            .map(String::as_str)
    }

    pub fn contains(&self, kind: &str, value: &str) -> bool {
        self.0.get(kind).is_some_and(|values| values.contains(value))
    }

    /// All `(kind, value)` pairs in kind order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(kind, values)| {
            values
                .iter()
                .map(move |value| (kind.as_str(), value.as_str()))
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Number of `(kind, value)` pairs
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Add every pair of `other`
    pub fn merge(&mut self, other: &ExternalIds) {
        for (kind, values) in &other.0 {
            self.0
                .entry(kind.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
    }

    /// Whether every pair of `other` is present here
    pub fn is_superset(&self, other: &ExternalIds) -> bool {
        other.iter().all(|(kind, value)| self.contains(kind, value))
    }

    fn is_identifier_key(key: &str) -> bool {
        key == "doi" || (key.ends_with("_id") && key != "query_id")
    }
}

impl Serialize for ExternalIds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (kind, values) in &self.0 {
            if values.len() == 1 {
                if let Some(value) = values.iter().next() {
                    map.serialize_entry(kind, value)?;
                }
            } else {
                map.serialize_entry(kind, values)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ExternalIds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Flattened into Document, so every unclaimed key lands here. Only
        // identifier-shaped keys with string values are kept.
        let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
        let mut ids = ExternalIds::new();
        for (key, value) in raw {
            if !Self::is_identifier_key(&key) {
                continue;
            }
            match value {
                serde_json::Value::String(s) => {
                    ids.insert(&key, &s);
                }
                serde_json::Value::Array(items) => {
                    for item in items.iter().filter_map(|v| v.as_str()) {
                        ids.insert(&key, item);
                    }
                }
                serde_json::Value::Number(n) => {
                    ids.insert(&key, &n.to_string());
                }
                _ => {}
            }
        }
        Ok(ids)
    }
}

/// A canonical bibliographic record
///
/// Produced by provider adapters, consumed by the dedup and fusion engines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Title (never empty once validated)
    pub title: String,

    /// Ordered author list
    #[serde(default)]
    pub authors: Vec<Author>,

    /// Publication year
    #[serde(default)]
    pub year: Option<i32>,

    /// Abstract text
    #[serde(default, rename = "abstract")]
    pub r#abstract: Option<String>,

    /// External identifiers, flattened into top-level keys
    #[serde(flatten)]
    pub external_ids: ExternalIds,

    /// Citation count
    #[serde(default)]
    pub cited_by_count: Option<u64>,

    /// Primary landing page
    #[serde(default)]
    pub url: Option<String>,

    /// Fallback links, in preference order
    #[serde(default)]
    pub related_urls: Vec<String>,

    /// Provider that produced the record
    pub provider: String,
}

impl Document {
    /// Create a document with only a title and provider
    pub fn new(title: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            authors: Vec::new(),
            year: None,
            r#abstract: None,
            external_ids: ExternalIds::new(),
            cited_by_count: None,
            url: None,
            related_urls: Vec::new(),
            provider: provider.into(),
        }
    }

    pub fn doi(&self) -> Option<&str> {
        self.external_ids.first("doi")
    }

    pub fn abstract_text(&self) -> &str {
        self.r#abstract.as_deref().unwrap_or("")
    }

    /// Stable record identifier: `provider:key`.
    ///
    /// The key is the provider-native id when present, then the DOI, then the
    /// arXiv id, then any identifier, and finally a fingerprint of the
    /// normalized title and year.
    pub fn record_id(&self) -> String {
        let native = format!("{}_id", self.provider);
        let key = self
            .external_ids
            .first(&native)
            .or_else(|| self.external_ids.first("doi"))
            .or_else(|| self.external_ids.first("arxiv_id"))
            .or_else(|| self.external_ids.iter().next().map(|(_, value)| value))
            .map(str::to_string)
            .unwrap_or_else(|| self.title_fingerprint());
        format!("{}:{}", self.provider, key)
    }

    fn title_fingerprint(&self) -> String {
        let year = self.year.map(|y| y.to_string()).unwrap_or_default();
        let digest = md5::compute(format!("{}|{}", normalize::title_key(&self.title), year));
        format!("{:x}", digest)
    }
}

/// Builder for creating Document instances
pub struct DocumentBuilder {
    doc: Document,
}

impl DocumentBuilder {
    pub fn new(title: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            doc: Document::new(title, provider),
        }
    }

    pub fn author(mut self, author: Author) -> Self {
        if !author.name.trim().is_empty() {
            self.doc.authors.push(author);
        }
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = Author>) -> Self {
        for author in authors {
            self = self.author(author);
        }
        self
    }

    pub fn year(mut self, year: Option<i32>) -> Self {
        self.doc.year = year;
        self
    }

    pub fn abstract_text(mut self, text: impl Into<String>) -> Self {
        self.doc.r#abstract = Some(text.into());
        self
    }

    pub fn maybe_abstract(mut self, text: Option<String>) -> Self {
        self.doc.r#abstract = text;
        self
    }

    pub fn external_id(mut self, kind: &str, value: &str) -> Self {
        self.doc.external_ids.insert(kind, value);
        self
    }

    pub fn doi(self, doi: &str) -> Self {
        self.external_id("doi", doi)
    }

    pub fn cited_by_count(mut self, count: Option<u64>) -> Self {
        self.doc.cited_by_count = count;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.trim().is_empty() {
            self.doc.url = Some(url);
        }
        self
    }

    pub fn related_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.trim().is_empty() && !self.doc.related_urls.contains(&url) {
            self.doc.related_urls.push(url);
        }
        self
    }

    pub fn build(self) -> Document {
        self.doc
    }
}

//! arXiv research source implementation.
//!
//! The arXiv API answers with an Atom feed. Entries are converted to a small
//! JSON payload at fetch time so that normalization works on the same
//! [`RawRecord`] shape as the JSON providers.

use async_trait::async_trait;
use feed_rs::parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::{Author, Document, DocumentBuilder, Query};
use crate::normalize::{self, NormalizationError};
use crate::sources::{ContinuationToken, Page, PaginationMode, RawRecord, Source, SourceError};
use crate::utils::HttpClient;

/// Base URL for arXiv API
const ARXIV_API_URL: &str = "https://export.arxiv.org/api/query";
/// Base URL for arXiv PDFs
const ARXIV_PDF_URL: &str = "https://arxiv.org/pdf";

const PER_PAGE: usize = 100;

/// The API refuses `start` values at or beyond this offset
const MAX_START: usize = 10_000;

/// arXiv research source
#[derive(Debug, Clone)]
pub struct ArxivSource {
    client: HttpClient,
    base_url: String,
}

impl ArxivSource {
    /// Create a new arXiv source
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: HttpClient::new(timeout),
            base_url: ARXIV_API_URL.to_string(),
        }
    }

    /// Full query endpoint URL, e.g. a mock server's `/api/query`
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Parse an arXiv ID from various formats
    ///
    /// Handles formats like:
    /// - "2301.12345"
    /// - "2301.12345v1" (version is stripped)
    /// - "arxiv:2301.12345"
    /// - "http://arxiv.org/abs/2301.12345v1"
    /// - "http://arxiv.org/abs/hep-th/9901001v2"
    pub fn parse_id(id: &str) -> Option<String> {
        let id = id.trim().to_lowercase();
        let id = match id.find("/abs/") {
            Some(pos) => &id[pos + 5..],
            None => id.strip_prefix("arxiv:").unwrap_or(&id),
        };
        let id = strip_version(id.trim_end_matches('/'));
        (!id.is_empty()).then(|| id.to_string())
    }

    /// Convert one Atom entry into a payload
    fn entry_payload(entry: &feed_rs::model::Entry) -> ArxivEntry {
        let doi = entry
            .links
            .iter()
            .find(|link| link.title.as_deref() == Some("doi"))
            .map(|link| link.href.clone());
        let pdf = entry
            .links
            .iter()
            .find(|link| {
                link.title.as_deref() == Some("pdf")
                    || link.media_type.as_deref() == Some("application/pdf")
            })
            .map(|link| link.href.clone());

        ArxivEntry {
            id: entry.id.clone(),
            title: entry.title.as_ref().map(|t| t.content.clone()),
            summary: entry.summary.as_ref().map(|s| s.content.clone()),
            authors: entry.authors.iter().map(|a| a.name.clone()).collect(),
            published: entry.published.map(|d| d.to_rfc3339()),
            doi,
            pdf,
        }
    }

    fn parse_entry(&self, entry: ArxivEntry) -> Result<Document, NormalizationError> {
        let title = entry
            .title
            .as_deref()
            .and_then(normalize::clean_text)
            .ok_or_else(|| NormalizationError::MissingTitle {
                provider: self.id().to_string(),
            })?;
        let arxiv_id = Self::parse_id(&entry.id)
            .ok_or_else(|| NormalizationError::invalid(self.id(), "entry has no arXiv id"))?;

        let mut builder = DocumentBuilder::new(title, self.id())
            .authors(entry.authors.into_iter().map(Author::new))
            .year(entry.published.as_deref().and_then(normalize::parse_year))
            .maybe_abstract(entry.summary.as_deref().and_then(normalize::clean_text))
            .external_id("arxiv_id", &arxiv_id)
            .url(format!("https://arxiv.org/abs/{}", arxiv_id))
            .related_url(
                entry
                    .pdf
                    .unwrap_or_else(|| format!("{}/{}", ARXIV_PDF_URL, arxiv_id)),
            );
        if let Some(doi) = entry.doi.as_deref() {
            builder = builder.doi(doi);
        }
        Ok(builder.build())
    }
}

/// `2301.12345v2` -> `2301.12345`
fn strip_version(id: &str) -> &str {
    match id.rfind('v') {
        Some(pos) if pos + 1 < id.len() && id[pos + 1..].bytes().all(|b| b.is_ascii_digit()) => {
            &id[..pos]
        }
        _ => id,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum QueryToken {
    Open,
    Close,
    Operator(&'static str),
    Term {
        field: &'static str,
        value: String,
        phrase: bool,
    },
}

/// Map a field prefix to its arXiv name; unknown fields search everything.
fn arxiv_field(name: &str) -> &'static str {
    match name.to_lowercase().as_str() {
        "ti" | "title" => "ti",
        "abs" | "abstract" => "abs",
        "au" | "author" => "au",
        "jr" | "venue" | "journal" => "jr",
        "cat" | "category" => "cat",
        "co" | "comment" => "co",
        "rn" => "rn",
        "id" => "id",
        "all" | "any" | "keyword" | "full_text" => "all",
        other => {
            tracing::warn!("Unknown arXiv field '{}', searching all fields", other);
            "all"
        }
    }
}

/// Split query text into parentheses, operators and (field-qualified) terms.
///
/// A `field:` prefix binds to the next word or quoted phrase only.
fn tokenize(text: &str) -> Vec<QueryToken> {
    let mut tokens = Vec::new();
    let mut field: Option<&'static str> = None;
    let mut rest = text.trim_start();

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('(') {
            tokens.push(QueryToken::Open);
            rest = after.trim_start();
            continue;
        }
        if let Some(after) = rest.strip_prefix(')') {
            tokens.push(QueryToken::Close);
            rest = after.trim_start();
            continue;
        }
        if let Some(after) = rest.strip_prefix('"') {
            let (phrase, after) = match after.find('"') {
                Some(end) => (&after[..end], &after[end + 1..]),
                None => (after, ""),
            };
            let phrase = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
            let field = field.take().unwrap_or("all");
            if !phrase.is_empty() {
                tokens.push(QueryToken::Term {
                    field,
                    value: phrase,
                    phrase: true,
                });
            }
            rest = after.trim_start();
            continue;
        }

        let name_len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if name_len > 0 && rest[name_len..].starts_with(':') {
            field = Some(arxiv_field(&rest[..name_len]));
            rest = rest[name_len + 1..].trim_start();
            continue;
        }

        let end = rest
            .find(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == '"')
            .unwrap_or(rest.len());
        let word = &rest[..end];
        rest = rest[end..].trim_start();

        let operator = match word.to_uppercase().as_str() {
            "AND" => Some("AND"),
            "OR" => Some("OR"),
            "NOT" | "ANDNOT" => Some("ANDNOT"),
            _ => None,
        };
        match operator {
            Some(op) if field.is_none() => tokens.push(QueryToken::Operator(op)),
            _ => tokens.push(QueryToken::Term {
                field: field.take().unwrap_or("all"),
                value: word.to_string(),
                phrase: false,
            }),
        }
    }
    tokens
}

fn append(out: &mut String, piece: &str) {
    if !out.is_empty() && !out.ends_with('(') && piece != ")" {
        out.push(' ');
    }
    out.push_str(piece);
}

/// Build an arXiv `search_query`.
///
/// Adjacent terms are joined with AND, `NOT` becomes `ANDNOT`, generic field
/// names map to arXiv prefixes (`title:` to `ti:`) and unbalanced
/// parentheses are repaired. Year bounds become a `submittedDate` window.
fn build_search_query(query: &Query) -> String {
    let mut out = String::new();
    let mut depth = 0usize;
    let mut previous_ends_operand = false;

    for token in tokenize(query.text.trim()) {
        let starts_operand = matches!(token, QueryToken::Open | QueryToken::Term { .. });
        if starts_operand && previous_ends_operand {
            append(&mut out, "AND");
        }
        match token {
            QueryToken::Open => {
                depth += 1;
                append(&mut out, "(");
                previous_ends_operand = false;
            }
            QueryToken::Close => {
                if depth == 0 || out.ends_with('(') {
                    continue;
                }
                depth -= 1;
                append(&mut out, ")");
                previous_ends_operand = true;
            }
            QueryToken::Operator(op) => {
                append(&mut out, op);
                previous_ends_operand = false;
            }
            QueryToken::Term {
                field,
                value,
                phrase,
            } => {
                let term = if phrase {
                    format!("{}:\"{}\"", field, value)
                } else {
                    format!("{}:{}", field, value)
                };
                append(&mut out, &term);
                previous_ends_operand = true;
            }
        }
    }
    for _ in 0..depth {
        append(&mut out, ")");
    }

    if out.is_empty() {
        out.push_str("all:*");
    }

    if query.year_min.is_some() || query.year_max.is_some() {
        let from = query
            .year_min
            .map(|y| format!("{}01010000", y))
            .unwrap_or_else(|| "*".to_string());
        let to = query
            .year_max
            .map(|y| format!("{}12312359", y))
            .unwrap_or_else(|| "*".to_string());
        return format!("({}) AND submittedDate:[{} TO {}]", out, from, to);
    }
    out
}

#[async_trait]
impl Source for ArxivSource {
    fn id(&self) -> &str {
        "arxiv"
    }

    fn name(&self) -> &str {
        "arXiv"
    }

    fn pagination(&self) -> PaginationMode {
        PaginationMode::Offset
    }

    fn translate_query(&self, query: &Query) -> String {
        build_search_query(query)
    }

    async fn fetch_page(
        &self,
        provider_query: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Page, SourceError> {
        let start = match token {
            Some(token) => token.offset()?,
            None => 0,
        };
        if start >= MAX_START {
            return Ok(Page::last(Vec::new()));
        }

        let request = self.client.client().get(&self.base_url).query(&[
            ("search_query", provider_query.to_string()),
            ("start", start.to_string()),
            ("max_results", PER_PAGE.to_string()),
            ("sortBy", "submittedDate".to_string()),
            ("sortOrder", "descending".to_string()),
        ]);
        let body = self.client.get_text(request).await?;

        let feed = parser::parse(body.as_bytes())
            .map_err(|e| SourceError::Malformed(format!("arXiv feed: {}", e)))?;

        let mut records = Vec::with_capacity(feed.entries.len());
        for entry in &feed.entries {
            let payload = serde_json::to_value(Self::entry_payload(entry))?;
            records.push(RawRecord::new(self.id(), payload));
        }

        tracing::debug!("arXiv page at {}: {} entries", start, records.len());

        let next = start + records.len();
        if records.len() < PER_PAGE || next >= MAX_START {
            if next >= MAX_START {
                tracing::info!("arXiv offset cap reached for query '{}'", provider_query);
            }
            Ok(Page::last(records))
        } else {
            Ok(Page::more(records, ContinuationToken::from_offset(next)))
        }
    }

    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError> {
        let entry: ArxivEntry = serde_json::from_value(record.payload.clone())
            .map_err(|e| NormalizationError::invalid(self.id(), e))?;
        self.parse_entry(entry)
    }
}

/// JSON form of an Atom entry
#[derive(Debug, Serialize, Deserialize)]
struct ArxivEntry {
    id: String,
    title: Option<String>,
    summary: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    published: Option<String>,
    doi: Option<String>,
    pdf: Option<String>,
}

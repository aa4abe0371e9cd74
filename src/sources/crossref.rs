//! CrossRef research source implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::models::{Author, Document, DocumentBuilder, Query};
use crate::normalize::{self, NormalizationError};
use crate::sources::{ContinuationToken, Page, PaginationMode, RawRecord, Source, SourceError};
use crate::utils::HttpClient;

const CROSSREF_API_BASE: &str = "https://api.crossref.org";

const ROWS: usize = 100;

/// Work types worth screening; other types (datasets, components, peer
/// reviews) are filtered out at the API
const ALLOWED_TYPES: &[&str] = &[
    "journal-article",
    "proceedings-article",
    "posted-content",
    "book-chapter",
    "monograph",
];

const SELECT_FIELDS: &str =
    "DOI,title,author,issued,URL,abstract,is-referenced-by-count,link,type";

/// CrossRef research source
///
/// Uses the CrossRef REST API with deep-paging cursors.
#[derive(Debug, Clone)]
pub struct CrossrefSource {
    client: HttpClient,
    base_url: String,
    mailto: Option<String>,
}

impl CrossrefSource {
    pub fn new(mailto: Option<String>, timeout: Duration) -> Self {
        Self {
            client: HttpClient::with_mailto(mailto.as_deref(), timeout),
            base_url: CROSSREF_API_BASE.to_string(),
            mailto,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn parse_item(&self, item: CRItem) -> Result<Document, NormalizationError> {
        let title = item
            .title
            .into_iter()
            .find(|t| !t.trim().is_empty())
            .ok_or_else(|| NormalizationError::MissingTitle {
                provider: self.id().to_string(),
            })?;

        let year = item
            .issued
            .as_ref()
            .and_then(|issued| issued.date_parts.first())
            .and_then(|parts| parts.first())
            .and_then(|year| *year);

        let authors = item.author.into_iter().filter_map(|author| {
            let name = match (author.given, author.family, author.name) {
                (Some(given), Some(family), _) => format!("{} {}", given.trim(), family.trim()),
                (None, Some(family), _) => family,
                (_, None, Some(name)) => name,
                _ => return None,
            };
            let mut parsed = Author::new(name);
            if let Some(orcid) = author.orcid.as_deref() {
                let orcid = orcid.trim_end_matches('/').rsplit('/').next().unwrap_or(orcid);
                parsed = parsed.with_identifier(orcid);
            }
            Some(parsed)
        });

        let mut builder = DocumentBuilder::new(title, self.id())
            .authors(authors)
            .year(year)
            .maybe_abstract(item.r#abstract.as_deref().and_then(normalize::strip_markup))
            .cited_by_count(item.is_referenced_by_count);
        if let Some(doi) = item.doi.as_deref() {
            builder = builder.doi(doi);
        }
        if let Some(url) = item.url {
            builder = builder.url(url);
        }
        for link in item.link {
            builder = builder.related_url(link.url);
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Source for CrossrefSource {
    fn id(&self) -> &str {
        "crossref"
    }

    fn name(&self) -> &str {
        "CrossRef"
    }

    fn pagination(&self) -> PaginationMode {
        PaginationMode::Cursor
    }

    fn translate_query(&self, query: &Query) -> String {
        let mut filters = Vec::new();
        if let Some(year) = query.year_min {
            filters.push(format!("from-pub-date:{}-01-01", year));
        }
        if let Some(year) = query.year_max {
            filters.push(format!("until-pub-date:{}-12-31", year));
        }
        filters.extend(ALLOWED_TYPES.iter().map(|t| format!("type:{}", t)));

        format!(
            "query={}&filter={}",
            urlencoding::encode(&query.text),
            filters.join(",")
        )
    }

    async fn fetch_page(
        &self,
        provider_query: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Page, SourceError> {
        let cursor = token.map(ContinuationToken::as_str).unwrap_or("*");
        let url = format!("{}/works?{}", self.base_url, provider_query);

        let mut params = vec![
            ("rows", ROWS.to_string()),
            ("cursor", cursor.to_string()),
            ("select", SELECT_FIELDS.to_string()),
        ];
        if let Some(mailto) = &self.mailto {
            params.push(("mailto", mailto.clone()));
        }

        let request = self.client.client().get(&url).query(&params);
        let data: CRResponse = self.client.get_json(request).await?;
        let message = data.message;

        tracing::debug!(
            "CrossRef page: {} items of {:?}",
            message.items.len(),
            message.total_results
        );

        let records: Vec<RawRecord> = message
            .items
            .into_iter()
            .map(|payload| RawRecord::new(self.id(), payload))
            .collect();

        // CrossRef keeps returning the same cursor once the result set is exhausted
        match message.next_cursor {
            Some(next) if !records.is_empty() && next != cursor => {
                Ok(Page::more(records, ContinuationToken::new(next)))
            }
            _ => Ok(Page::last(records)),
        }
    }

    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError> {
        let item: CRItem = serde_json::from_value(record.payload.clone())
            .map_err(|e| NormalizationError::invalid(self.id(), e))?;
        self.parse_item(item)
    }
}

// ===== CrossRef API Types =====

#[derive(Debug, Deserialize)]
struct CRResponse {
    message: CRMessage,
}

#[derive(Debug, Deserialize)]
struct CRMessage {
    #[serde(default)]
    items: Vec<serde_json::Value>,
    #[serde(rename = "next-cursor")]
    next_cursor: Option<String>,
    #[serde(rename = "total-results")]
    total_results: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CRItem {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(default)]
    title: Vec<String>,
    #[serde(default)]
    author: Vec<CRAuthor>,
    issued: Option<CRDate>,
    #[serde(rename = "URL")]
    url: Option<String>,
    r#abstract: Option<String>,
    #[serde(rename = "is-referenced-by-count")]
    is_referenced_by_count: Option<u64>,
    #[serde(default)]
    link: Vec<CRLink>,
}

#[derive(Debug, Deserialize)]
struct CRAuthor {
    given: Option<String>,
    family: Option<String>,
    /// Organisational authors carry only a name
    name: Option<String>,
    #[serde(rename = "ORCID")]
    orcid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CRDate {
    #[serde(rename = "date-parts", default)]
    date_parts: Vec<Vec<Option<i32>>>,
}

#[derive(Debug, Deserialize)]
struct CRLink {
    #[serde(rename = "URL")]
    url: String,
}

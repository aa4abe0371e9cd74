//! OpenAlex research source implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::models::{Author, Document, DocumentBuilder, Query};
use crate::normalize::{self, NormalizationError};
use crate::sources::{ContinuationToken, Page, PaginationMode, RawRecord, Source, SourceError};
use crate::utils::HttpClient;

const OPENALEX_API_BASE: &str = "https://api.openalex.org";

/// Largest page OpenAlex serves
const PER_PAGE: usize = 200;

const SELECT_FIELDS: &str = "id,doi,title,display_name,publication_year,primary_location,\
authorships,cited_by_count,ids,abstract_inverted_index,best_oa_location";

/// OpenAlex research source
///
/// Uses the OpenAlex REST API with cursor pagination.
#[derive(Debug, Clone)]
pub struct OpenAlexSource {
    client: HttpClient,
    base_url: String,
    mailto: Option<String>,
}

impl OpenAlexSource {
    /// Create a new OpenAlex source; a contact address puts requests in the
    /// polite pool
    pub fn new(mailto: Option<String>, timeout: Duration) -> Self {
        Self {
            client: HttpClient::with_mailto(mailto.as_deref(), timeout),
            base_url: OPENALEX_API_BASE.to_string(),
            mailto,
        }
    }

    /// Point at another endpoint (mirrors, test servers)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Convert an OpenAlex work into a document
    fn parse_work(&self, work: OAWork) -> Result<Document, NormalizationError> {
        let title = work
            .display_name
            .or(work.title)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| NormalizationError::MissingTitle {
                provider: self.id().to_string(),
            })?;

        let openalex_id = work.id.as_deref().map(id_tail);
        let pmid = work.ids.as_ref().and_then(|ids| ids.pmid.as_deref()).map(id_tail);

        let authors = work.authorships.into_iter().filter_map(|authorship| {
            let author = authorship.author?;
            let name = author.display_name?;
            let mut parsed = Author::new(name);
            if let Some(orcid) = author.orcid.as_deref() {
                parsed = parsed.with_identifier(id_tail(orcid));
            }
            Some(parsed)
        });

        let abstract_text = work
            .abstract_inverted_index
            .as_ref()
            .and_then(normalize::abstract_from_inverted_index);

        let landing = work
            .primary_location
            .and_then(|location| location.landing_page_url);
        let pdf = work.best_oa_location.and_then(|location| location.pdf_url);
        let openalex_url = openalex_id.map(|id| format!("https://openalex.org/{}", id));

        let mut builder = DocumentBuilder::new(title, self.id())
            .authors(authors)
            .year(work.publication_year)
            .maybe_abstract(abstract_text)
            .cited_by_count(work.cited_by_count);
        if let Some(doi) = work.doi.as_deref() {
            builder = builder.doi(doi);
        }
        if let Some(id) = openalex_id {
            builder = builder.external_id("openalex_id", id);
        }
        if let Some(pmid) = pmid {
            builder = builder.external_id("pubmed_id", pmid);
        }

        let mut urls = landing.into_iter().chain(openalex_url).chain(pdf);
        if let Some(primary) = urls.next() {
            builder = builder.url(primary);
        }
        for url in urls {
            builder = builder.related_url(url);
        }

        Ok(builder.build())
    }
}

/// Last path segment of an id URL (`https://openalex.org/W123` -> `W123`)
fn id_tail(id: &str) -> &str {
    id.trim_end_matches('/').rsplit('/').next().unwrap_or(id)
}

#[async_trait]
impl Source for OpenAlexSource {
    fn id(&self) -> &str {
        "openalex"
    }

    fn name(&self) -> &str {
        "OpenAlex"
    }

    fn pagination(&self) -> PaginationMode {
        PaginationMode::Cursor
    }

    fn translate_query(&self, query: &Query) -> String {
        let mut filters = Vec::new();
        if query.year_min.is_some() || query.year_max.is_some() {
            filters.push(format!(
                "publication_year:{}-{}",
                query.year_min.unwrap_or(1900),
                query.year_max.unwrap_or(2100)
            ));
        }
        filters.push("type:article|review".to_string());

        format!(
            "search={}&filter={}",
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
            ("per-page", PER_PAGE.to_string()),
            ("cursor", cursor.to_string()),
            ("select", SELECT_FIELDS.to_string()),
        ];
        if let Some(mailto) = &self.mailto {
            params.push(("mailto", mailto.clone()));
        }

        let request = self.client.client().get(&url).query(&params);
        let data: WorksResponse = self.client.get_json(request).await?;

        tracing::debug!(
            "OpenAlex page: {} results of {:?}",
            data.results.len(),
            data.meta.count
        );

        let records: Vec<RawRecord> = data
            .results
            .into_iter()
            .map(|payload| RawRecord::new(self.id(), payload))
            .collect();

        match data.meta.next_cursor {
            Some(next) if !records.is_empty() && !next.is_empty() => {
                Ok(Page::more(records, ContinuationToken::new(next)))
            }
            _ => Ok(Page::last(records)),
        }
    }

    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError> {
        let work: OAWork = serde_json::from_value(record.payload.clone())
            .map_err(|e| NormalizationError::invalid(self.id(), e))?;
        self.parse_work(work)
    }
}

// ===== OpenAlex API Types =====

#[derive(Debug, Deserialize)]
struct WorksResponse {
    #[serde(default)]
    results: Vec<serde_json::Value>,
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct Meta {
    count: Option<u64>,
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAWork {
    id: Option<String>,
    doi: Option<String>,
    title: Option<String>,
    display_name: Option<String>,
    publication_year: Option<i32>,
    cited_by_count: Option<u64>,
    #[serde(default)]
    authorships: Vec<OAAuthorship>,
    ids: Option<OAIds>,
    abstract_inverted_index: Option<BTreeMap<String, Vec<usize>>>,
    primary_location: Option<OALocation>,
    best_oa_location: Option<OALocation>,
}

#[derive(Debug, Deserialize)]
struct OAAuthorship {
    author: Option<OAAuthor>,
}

#[derive(Debug, Deserialize)]
struct OAAuthor {
    display_name: Option<String>,
    orcid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAIds {
    pmid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OALocation {
    landing_page_url: Option<String>,
    pdf_url: Option<String>,
}

//! Semantic Scholar research source implementation.
//!
//! Uses the bulk search endpoint, which pages through arbitrarily large
//! result sets with an opaque continuation token instead of offsets.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::models::{Author, Document, DocumentBuilder, Query};
use crate::normalize::NormalizationError;
use crate::sources::{ContinuationToken, Page, PaginationMode, RawRecord, Source, SourceError};
use crate::utils::HttpClient;

const SEMANTIC_SCHOLAR_API_BASE: &str = "https://api.semanticscholar.org";

const FIELDS: &str = "paperId,externalIds,title,abstract,year,authors,citationCount,url,openAccessPdf";

/// Semantic Scholar research source
#[derive(Debug, Clone)]
pub struct SemanticScholarSource {
    client: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl SemanticScholarSource {
    /// Create a new source; an API key raises the rate limit considerably
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: HttpClient::new(timeout),
            base_url: SEMANTIC_SCHOLAR_API_BASE.to_string(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn parse_paper(&self, paper: S2Paper) -> Result<Document, NormalizationError> {
        let title = paper
            .title
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| NormalizationError::MissingTitle {
                provider: self.id().to_string(),
            })?;

        let authors = paper.authors.into_iter().filter_map(|author| {
            let name = author.name?;
            let parsed = Author::new(name);
            Some(match author.author_id {
                Some(id) => parsed.with_identifier(format!("s2:{}", id)),
                None => parsed,
            })
        });

        let mut builder = DocumentBuilder::new(title, self.id())
            .authors(authors)
            .year(paper.year)
            .maybe_abstract(paper.r#abstract)
            .cited_by_count(paper.citation_count);
        if let Some(id) = paper.paper_id.as_deref() {
            builder = builder.external_id("semantic_scholar_id", id);
        }
        if let Some(ids) = paper.external_ids {
            if let Some(doi) = ids.doi.as_deref() {
                builder = builder.doi(doi);
            }
            if let Some(arxiv) = ids.arxiv.as_deref() {
                builder = builder.external_id("arxiv_id", arxiv);
            }
            if let Some(pmid) = ids.pubmed.as_deref() {
                builder = builder.external_id("pubmed_id", pmid);
            }
        }
        if let Some(url) = paper.url {
            builder = builder.url(url);
        }
        if let Some(pdf) = paper.open_access_pdf.and_then(|pdf| pdf.url) {
            builder = builder.related_url(pdf);
        }

        Ok(builder.build())
    }
}

#[async_trait]
impl Source for SemanticScholarSource {
    fn id(&self) -> &str {
        "semantic_scholar"
    }

    fn name(&self) -> &str {
        "Semantic Scholar"
    }

    fn pagination(&self) -> PaginationMode {
        PaginationMode::BulkToken
    }

    fn translate_query(&self, query: &Query) -> String {
        let mut translated = format!("query={}", urlencoding::encode(&query.text));
        let year = match (query.year_min, query.year_max) {
            (Some(min), Some(max)) => Some(format!("{}-{}", min, max)),
            (Some(min), None) => Some(format!("{}-", min)),
            (None, Some(max)) => Some(format!("-{}", max)),
            (None, None) => None,
        };
        if let Some(year) = year {
            translated.push_str("&year=");
            translated.push_str(&year);
        }
        translated
    }

    async fn fetch_page(
        &self,
        provider_query: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Page, SourceError> {
        let url = format!(
            "{}/graph/v1/paper/search/bulk?{}",
            self.base_url, provider_query
        );

        let mut params = vec![("fields", FIELDS.to_string())];
        if let Some(token) = token {
            params.push(("token", token.as_str().to_string()));
        }

        let mut request = self.client.client().get(&url).query(&params);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let data: BulkResponse = self.client.get_json(request).await?;

        tracing::debug!(
            "Semantic Scholar page: {} papers of {:?}",
            data.data.len(),
            data.total
        );

        let records: Vec<RawRecord> = data
            .data
            .into_iter()
            .map(|payload| RawRecord::new(self.id(), payload))
            .collect();

        match data.token {
            Some(next) if !next.is_empty() => Ok(Page::more(records, ContinuationToken::new(next))),
            _ => Ok(Page::last(records)),
        }
    }

    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError> {
        let paper: S2Paper = serde_json::from_value(record.payload.clone())
            .map_err(|e| NormalizationError::invalid(self.id(), e))?;
        self.parse_paper(paper)
    }
}

// ===== Semantic Scholar API Types =====

#[derive(Debug, Deserialize)]
struct BulkResponse {
    total: Option<u64>,
    token: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Paper {
    paper_id: Option<String>,
    external_ids: Option<S2ExternalIds>,
    title: Option<String>,
    r#abstract: Option<String>,
    year: Option<i32>,
    #[serde(default)]
    authors: Vec<S2Author>,
    citation_count: Option<u64>,
    url: Option<String>,
    open_access_pdf: Option<S2Pdf>,
}

#[derive(Debug, Deserialize)]
struct S2ExternalIds {
    #[serde(rename = "DOI")]
    doi: Option<String>,
    #[serde(rename = "ArXiv")]
    arxiv: Option<String>,
    #[serde(rename = "PubMed")]
    pubmed: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct S2Author {
    author_id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct S2Pdf {
    url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use serde_json::json;

    fn paper() -> serde_json::Value {
        json!({
            "paperId": "649def34f8be52c8b66281af98ae884c09aef38b",
            "externalIds": {"DOI": "10.1145/3292500.3330701", "ArXiv": "1905.00001", "CorpusId": 1},
            "title": "Optuna: A Next-generation Hyperparameter Optimization Framework",
            "abstract": null,
            "year": 2019,
            "authors": [{"authorId": "2268", "name": "Takuya Akiba"}],
            "citationCount": 3000,
            "url": "https://www.semanticscholar.org/paper/649def34",
            "openAccessPdf": {"url": "https://arxiv.org/pdf/1905.00001"}
        })
    }

    #[test]
    fn test_translate_query_years() {
        let source = SemanticScholarSource::new(None, Duration::from_secs(5));
        assert_eq!(
            source.translate_query(&Query::new("Q1", "hyperparameter").years(Some(2019), None)),
            "query=hyperparameter&year=2019-"
        );
        assert_eq!(
            source.translate_query(&Query::new("Q1", "a b").years(Some(2019), Some(2021))),
            "query=a%20b&year=2019-2021"
        );
    }

    #[test]
    fn test_normalize_paper() {
        let source = SemanticScholarSource::new(None, Duration::from_secs(5));
        let doc = source
            .normalize(&RawRecord::new("semantic_scholar", paper()))
            .unwrap();
        assert_eq!(doc.doi(), Some("10.1145/3292500.3330701"));
        assert_eq!(doc.external_ids.first("arxiv_id"), Some("1905.00001"));
        assert_eq!(doc.abstract_text(), "");
        assert_eq!(doc.authors[0].identifier.as_deref(), Some("s2:2268"));
        assert_eq!(
            doc.record_id(),
            "semantic_scholar:649def34f8be52c8b66281af98ae884c09aef38b"
        );
    }

    #[tokio::test]
    async fn test_fetch_page_sends_key_and_token() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/graph/v1/paper/search/bulk")
            .match_header("x-api-key", "secret")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("query".into(), "optuna".into()),
                Matcher::UrlEncoded("token".into(), "PCOA3".into()),
            ]))
            .with_status(200)
            .with_body(json!({"total": 1, "token": null, "data": [paper()]}).to_string())
            .create_async()
            .await;

        let source = SemanticScholarSource::new(Some("secret".into()), Duration::from_secs(5))
            .with_base_url(server.url());
        let page = source
            .fetch_page("query=optuna", Some(&ContinuationToken::new("PCOA3")))
            .await
            .unwrap();
        assert_eq!(page.records.len(), 1);
        assert!(page.is_exhausted());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_page_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/graph/v1/paper/search/bulk")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let source = SemanticScholarSource::new(None, Duration::from_secs(5)).with_base_url(server.url());
        let err = source.fetch_page("query=x", None).await.unwrap_err();
        assert!(err.is_retryable());
    }
}

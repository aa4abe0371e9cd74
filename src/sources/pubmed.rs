//! PubMed research source implementation using E-utilities API.
//!
//! Pagination uses the E-utilities history server: the first page is an
//! `esearch` call with `usehistory=y` that returns no records, only a
//! `WebEnv` session and query key. Every later page is an `efetch` against
//! that session. The continuation token carries the session and offset, so a
//! resumed run continues the same result set as long as the session is alive.

use async_trait::async_trait;
use quick_xml::de::from_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::sync::OnceLock;
use std::time::Duration;

use crate::models::{Author, Document, DocumentBuilder, Query};
use crate::normalize::{self, NormalizationError};
use crate::sources::{ContinuationToken, Page, PaginationMode, RawRecord, Source, SourceError};
use crate::utils::HttpClient;

/// PubMed E-utilities API base URL
const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Records per efetch call
const BATCH_SIZE: usize = 200;

const TOOL_NAME: &str = env!("CARGO_PKG_NAME");

/// PubMed research source
#[derive(Debug, Clone)]
pub struct PubMedSource {
    client: HttpClient,
    base_url: String,
    api_key: Option<String>,
    email: Option<String>,
}

/// History-server position encoded in a continuation token
#[derive(Debug, Clone, PartialEq, Eq)]
struct SessionToken {
    web_env: String,
    query_key: String,
    retstart: usize,
    count: usize,
}

impl SessionToken {
    fn encode(&self) -> ContinuationToken {
        ContinuationToken::new(format!(
            "{}|{}|{}|{}",
            self.web_env, self.query_key, self.retstart, self.count
        ))
    }

    fn decode(token: &ContinuationToken) -> Result<Self, SourceError> {
        let malformed = || SourceError::Malformed(format!("bad PubMed token: {}", token.as_str()));
        let mut parts = token.as_str().split('|');
        let web_env = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let query_key = parts.next().filter(|s| !s.is_empty()).ok_or_else(malformed)?;
        let retstart = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
        let count = parts.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
        Ok(Self {
            web_env: web_env.to_string(),
            query_key: query_key.to_string(),
            retstart,
            count,
        })
    }
}

impl PubMedSource {
    /// Create a new PubMed source. NCBI allows 10 requests/s with an API key
    /// and 3 without.
    pub fn new(api_key: Option<String>, email: Option<String>, timeout: Duration) -> Self {
        Self {
            client: HttpClient::new(timeout),
            base_url: EUTILS_BASE.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            email,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Parameters every E-utilities call carries
    fn common_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string()), ("tool", TOOL_NAME.to_string())];
        if let Some(email) = &self.email {
            params.push(("email", email.clone()));
        }
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// Open a history session for the query
    async fn search(&self, term: &str) -> Result<Page, SourceError> {
        let mut params = self.common_params();
        params.push(("term", term.to_string()));
        params.push(("usehistory", "y".to_string()));
        params.push(("retmax", "0".to_string()));

        let url = format!("{}/esearch.fcgi", self.base_url);
        let xml = self
            .client
            .get_text(self.client.client().get(&url).query(&params))
            .await?;
        let result = parse_search_response(&xml)?;

        tracing::debug!("PubMed esearch: {} matches", result.count);
        if result.count == 0 {
            return Ok(Page::last(Vec::new()));
        }
        let token = SessionToken {
            web_env: result.web_env,
            query_key: result.query_key,
            retstart: 0,
            count: result.count,
        };
        Ok(Page::more(Vec::new(), token.encode()))
    }

    /// Fetch one batch from the history session
    async fn fetch_batch(&self, session: SessionToken) -> Result<Page, SourceError> {
        let mut params = self.common_params();
        params.push(("WebEnv", session.web_env.clone()));
        params.push(("query_key", session.query_key.clone()));
        params.push(("retstart", session.retstart.to_string()));
        params.push(("retmax", BATCH_SIZE.to_string()));
        params.push(("retmode", "xml".to_string()));

        let url = format!("{}/efetch.fcgi", self.base_url);
        let xml = self
            .client
            .get_text(self.client.client().get(&url).query(&params))
            .await?;

        let batch = parse_fetch_response(&xml)?;
        let mut records = Vec::new();
        for article in batch.records {
            records.push(RawRecord::new(self.id(), serde_json::to_value(article)?));
        }

        tracing::debug!(
            "PubMed efetch at {}: {} of {} records, {} skipped",
            session.retstart,
            records.len(),
            session.count,
            batch.skipped
        );

        let next = session.retstart + BATCH_SIZE;
        if (records.is_empty() && batch.skipped == 0) || next >= session.count {
            return Ok(Page::last(records));
        }
        let token = SessionToken {
            retstart: next,
            ..session
        };
        Ok(Page::more(records, token.encode()))
    }
}

#[async_trait]
impl Source for PubMedSource {
    fn id(&self) -> &str {
        "pubmed"
    }

    fn name(&self) -> &str {
        "PubMed"
    }

    fn pagination(&self) -> PaginationMode {
        PaginationMode::SessionHistory
    }

    fn translate_query(&self, query: &Query) -> String {
        match (query.year_min, query.year_max) {
            (None, None) => query.text.trim().to_string(),
            (min, max) => format!(
                "({}) AND {}:{}[dp]",
                query.text.trim(),
                min.unwrap_or(1800),
                max.unwrap_or(3000)
            ),
        }
    }

    async fn fetch_page(
        &self,
        provider_query: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Page, SourceError> {
        match token {
            None => self.search(provider_query).await,
            Some(token) => self.fetch_batch(SessionToken::decode(token)?).await,
        }
    }

    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError> {
        let article: PubMedRecord = serde_json::from_value(record.payload.clone())
            .map_err(|e| NormalizationError::invalid(self.id(), e))?;

        let title = article
            .title
            .as_deref()
            .and_then(normalize::clean_text)
            .ok_or_else(|| NormalizationError::MissingTitle {
                provider: self.id().to_string(),
            })?;

        let authors = article.authors.into_iter().map(|author| match author.orcid {
            Some(orcid) => Author::new(author.name).with_identifier(orcid),
            None => Author::new(author.name),
        });

        let mut builder = DocumentBuilder::new(title, self.id())
            .authors(authors)
            .year(article.year)
            .maybe_abstract(article.r#abstract.as_deref().and_then(normalize::clean_text))
            .external_id("pubmed_id", &article.pmid)
            .url(format!("https://pubmed.ncbi.nlm.nih.gov/{}/", article.pmid));
        if let Some(doi) = article.doi.as_deref() {
            builder = builder.doi(doi);
        }
        if let Some(pmc) = article.pmc.as_deref() {
            builder = builder
                .external_id("pmc_id", pmc)
                .related_url(format!("https://www.ncbi.nlm.nih.gov/pmc/articles/{}/", pmc));
        }
        Ok(builder.build())
    }
}

/// Flattened article, the payload of a PubMed [`RawRecord`]
#[derive(Debug, Serialize, Deserialize)]
struct PubMedRecord {
    pmid: String,
    title: Option<String>,
    r#abstract: Option<String>,
    #[serde(default)]
    authors: Vec<PubMedAuthor>,
    year: Option<i32>,
    doi: Option<String>,
    pmc: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PubMedAuthor {
    name: String,
    orcid: Option<String>,
}

struct SearchResult {
    count: usize,
    web_env: String,
    query_key: String,
}

/// Parse E-utilities search response XML
fn parse_search_response(xml: &str) -> Result<SearchResult, SourceError> {
    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct ESearchResult {
        Count: Option<String>,
        QueryKey: Option<String>,
        WebEnv: Option<String>,
        ERROR: Option<String>,
    }

    let result: ESearchResult = from_str(xml)
        .map_err(|e| SourceError::Malformed(format!("PubMed search XML: {}", e)))?;

    if let Some(error) = result.ERROR {
        return Err(SourceError::Malformed(format!("PubMed search error: {}", error)));
    }
    let count = result
        .Count
        .as_deref()
        .and_then(|c| c.trim().parse().ok())
        .ok_or_else(|| SourceError::Malformed("PubMed search without Count".to_string()))?;
    if count == 0 {
        return Ok(SearchResult {
            count,
            web_env: String::new(),
            query_key: String::new(),
        });
    }
    match (result.WebEnv, result.QueryKey) {
        (Some(web_env), Some(query_key)) => Ok(SearchResult {
            count,
            web_env,
            query_key,
        }),
        _ => Err(SourceError::Malformed(
            "PubMed search without history session".to_string(),
        )),
    }
}

/// Articles of one efetch batch
struct FetchedBatch {
    records: Vec<PubMedRecord>,
    /// Articles that could not be parsed and were left out
    skipped: usize,
}

fn inline_markup_regex() -> Option<&'static Regex> {
    static INLINE: OnceLock<Option<Regex>> = OnceLock::new();
    INLINE
        .get_or_init(|| {
            Regex::new(r"</?(?:i|b|u|em|strong|sup|sub|mml:[A-Za-z]+)(?:\s[^<>]*)?/?>").ok()
        })
        .as_ref()
}

/// Drop the formatting tags PubMed allows inside titles and abstracts
/// (`<i>`, `<sup>`, MathML, ...), keeping their text.
fn strip_inline_markup(xml: &str) -> Cow<'_, str> {
    match inline_markup_regex() {
        Some(re) => re.replace_all(xml, ""),
        None => Cow::Borrowed(xml),
    }
}

/// Slice every `<PubmedArticle>` element out of an efetch response.
fn article_elements(xml: &str) -> Vec<&str> {
    const OPEN: &str = "<PubmedArticle";
    const CLOSE: &str = "</PubmedArticle>";

    let mut elements = Vec::new();
    let mut offset = 0;
    while let Some(found) = xml[offset..].find(OPEN) {
        let start = offset + found;
        let after = start + OPEN.len();
        // `<PubmedArticleSet` shares the prefix
        if !xml[after..].starts_with(|c: char| c == '>' || c.is_whitespace()) {
            offset = after;
            continue;
        }
        let Some(len) = xml[after..].find(CLOSE) else {
            break;
        };
        let end = after + len + CLOSE.len();
        elements.push(&xml[start..end]);
        offset = end;
    }
    elements
}

/// Parse E-utilities fetch response XML.
///
/// Articles are deserialized one at a time so a single unreadable article
/// costs only that record.
fn parse_fetch_response(xml: &str) -> Result<FetchedBatch, SourceError> {
    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct PubmedArticle {
        MedlineCitation: Option<MedlineCitation>,
        PubmedData: Option<PubmedData>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct MedlineCitation {
        PMID: Option<Text>,
        Article: Option<Article>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct Article {
        Journal: Option<Journal>,
        ArticleTitle: Option<Text>,
        Abstract: Option<Abstract>,
        AuthorList: Option<AuthorList>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct Journal {
        JournalIssue: Option<JournalIssue>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct JournalIssue {
        PubDate: Option<PubDate>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct PubDate {
        Year: Option<String>,
        MedlineDate: Option<String>,
    }

    #[derive(Debug, Deserialize)]
    struct Text {
        #[serde(rename = "$text", default)]
        text: String,
    }

    #[derive(Debug, Deserialize)]
    struct Abstract {
        #[serde(rename = "AbstractText", default)]
        parts: Vec<AbstractText>,
    }

    #[derive(Debug, Deserialize)]
    struct AbstractText {
        #[serde(rename = "@Label")]
        label: Option<String>,
        #[serde(rename = "$text", default)]
        text: String,
    }

    #[derive(Debug, Deserialize)]
    struct AuthorList {
        #[serde(rename = "Author", default)]
        authors: Vec<XmlAuthor>,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct XmlAuthor {
        LastName: Option<Text>,
        ForeName: Option<Text>,
        CollectiveName: Option<Text>,
        #[serde(rename = "Identifier", default)]
        identifiers: Vec<Identifier>,
    }

    #[derive(Debug, Deserialize)]
    struct Identifier {
        #[serde(rename = "@Source")]
        source: Option<String>,
        #[serde(rename = "$text", default)]
        value: String,
    }

    #[derive(Debug, Deserialize)]
    #[allow(non_snake_case)]
    struct PubmedData {
        ArticleIdList: Option<ArticleIdList>,
    }

    #[derive(Debug, Deserialize)]
    struct ArticleIdList {
        #[serde(rename = "ArticleId", default)]
        ids: Vec<ArticleId>,
    }

    #[derive(Debug, Deserialize)]
    struct ArticleId {
        #[serde(rename = "@IdType")]
        id_type: Option<String>,
        #[serde(rename = "$text", default)]
        value: String,
    }

    if !xml.contains("<PubmedArticleSet") {
        return Err(SourceError::Malformed(
            "PubMed fetch response without PubmedArticleSet".to_string(),
        ));
    }

    let xml = strip_inline_markup(xml);
    let mut records = Vec::new();
    let mut skipped = 0;
    for element in article_elements(&xml) {
        let article: PubmedArticle = match from_str(element) {
            Ok(article) => article,
            Err(e) => {
                tracing::warn!("Skipping unreadable PubMed article: {}", e);
                skipped += 1;
                continue;
            }
        };
        let Some(citation) = article.MedlineCitation else {
            continue;
        };
        let Some(pmid) = citation.PMID.map(|p| p.text.trim().to_string()) else {
            continue;
        };
        let body = citation.Article;

        let title = body
            .as_ref()
            .and_then(|a| a.ArticleTitle.as_ref())
            .map(|t| t.text.clone());

        let r#abstract = body.as_ref().and_then(|a| a.Abstract.as_ref()).map(|ab| {
            ab.parts
                .iter()
                .map(|part| match &part.label {
                    Some(label) => format!("{}: {}", label, part.text.trim()),
                    None => part.text.trim().to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        });

        let authors = body
            .as_ref()
            .and_then(|a| a.AuthorList.as_ref())
            .map(|list| {
                list.authors
                    .iter()
                    .filter_map(|author| {
                        let name = match &author.CollectiveName {
                            Some(collective) => collective.text.trim().to_string(),
                            None => {
                                let first = author.ForeName.as_ref().map(|f| f.text.trim()).unwrap_or("");
                                let last = author.LastName.as_ref().map(|l| l.text.trim()).unwrap_or("");
                                format!("{} {}", first, last).trim().to_string()
                            }
                        };
                        if name.is_empty() {
                            return None;
                        }
                        let orcid = author
                            .identifiers
                            .iter()
                            .find(|id| id.source.as_deref() == Some("ORCID"))
                            .map(|id| {
                                let value = id.value.trim();
                                value.rsplit('/').next().unwrap_or(value).to_string()
                            });
                        Some(PubMedAuthor { name, orcid })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let year = body
            .as_ref()
            .and_then(|a| a.Journal.as_ref())
            .and_then(|j| j.JournalIssue.as_ref())
            .and_then(|ji| ji.PubDate.as_ref())
            .and_then(|pd| pd.Year.as_deref().or(pd.MedlineDate.as_deref()))
            .and_then(normalize::parse_year);

        let ids = article
            .PubmedData
            .and_then(|pd| pd.ArticleIdList)
            .map(|list| list.ids)
            .unwrap_or_default();
        let find_id = |kind: &str| {
            ids.iter()
                .find(|id| id.id_type.as_deref() == Some(kind))
                .map(|id| id.value.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        records.push(PubMedRecord {
            pmid,
            title,
            r#abstract,
            authors,
            year,
            doi: find_id("doi"),
            pmc: find_id("pmc"),
        });
    }

    Ok(FetchedBatch { records, skipped })
}

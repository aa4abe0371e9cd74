//! Scripted source for tests.
//!
//! Pages are served in order with offset tokens (`"1"`, `"2"`, ...). Records
//! are [`Document`] JSON objects; a payload without a `title` key fails
//! normalization. Errors can be queued per page to exercise retry, malformed
//! and terminal paths.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::models::{Document, Query};
use crate::normalize::NormalizationError;
use crate::sources::{ContinuationToken, Page, PaginationMode, RawRecord, Source, SourceError};

/// A source returning predefined pages
#[derive(Debug)]
pub struct MockSource {
    id: String,
    pages: Vec<Vec<serde_json::Value>>,
    failures: Mutex<HashMap<usize, VecDeque<SourceError>>>,
    calls: Mutex<Vec<Option<String>>>,
    delay: Option<Duration>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockSource {
    /// A source with no results
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            pages: Vec::new(),
            failures: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// Serve these pages in order
    pub fn with_pages(mut self, pages: Vec<Vec<serde_json::Value>>) -> Self {
        self.pages = pages;
        self
    }

    /// Serve documents, `per_page` at a time
    pub fn with_documents(self, docs: &[Document], per_page: usize) -> Self {
        let pages = docs
            .chunks(per_page.max(1))
            .map(|chunk| {
                chunk
                    .iter()
                    .filter_map(|doc| serde_json::to_value(doc).ok())
                    .collect()
            })
            .collect();
        self.with_pages(pages)
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail the next `times` requests for page `page` with `error`
    pub fn fail_page(self, page: usize, error: SourceError, times: usize) -> Self {
        {
            let mut failures = lock(&self.failures);
            let queue = failures.entry(page).or_default();
            queue.extend(std::iter::repeat(error).take(times));
        }
        self
    }

    /// Tokens of every request received so far, `None` for a first page
    pub fn calls(&self) -> Vec<Option<String>> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl Source for MockSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        "Mock Source"
    }

    fn pagination(&self) -> PaginationMode {
        PaginationMode::Offset
    }

    fn translate_query(&self, query: &Query) -> String {
        format!("mock:{}", query.text)
    }

    async fn fetch_page(
        &self,
        _provider_query: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<Page, SourceError> {
        lock(&self.calls).push(token.map(|t| t.as_str().to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let index = match token {
            Some(token) => token.offset()?,
            None => 0,
        };
        if let Some(error) = lock(&self.failures)
            .get_mut(&index)
            .and_then(VecDeque::pop_front)
        {
            return Err(error);
        }

        let records: Vec<RawRecord> = self
            .pages
            .get(index)
            .map(|page| {
                page.iter()
                    .map(|payload| RawRecord::new(self.id.clone(), payload.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if index + 1 < self.pages.len() {
            Ok(Page::more(records, ContinuationToken::from_offset(index + 1)))
        } else {
            Ok(Page::last(records))
        }
    }

    fn normalize(&self, record: &RawRecord) -> Result<Document, NormalizationError> {
        if record.payload.get("title").is_none() {
            return Err(NormalizationError::MissingTitle {
                provider: self.id.clone(),
            });
        }
        let mut payload = record.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("provider".to_string(), serde_json::json!(self.id));
        }
        serde_json::from_value(payload).map_err(|e| NormalizationError::invalid(&self.id, e))
    }
}

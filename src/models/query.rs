//! Search query model and query-file parsing.

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

use super::Document;

/// A structured search query, immutable once dispatched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Query identifier (`Q01`, `crop-disease`, ...)
    pub id: String,

    /// Boolean/keyword query text
    pub text: String,

    /// Theme or category the query belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,

    /// Free-form priority label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    /// Keep a record only if title or abstract mentions one of these
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_any: Vec<String>,

    /// Drop a record if title or abstract mentions any of these
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_any: Vec<String>,

    /// Earliest publication year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_min: Option<i32>,

    /// Latest publication year
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_max: Option<i32>,
}

impl Query {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            theme: None,
            priority: None,
            include_any: Vec::new(),
            exclude_any: Vec::new(),
            year_min: None,
            year_max: None,
        }
    }

    pub fn theme(mut self, theme: impl Into<String>) -> Self {
        self.theme = Some(theme.into());
        self
    }

    pub fn include_any<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_any = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude_any<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_any = terms.into_iter().map(Into::into).collect();
        self
    }

    pub fn years(mut self, year_min: Option<i32>, year_max: Option<i32>) -> Self {
        self.year_min = year_min;
        self.year_max = year_max;
        self
    }

    /// Keyword filters applied to a record's title and abstract.
    pub fn passes_filters(&self, doc: &Document) -> bool {
        if self.include_any.is_empty() && self.exclude_any.is_empty() {
            return true;
        }
        let haystack = format!("{} {}", doc.title, doc.abstract_text()).to_lowercase();
        let mentions = |term: &String| {
            let term = term.trim().to_lowercase();
            !term.is_empty() && haystack.contains(&term)
        };
        if !self.include_any.is_empty() && !self.include_any.iter().any(mentions) {
            return false;
        }
        !self.exclude_any.iter().any(mentions)
    }
}

/// Errors while reading a query file
#[derive(Debug, thiserror::Error)]
pub enum QueryFileError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid query file: {0}")]
    Invalid(String),
}

/// Load queries from a YAML or JSON file.
pub fn load_queries(path: &Path) -> Result<Vec<Query>, QueryFileError> {
    let content = std::fs::read_to_string(path)?;
    parse_queries(&content)
}

/// Parse a query document.
///
/// Two layouts are accepted. The structured form is
/// `{queries: [{id, query|text, theme?, priority?, include_any?, exclude_any?}]}`.
/// The legacy form maps a category to a list of query strings and gets
/// sequential ids `Q01`, `Q02`, ... in file order. JSON is valid YAML, so
/// both file types go through the same parser.
pub fn parse_queries(content: &str) -> Result<Vec<Query>, QueryFileError> {
    let root: Value = serde_yaml::from_str(content)?;
    let mapping = root
        .as_mapping()
        .ok_or_else(|| QueryFileError::Invalid("expected a mapping at the top level".into()))?;

    let queries = match mapping.get("queries").and_then(Value::as_sequence) {
        Some(items) => parse_structured(items),
        None => parse_legacy(mapping),
    };

    if queries.is_empty() {
        return Err(QueryFileError::Invalid("no queries found".into()));
    }
    Ok(queries)
}

fn parse_structured(items: &[Value]) -> Vec<Query> {
    let mut queries: Vec<Query> = Vec::new();
    for item in items {
        let text = item
            .get("query")
            .or_else(|| item.get("text"))
            .and_then(scalar_string);
        let Some(text) = text.filter(|t| !t.trim().is_empty()) else {
            tracing::warn!("Skipping query without text: {:?}", item);
            continue;
        };
        let id = item
            .get("id")
            .and_then(scalar_string)
            .unwrap_or_else(|| format!("Q{:02}", queries.len() + 1));

        let mut query = Query::new(id, text);
        query.theme = item.get("theme").and_then(scalar_string);
        query.priority = item.get("priority").and_then(scalar_string);
        query.include_any = item.get("include_any").map(string_list).unwrap_or_default();
        query.exclude_any = item.get("exclude_any").map(string_list).unwrap_or_default();
        query.year_min = item.get("year_min").and_then(year_value);
        query.year_max = item.get("year_max").and_then(year_value);
        queries.push(query);
    }
    queries
}

/// Year bound as an `i32`; out-of-range numbers are ignored.
fn year_value(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|y| i32::try_from(y).ok())
}

fn parse_legacy(mapping: &serde_yaml::Mapping) -> Vec<Query> {
    let mut queries = Vec::new();
    for (category, list) in mapping {
        let (Some(category), Some(list)) = (scalar_string(category), list.as_sequence()) else {
            continue;
        };
        for text in list.iter().filter_map(scalar_string) {
            let id = format!("Q{:02}", queries.len() + 1);
            queries.push(Query::new(id, text).theme(category.clone()));
        }
    }
    queries
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Sequence(items) => items.iter().filter_map(scalar_string).collect(),
        other => scalar_string(other).into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocumentBuilder;

    #[test]
    fn test_parse_structured_yaml() {
        let yaml = r#"
queries:
  - id: crop
    query: "deep learning AND crop"
    theme: agriculture
    priority: 1
    include_any: [disease, pest]
    exclude_any: survey
  - text: "plant phenotyping"
  - id: empty
    query: ""
"#;
        let queries = parse_queries(yaml).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].id, "crop");
        assert_eq!(queries[0].text, "deep learning AND crop");
        assert_eq!(queries[0].priority.as_deref(), Some("1"));
        assert_eq!(queries[0].include_any, vec!["disease", "pest"]);
        assert_eq!(queries[0].exclude_any, vec!["survey"]);
        assert_eq!(queries[1].id, "Q02");
    }

    #[test]
    fn test_parse_year_bounds() {
        let yaml = r#"
queries:
  - query: "wheat rust"
    year_min: 2015
    year_max: 4294969311
"#;
        let queries = parse_queries(yaml).unwrap();
        assert_eq!(queries[0].year_min, Some(2015));
        // does not fit an i32 and must not wrap to 2015
        assert_eq!(queries[0].year_max, None);
    }

    #[test]
    fn test_parse_legacy_json() {
        let json = r#"{"vision": ["a", "b"], "nlp": ["c"], "notes": "ignored"}"#;
        let queries = parse_queries(json).unwrap();
        let ids: Vec<_> = queries.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["Q01", "Q02", "Q03"]);
        assert_eq!(queries[2].theme.as_deref(), Some("nlp"));
        assert_eq!(queries[2].text, "c");
    }

    #[test]
    fn test_parse_empty_is_error() {
        assert!(matches!(
            parse_queries("queries: []"),
            Err(QueryFileError::Invalid(_))
        ));
        assert!(parse_queries("- just a list").is_err());
    }

    #[test]
    fn test_passes_filters() {
        let query = Query::new("Q01", "x")
            .include_any(["disease"])
            .exclude_any(["review"]);

        let hit = DocumentBuilder::new("Crop Disease detection", "mock").build();
        let miss = DocumentBuilder::new("Crop yield", "mock").build();
        let excluded = DocumentBuilder::new("Crop disease", "mock")
            .abstract_text("A systematic REVIEW of methods")
            .build();

        assert!(query.passes_filters(&hit));
        assert!(!query.passes_filters(&miss));
        assert!(!query.passes_filters(&excluded));
        assert!(Query::new("Q02", "y").passes_filters(&miss));
    }

    #[test]
    fn test_load_queries_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queries.yaml");
        std::fs::write(&path, "general:\n  - graph neural networks\n").unwrap();
        let queries = load_queries(&path).unwrap();
        assert_eq!(queries[0].id, "Q01");
        assert_eq!(queries[0].theme.as_deref(), Some("general"));
    }
}

//! Core data models for bibliographic records and search queries.

mod document;
mod query;

pub use document::{Author, Document, DocumentBuilder, ExternalIds};
pub use query::{load_queries, parse_queries, Query, QueryFileError};

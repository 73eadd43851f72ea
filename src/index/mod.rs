//! Secondary search index: cursor pagination and bulk by-query mutations.

pub mod elastic;
pub mod memory;
pub mod query;

pub use elastic::ElasticIndex;
pub use memory::{InMemoryIndex, IndexCall};
pub use query::{Query, RangeBounds};

use crate::core::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::time::Duration;

/// How a by-query operation treats documents changed concurrently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Conflicts {
    Abort,
    /// Skip conflicting documents and keep going.
    #[default]
    Proceed,
}

impl Conflicts {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Proceed => "proceed",
        }
    }
}

/// Sorted, filtered search opened as a scroll.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub index: String,
    pub query: Option<Query>,
    pub size: usize,
    /// Ascending sort field.
    pub sort_field: String,
    pub fetch_source: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub source: Option<Value>,
}

/// One page of a scroll. An empty `hits` marks the end of the result set.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrollPage {
    pub scroll_id: Option<String>,
    pub hits: Vec<SearchHit>,
}

/// Ordered field assignments applied to each matched document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateScript {
    pub assignments: Vec<(String, Value)>,
}

impl UpdateScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.assignments.push((field.to_string(), value.into()));
        self
    }

    /// Renders the assignments as a painless script reading values from params.
    pub fn to_painless(&self) -> (String, Map<String, Value>) {
        let mut source = String::new();
        let mut params = Map::new();
        for (field, value) in &self.assignments {
            source.push_str(&format!("ctx._source.{field} = params.{field}; "));
            params.insert(field.clone(), value.clone());
        }
        (source.trim_end().to_string(), params)
    }

    /// Applies the assignments to a document source.
    pub fn apply(&self, source: &mut Value) {
        if let Value::Object(fields) = source {
            for (field, value) in &self.assignments {
                fields.insert(field.clone(), value.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateByQuery {
    pub index: String,
    pub query: Query,
    pub script: UpdateScript,
    pub conflicts: Conflicts,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteByQuery {
    pub index: String,
    pub query: Query,
    pub conflicts: Conflicts,
}

/// Counters reported by a by-query operation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct BulkByQueryResponse {
    pub total: u64,
    pub updated: u64,
    pub deleted: u64,
    pub noops: u64,
    pub version_conflicts: u64,
    pub failures: Vec<Value>,
}

/// Client seam for the secondary index.
///
/// Every call blocks the caller until the server answers. Scroll calls must be
/// issued sequentially and a scroll cleared exactly once.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Runs `request` and opens a scroll kept alive for `keep_alive`.
    async fn open_scroll(&self, request: &SearchRequest, keep_alive: Duration)
    -> Result<ScrollPage>;

    /// Fetches the next page, refreshing the keep-alive.
    async fn next_page(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage>;

    /// Releases the server-side scroll context.
    async fn clear_scroll(&self, scroll_id: &str) -> Result<()>;

    async fn update_by_query(&self, request: &UpdateByQuery) -> Result<BulkByQueryResponse>;

    async fn delete_by_query(&self, request: &DeleteByQuery) -> Result<BulkByQueryResponse>;
}

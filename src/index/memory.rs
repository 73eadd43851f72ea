use super::query::compare;
use super::{
    BulkByQueryResponse, DeleteByQuery, Query, ScrollPage, SearchHit, SearchIndex, SearchRequest,
    UpdateByQuery,
};
use crate::core::{ReconcileError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// A call observed by [`InMemoryIndex`].
#[derive(Debug, Clone, PartialEq)]
pub enum IndexCall {
    OpenScroll { index: String, keep_alive: Duration },
    NextPage { scroll_id: String, keep_alive: Duration },
    ClearScroll { scroll_id: String },
    UpdateByQuery { index: String, query: Query },
    DeleteByQuery { index: String, query: Query },
}

struct OpenScroll {
    remaining: VecDeque<SearchHit>,
    page_size: usize,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, Vec<(String, Value)>>,
    scrolls: HashMap<String, OpenScroll>,
    next_scroll_id: u64,
    calls: Vec<IndexCall>,
    fail_next_page: bool,
    failing_indices: Vec<String>,
}

/// An in-memory implementation of `SearchIndex` for testing.
///
/// Documents are flat JSON objects; queries are evaluated with
/// [`Query::matches`]. Every call is recorded so tests can assert on the exact
/// sequence of requests.
#[derive(Clone, Default)]
pub struct InMemoryIndex {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces document `id` in `index`.
    pub async fn insert(&self, index: &str, id: impl Into<String>, source: Value) {
        let id = id.into();
        let mut state = self.state.lock().await;
        let docs = state.collections.entry(index.to_string()).or_default();
        match docs.iter().position(|(existing, _)| *existing == id) {
            Some(pos) => docs[pos].1 = source,
            None => docs.push((id, source)),
        }
    }

    /// Returns the document `id` of `index`, if present.
    pub async fn get(&self, index: &str, id: &str) -> Option<Value> {
        let state = self.state.lock().await;
        state
            .collections
            .get(index)?
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, source)| source.clone())
    }

    pub async fn len(&self, index: &str) -> usize {
        let state = self.state.lock().await;
        state.collections.get(index).map_or(0, Vec::len)
    }

    pub async fn calls(&self) -> Vec<IndexCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of scrolls opened and not yet cleared.
    pub async fn open_scrolls(&self) -> usize {
        self.state.lock().await.scrolls.len()
    }

    /// Makes the next `next_page` call fail with a transport error.
    pub async fn fail_next_page(&self) {
        self.state.lock().await.fail_next_page = true;
    }

    /// Makes every by-query call against `index` fail with a transport error.
    pub async fn fail_index(&self, index: &str) {
        self.state.lock().await.failing_indices.push(index.to_string());
    }

    fn take_page(scroll_id: &str, scroll: &mut OpenScroll) -> ScrollPage {
        let take = scroll.page_size.min(scroll.remaining.len());
        ScrollPage {
            scroll_id: Some(scroll_id.to_string()),
            hits: scroll.remaining.drain(..take).collect(),
        }
    }

    fn check_index(state: &MemoryState, index: &str) -> Result<()> {
        if state.failing_indices.iter().any(|failing| failing == index) {
            return Err(ReconcileError::Index(format!(
                "connection reset while querying '{}'",
                index
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for InMemoryIndex {
    async fn open_scroll(
        &self,
        request: &SearchRequest,
        keep_alive: Duration,
    ) -> Result<ScrollPage> {
        let mut state = self.state.lock().await;
        state.calls.push(IndexCall::OpenScroll {
            index: request.index.clone(),
            keep_alive,
        });

        let mut matched: Vec<(String, Value)> = state
            .collections
            .get(&request.index)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, source)| {
                        request.query.as_ref().is_none_or(|query| query.matches(source))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        matched.sort_by(|(left_id, left), (right_id, right)| {
            match (left.get(&request.sort_field), right.get(&request.sort_field)) {
                (Some(l), Some(r)) => compare(l, r).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => left_id.cmp(right_id),
            }
        });

        let remaining = matched
            .into_iter()
            .map(|(id, source)| SearchHit {
                id,
                source: request.fetch_source.then_some(source),
            })
            .collect();

        state.next_scroll_id += 1;
        let scroll_id = format!("scroll-{}", state.next_scroll_id);
        let mut scroll = OpenScroll {
            remaining,
            page_size: request.size.max(1),
        };
        let page = Self::take_page(&scroll_id, &mut scroll);
        state.scrolls.insert(scroll_id, scroll);
        Ok(page)
    }

    async fn next_page(&self, scroll_id: &str, keep_alive: Duration) -> Result<ScrollPage> {
        let mut state = self.state.lock().await;
        state.calls.push(IndexCall::NextPage {
            scroll_id: scroll_id.to_string(),
            keep_alive,
        });
        if std::mem::take(&mut state.fail_next_page) {
            return Err(ReconcileError::Index("scroll request timed out".to_string()));
        }
        let scroll = state.scrolls.get_mut(scroll_id).ok_or_else(|| ReconcileError::IndexApi {
            status: 404,
            message: format!("No search context found for id [{}]", scroll_id),
        })?;
        Ok(Self::take_page(scroll_id, scroll))
    }

    async fn clear_scroll(&self, scroll_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(IndexCall::ClearScroll {
            scroll_id: scroll_id.to_string(),
        });
        state.scrolls.remove(scroll_id).map(|_| ()).ok_or_else(|| ReconcileError::IndexApi {
            status: 404,
            message: format!("No search context found for id [{}]", scroll_id),
        })
    }

    async fn update_by_query(&self, request: &UpdateByQuery) -> Result<BulkByQueryResponse> {
        let mut state = self.state.lock().await;
        state.calls.push(IndexCall::UpdateByQuery {
            index: request.index.clone(),
            query: request.query.clone(),
        });
        Self::check_index(&state, &request.index)?;

        let mut response = BulkByQueryResponse::default();
        if let Some(docs) = state.collections.get_mut(&request.index) {
            for (_, source) in docs.iter_mut() {
                if request.query.matches(source) {
                    request.script.apply(source);
                    response.total += 1;
                    response.updated += 1;
                }
            }
        }
        Ok(response)
    }

    async fn delete_by_query(&self, request: &DeleteByQuery) -> Result<BulkByQueryResponse> {
        let mut state = self.state.lock().await;
        state.calls.push(IndexCall::DeleteByQuery {
            index: request.index.clone(),
            query: request.query.clone(),
        });
        Self::check_index(&state, &request.index)?;

        let mut response = BulkByQueryResponse::default();
        if let Some(docs) = state.collections.get_mut(&request.index) {
            let before = docs.len();
            docs.retain(|(_, source)| !request.query.matches(source));
            let deleted = (before - docs.len()) as u64;
            response.total = deleted;
            response.deleted = deleted;
        }
        Ok(response)
    }
}

//! Finds process instances the list view still shows as running although the
//! broker no longer knows them.

use crate::config::{CollectionNames, ReconcileConfig};
use crate::core::{EntityKey, ReconcileError, Result};
use crate::index::{ScrollPage, SearchHit, SearchIndex, SearchRequest};
use std::collections::HashSet;
use tracing::{Instrument, Level, event, info_span};

/// Keys present in the index but absent from the trusted set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Orphaned keys in index sort order.
    pub keys: Vec<EntityKey>,
    pub pages: usize,
    pub candidates: usize,
}

/// Drops every candidate contained in `trusted`, preserving order.
pub fn subtract_trusted(candidates: Vec<EntityKey>, trusted: &HashSet<EntityKey>) -> Vec<EntityKey> {
    candidates
        .into_iter()
        .filter(|key| !trusted.contains(key))
        .collect()
}

fn hit_key(hit: &SearchHit) -> Result<EntityKey> {
    hit.id.parse::<EntityKey>().map_err(|_| {
        ReconcileError::Malformed(format!(
            "search hit id '{}' is not a process instance key",
            hit.id
        ))
    })
}

pub struct Reconciler<'a> {
    index: &'a dyn SearchIndex,
    collections: &'a CollectionNames,
    config: &'a ReconcileConfig,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        index: &'a dyn SearchIndex,
        collections: &'a CollectionNames,
        config: &'a ReconcileConfig,
    ) -> Self {
        Self {
            index,
            collections,
            config,
        }
    }

    fn search_request(&self) -> SearchRequest {
        SearchRequest {
            index: self.collections.list_view.clone(),
            query: Some(self.config.filter.query()),
            size: self.config.page_size,
            sort_field: "key".to_string(),
            fetch_source: false,
        }
    }

    /// Scrolls through the candidates and subtracts `trusted`.
    ///
    /// The scroll is cleared exactly once whether the walk finishes, stops at
    /// the page limit, or fails.
    pub async fn find_orphans(&self, trusted: &HashSet<EntityKey>) -> Result<ReconcileOutcome> {
        let span = info_span!(
            "reconcile.scroll",
            index = %self.collections.list_view,
            trusted = trusted.len()
        );
        self.scroll_and_subtract(trusted).instrument(span).await
    }

    async fn scroll_and_subtract(&self, trusted: &HashSet<EntityKey>) -> Result<ReconcileOutcome> {
        let first = self
            .index
            .open_scroll(&self.search_request(), self.config.keep_alive)
            .await?;
        let mut scroll_id = first.scroll_id.clone();

        let drained = self.drain(first, &mut scroll_id, trusted).await;

        if let Some(scroll_id) = scroll_id {
            if let Err(err) = self.index.clear_scroll(&scroll_id).await {
                event!(
                    Level::WARN,
                    scroll_id = %scroll_id,
                    error = %err,
                    "error occurred when clearing the scroll"
                );
            }
        }

        let outcome = drained?;
        event!(
            Level::INFO,
            pages = outcome.pages,
            candidates = outcome.candidates,
            orphans = outcome.keys.len(),
            "reconciliation finished"
        );
        Ok(outcome)
    }

    async fn drain(
        &self,
        first: ScrollPage,
        scroll_id: &mut Option<String>,
        trusted: &HashSet<EntityKey>,
    ) -> Result<ReconcileOutcome> {
        let mut outcome = ReconcileOutcome::default();
        let mut page = first;

        while !page.hits.is_empty() {
            outcome.pages += 1;
            outcome.candidates += page.hits.len();
            let candidates = page.hits.iter().map(hit_key).collect::<Result<Vec<_>>>()?;
            let orphans = subtract_trusted(candidates, trusted);
            event!(
                Level::INFO,
                page = outcome.pages,
                keys = ?orphans,
                "keys for cancellation"
            );
            outcome.keys.extend(orphans);

            if self
                .config
                .max_pages
                .is_some_and(|max_pages| outcome.pages >= max_pages)
            {
                event!(Level::INFO, pages = outcome.pages, "page limit reached");
                break;
            }
            let Some(current) = scroll_id.as_deref() else {
                break;
            };
            page = self.index.next_page(current, self.config.keep_alive).await?;
            if let Some(next_id) = page.scroll_id.take() {
                *scroll_id = Some(next_id);
            }
        }
        Ok(outcome)
    }
}

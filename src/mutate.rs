//! Marks orphaned process instances as cancelled across the index family,
//! one bounded batch at a time.

use crate::config::{CollectionNames, MutationConfig};
use crate::core::{EntityKey, Result};
use crate::index::{
    BulkByQueryResponse, DeleteByQuery, Query, SearchIndex, UpdateByQuery, UpdateScript,
};
use std::collections::BTreeMap;
use tracing::{Instrument, Level, event, info_span};

/// The by-query operations applied to every batch, in application order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MutationOp {
    /// Top-level list-view documents become `CANCELED`.
    CancelInstances,
    /// Active list-view activity documents become `TERMINATED`.
    TerminateListViewFlowNodes,
    /// Active flow-node instance documents become `TERMINATED`.
    TerminateFlowNodes,
    /// Active incidents become `RESOLVED`.
    ResolveIncidents,
    /// Pending post-import work is dropped.
    DeleteQueuedImports,
}

impl MutationOp {
    pub const ALL: [MutationOp; 5] = [
        Self::CancelInstances,
        Self::TerminateListViewFlowNodes,
        Self::TerminateFlowNodes,
        Self::ResolveIncidents,
        Self::DeleteQueuedImports,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CancelInstances => "cancel-instances",
            Self::TerminateListViewFlowNodes => "terminate-list-view-flow-nodes",
            Self::TerminateFlowNodes => "terminate-flow-nodes",
            Self::ResolveIncidents => "resolve-incidents",
            Self::DeleteQueuedImports => "delete-queued-imports",
        }
    }

    /// Whether fewer updated documents than submitted keys is worth a warning.
    fn expects_one_per_key(self) -> bool {
        matches!(
            self,
            Self::CancelInstances | Self::TerminateListViewFlowNodes | Self::TerminateFlowNodes
        )
    }
}

/// A by-query request built for one batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchRequest {
    Update(UpdateByQuery),
    Delete(DeleteByQuery),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpTotals {
    pub requests: usize,
    pub matched: u64,
    pub updated: u64,
    pub deleted: u64,
    pub version_conflicts: u64,
}

/// A batch where an operation updated fewer documents than keys submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortUpdate {
    pub op: MutationOp,
    pub batch: usize,
    pub keys: Vec<EntityKey>,
    pub updated: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationReport {
    pub batches: usize,
    pub keys: usize,
    pub totals: BTreeMap<MutationOp, OpTotals>,
    pub short_updates: Vec<ShortUpdate>,
    pub dry_run: bool,
}

impl MutationReport {
    pub fn totals(&self, op: MutationOp) -> OpTotals {
        self.totals.get(&op).copied().unwrap_or_default()
    }
}

pub struct MutationEngine<'a> {
    index: &'a dyn SearchIndex,
    collections: &'a CollectionNames,
    config: &'a MutationConfig,
}

impl<'a> MutationEngine<'a> {
    pub fn new(
        index: &'a dyn SearchIndex,
        collections: &'a CollectionNames,
        config: &'a MutationConfig,
    ) -> Self {
        Self {
            index,
            collections,
            config,
        }
    }

    fn closing_script(&self, state_field: &str, state: &str) -> UpdateScript {
        UpdateScript::new()
            .set(state_field, state)
            .set("incident", false)
            .set("endDate", self.config.end_date.as_str())
    }

    /// Builds the five requests for one batch of keys.
    pub fn requests_for(&self, keys: &[EntityKey]) -> Vec<(MutationOp, BatchRequest)> {
        let in_batch = || Query::terms("processInstanceKey", keys.iter().copied());
        let conflicts = self.config.conflicts;
        let collections = self.collections;

        MutationOp::ALL
            .into_iter()
            .map(|op| {
                let request = match op {
                    MutationOp::CancelInstances => BatchRequest::Update(UpdateByQuery {
                        index: collections.list_view.clone(),
                        query: Query::Bool(vec![
                            Query::term("joinRelation", "processInstance"),
                            in_batch(),
                        ]),
                        script: self.closing_script("state", "CANCELED"),
                        conflicts,
                    }),
                    MutationOp::TerminateListViewFlowNodes => BatchRequest::Update(UpdateByQuery {
                        index: collections.list_view.clone(),
                        query: Query::Bool(vec![
                            Query::term("joinRelation", "activity"),
                            Query::term("activityState", "ACTIVE"),
                            in_batch(),
                        ]),
                        script: self.closing_script("activityState", "TERMINATED"),
                        conflicts,
                    }),
                    MutationOp::TerminateFlowNodes => BatchRequest::Update(UpdateByQuery {
                        index: collections.flow_node_instance.clone(),
                        query: Query::Bool(vec![Query::term("state", "ACTIVE"), in_batch()]),
                        script: self.closing_script("state", "TERMINATED"),
                        conflicts,
                    }),
                    MutationOp::ResolveIncidents => BatchRequest::Update(UpdateByQuery {
                        index: collections.incident.clone(),
                        query: Query::Bool(vec![Query::term("state", "ACTIVE"), in_batch()]),
                        script: UpdateScript::new().set("state", "RESOLVED"),
                        conflicts,
                    }),
                    MutationOp::DeleteQueuedImports => BatchRequest::Delete(DeleteByQuery {
                        index: collections.post_importer_queue.clone(),
                        query: in_batch(),
                        conflicts,
                    }),
                };
                (op, request)
            })
            .collect()
    }

    /// Applies every operation to `keys`, batch by batch.
    ///
    /// A transport failure stops the run; batches applied before it stay
    /// applied.
    pub async fn apply(&self, keys: &[EntityKey]) -> Result<MutationReport> {
        let mut report = MutationReport {
            keys: keys.len(),
            dry_run: self.config.dry_run,
            ..MutationReport::default()
        };
        let batch_size = self.config.batch_size.max(1);

        for (batch_no, batch) in keys.chunks(batch_size).enumerate() {
            let span = info_span!("mutate.batch", batch = batch_no, size = batch.len());
            self.apply_batch(batch_no, batch, &mut report)
                .instrument(span)
                .await?;
            report.batches += 1;
        }

        event!(
            Level::INFO,
            batches = report.batches,
            keys = report.keys,
            short_updates = report.short_updates.len(),
            dry_run = report.dry_run,
            "bulk mutation finished"
        );
        Ok(report)
    }

    async fn apply_batch(
        &self,
        batch_no: usize,
        batch: &[EntityKey],
        report: &mut MutationReport,
    ) -> Result<()> {
        event!(Level::INFO, keys = ?batch, "processing process instances");

        for (op, request) in self.requests_for(batch) {
            let totals = report.totals.entry(op).or_default();
            totals.requests += 1;
            if self.config.dry_run {
                event!(Level::INFO, op = op.name(), "dry run: request skipped");
                continue;
            }

            let response = match &request {
                BatchRequest::Update(update) => self.index.update_by_query(update).await?,
                BatchRequest::Delete(delete) => self.index.delete_by_query(delete).await?,
            };
            accumulate(totals, &response);
            if !response.failures.is_empty() {
                event!(
                    Level::WARN,
                    op = op.name(),
                    failures = response.failures.len(),
                    "by-query operation reported document failures"
                );
            }

            if op.expects_one_per_key() && response.updated < batch.len() as u64 {
                event!(
                    Level::WARN,
                    op = op.name(),
                    updated = response.updated,
                    submitted = batch.len(),
                    keys = ?batch,
                    "not all documents were updated"
                );
                report.short_updates.push(ShortUpdate {
                    op,
                    batch: batch_no,
                    keys: batch.to_vec(),
                    updated: response.updated,
                });
            }
            match op {
                MutationOp::ResolveIncidents if response.updated > 0 => {
                    event!(Level::INFO, resolved = response.updated, "incidents resolved");
                }
                MutationOp::DeleteQueuedImports if response.deleted > 0 => {
                    event!(
                        Level::INFO,
                        deleted = response.deleted,
                        "post importer queue records removed"
                    );
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn accumulate(totals: &mut OpTotals, response: &BulkByQueryResponse) {
    totals.matched += response.total;
    totals.updated += response.updated;
    totals.deleted += response.deleted;
    totals.version_conflicts += response.version_conflicts;
}

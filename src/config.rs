use crate::core::{EntityKey, LostRange, LostRanges, ReconcileError, Result};
use crate::index::{Conflicts, Query, RangeBounds};
use chrono::DateTime;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timestamp layout the list-view index stores dates in.
pub const INDEX_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%z";

/// Search index connection settings
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Base URL, e.g. `http://localhost:9200`
    pub url: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Per-request timeout; by-query calls on large indices can be slow
    pub request_timeout: Duration,
}

impl IndexConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            username: None,
            password: None,
            request_timeout: Duration::from_secs(300),
        }
    }

    /// Set basic-auth credentials
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Names of the indices holding the secondary representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionNames {
    pub list_view: String,
    pub flow_node_instance: String,
    pub incident: String,
    pub post_importer_queue: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            list_view: "operate-list-view-8.3.0_".to_string(),
            flow_node_instance: "operate-flownode-instance-8.3.1_".to_string(),
            incident: "operate-incident-8.3.1_".to_string(),
            post_importer_queue: "operate-post-importer-queue-8.3.0_".to_string(),
        }
    }
}

/// Predicate selecting reconciliation candidates in the list view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFilter {
    pub state: String,
    /// Exclusive upper bound on `startDate`; date math is passed through.
    pub started_before: String,
    pub min_partition: u32,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            state: "ACTIVE".to_string(),
            started_before: "now-3M".to_string(),
            min_partition: 35,
        }
    }
}

impl CandidateFilter {
    pub fn query(&self) -> Query {
        Query::Bool(vec![
            Query::term("joinRelation", "processInstance"),
            Query::term("state", self.state.as_str()),
            Query::range(
                "startDate",
                RangeBounds::default().lt(self.started_before.as_str()),
            ),
            Query::range("partitionId", RangeBounds::default().gte(self.min_partition)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub filter: CandidateFilter,
    pub page_size: usize,
    /// Scroll keep-alive, refreshed on every page request
    pub keep_alive: Duration,
    /// Stop after this many pages (the scroll is still cleared)
    pub max_pages: Option<usize>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            filter: CandidateFilter::default(),
            page_size: 1000,
            keep_alive: Duration::from_secs(60),
            max_pages: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MutationConfig {
    pub batch_size: usize,
    /// `endDate` written to every cancelled or terminated document
    pub end_date: String,
    pub conflicts: Conflicts,
    /// Log the batches without touching the index
    pub dry_run: bool,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            end_date: "2024-08-26T12:00:00.000+0000".to_string(),
            conflicts: Conflicts::Proceed,
            dry_run: false,
        }
    }
}

impl MutationConfig {
    /// Set the cutoff timestamp, checking it matches the index date format.
    pub fn end_date(mut self, end_date: &str) -> Result<Self> {
        DateTime::parse_from_str(end_date, INDEX_DATE_FORMAT).map_err(|err| {
            ReconcileError::Config(format!(
                "end date '{}' does not match {}: {}",
                end_date, INDEX_DATE_FORMAT, err
            ))
        })?;
        self.end_date = end_date.to_string();
        Ok(self)
    }

    pub fn batch_size(mut self, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(ReconcileError::Config(
                "mutation batch size must be positive".to_string(),
            ));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Name of the variable whose values are collected
    pub variable_name: String,
    /// Reduced flow-node records held in memory at once
    pub flow_node_batch_size: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            variable_name: "varName".to_string(),
            flow_node_batch_size: 500_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub max_attempts: usize,
    /// First retry delay; doubles per attempt up to `max_backoff`. Zero disables.
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            max_attempts: 3,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl DispatchConfig {
    /// Delay before retry number `attempt` (1-based count of failed attempts).
    pub fn backoff(&self, attempt: usize) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let cap = self.max_backoff.max(self.base_backoff);
        let mut delay = self.base_backoff;
        for _ in 1..attempt {
            delay = delay.saturating_mul(2).min(cap);
        }
        delay
    }
}

/// External programs used to dump snapshot contents.
#[derive(Debug, Clone)]
pub struct ExtractConfig {
    /// State dump tool, invoked as `<program> <prefix args> state list -p=<snapshot> -cf=<family> -kf=<format>`
    pub dump_program: PathBuf,
    pub dump_prefix_args: Vec<String>,
    /// Prints the process instance keys of `<snapshot>`, one per line
    pub key_dump_program: PathBuf,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            dump_program: PathBuf::from("java"),
            dump_prefix_args: vec!["-jar".to_string(), "zdb.jar".to_string()],
            key_dump_program: PathBuf::from("pr-inst.sh"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RangeEntry {
    Pair(EntityKey, EntityKey),
    Object(LostRange),
}

/// Loads lost ranges from a JSON file (`[[start, end], ...]` or
/// `[{"start": .., "end": ..}, ...]`), or the built-in incident table.
pub fn load_lost_ranges(path: Option<&Path>) -> Result<LostRanges> {
    let Some(path) = path else {
        return Ok(LostRanges::incident_defaults());
    };
    let raw = std::fs::read_to_string(path).map_err(|err| ReconcileError::io(path, err))?;
    let entries: Vec<RangeEntry> = serde_json::from_str(&raw)
        .map_err(|err| ReconcileError::Config(format!("{}: {}", path.display(), err)))?;
    LostRanges::new(
        entries
            .into_iter()
            .map(|entry| match entry {
                RangeEntry::Pair(start, end) => LostRange::new(start, end),
                RangeEntry::Object(range) => range,
            })
            .collect(),
    )
}

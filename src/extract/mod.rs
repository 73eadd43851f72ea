//! Walks a partitioned snapshot tree and dumps the three raw record streams.
//!
//! Layout: `<root>/<partition>/snapshots/<generation>/`. Every generation is
//! dumped once per [`RecordFamily`], appending to one shared file per family.

pub mod zdb;

pub use zdb::ZdbSnapshotReader;

use crate::core::{ReconcileError, Result};
use async_trait::async_trait;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{Instrument, Level, event, info_span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordFamily {
    Keys,
    Variables,
    FlowNodes,
}

impl RecordFamily {
    pub const ALL: [RecordFamily; 3] = [Self::Keys, Self::Variables, Self::FlowNodes];

    pub fn name(self) -> &'static str {
        match self {
            Self::Keys => "keys",
            Self::Variables => "variables",
            Self::FlowNodes => "flow-nodes",
        }
    }
}

/// Dumps one record family of one snapshot generation.
#[async_trait]
pub trait SnapshotReader: Send + Sync {
    /// Appends the dumped records of `family` to `out`.
    async fn dump(&self, snapshot: &Path, family: RecordFamily, out: &Path) -> Result<()>;
}

/// Destination file per record family.
#[derive(Debug, Clone)]
pub struct ExtractOutputs {
    pub keys: PathBuf,
    pub variables: PathBuf,
    pub flow_nodes: PathBuf,
}

impl ExtractOutputs {
    pub fn path(&self, family: RecordFamily) -> &Path {
        match family {
            RecordFamily::Keys => &self.keys,
            RecordFamily::Variables => &self.variables,
            RecordFamily::FlowNodes => &self.flow_nodes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub partitions: usize,
    pub skipped_partitions: usize,
    pub snapshots: usize,
    pub key_failures: usize,
    pub flow_node_failures: usize,
}

/// Immediate subdirectories of `dir`, sorted by name.
fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|err| ReconcileError::io(dir, err))? {
        let entry = entry.map_err(|err| ReconcileError::io(dir, err))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

pub struct SnapshotExtractor<'a> {
    reader: &'a dyn SnapshotReader,
}

impl<'a> SnapshotExtractor<'a> {
    pub fn new(reader: &'a dyn SnapshotReader) -> Self {
        Self { reader }
    }

    /// Dumps every generation under `root`.
    ///
    /// Key and flow-node dump failures are logged and skipped; a variable dump
    /// failure aborts the walk. With `truncate`, the output files are emptied
    /// first, otherwise a rerun appends a second copy.
    pub async fn extract(
        &self,
        root: &Path,
        outputs: &ExtractOutputs,
        truncate: bool,
    ) -> Result<ExtractionReport> {
        for family in RecordFamily::ALL {
            let path = outputs.path(family);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| ReconcileError::io(parent, err))?;
            }
            if truncate {
                File::create(path).map_err(|err| ReconcileError::io(path, err))?;
            }
        }

        let mut report = ExtractionReport::default();
        for partition in sorted_subdirs(root)? {
            let snapshots_dir = partition.join("snapshots");
            if !snapshots_dir.is_dir() {
                event!(
                    Level::WARN,
                    partition = %partition.display(),
                    "partition has no snapshots directory, skipping"
                );
                report.skipped_partitions += 1;
                continue;
            }
            report.partitions += 1;
            event!(Level::INFO, partition = %partition.display(), "Partition");

            for snapshot in sorted_subdirs(&snapshots_dir)? {
                let span = info_span!("extract.snapshot", snapshot = %snapshot.display());
                self.dump_snapshot(&snapshot, outputs, &mut report)
                    .instrument(span)
                    .await?;
                report.snapshots += 1;
            }
        }

        event!(
            Level::INFO,
            partitions = report.partitions,
            snapshots = report.snapshots,
            key_failures = report.key_failures,
            flow_node_failures = report.flow_node_failures,
            "extraction finished"
        );
        Ok(report)
    }

    async fn dump_snapshot(
        &self,
        snapshot: &Path,
        outputs: &ExtractOutputs,
        report: &mut ExtractionReport,
    ) -> Result<()> {
        for family in RecordFamily::ALL {
            let result = self
                .reader
                .dump(snapshot, family, outputs.path(family))
                .await;
            match (family, result) {
                (_, Ok(())) => {}
                (RecordFamily::Variables, Err(err)) => return Err(err),
                (RecordFamily::Keys, Err(err)) => {
                    event!(Level::ERROR, error = %err, "key dump failed");
                    report.key_failures += 1;
                }
                (RecordFamily::FlowNodes, Err(err)) => {
                    event!(Level::ERROR, error = %err, "flow-node dump failed");
                    report.flow_node_failures += 1;
                }
            }
        }
        Ok(())
    }
}

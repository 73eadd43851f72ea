//! Staged orchestration over a work directory.
//!
//! Every stage persists its output under fixed file names so a later run can
//! resume from it instead of recomputing.

use crate::checkpoint::{self, Staged};
use crate::config::{CollectionNames, DispatchConfig, MutationConfig, ProjectionConfig, ReconcileConfig};
use crate::core::{EntityKey, JoinedVariable, LostRanges, RawVariable, ReconcileError, Result};
use crate::dispatch::{DispatchReport, Dispatcher, EntityCommandRunner};
use crate::extract::{ExtractOutputs, ExtractionReport, SnapshotExtractor, SnapshotReader};
use crate::index::SearchIndex;
use crate::mutate::{MutationEngine, MutationReport};
use crate::project::{self, FlowNodeMapping, ReduceStats, SentinelNameFilter};
use crate::range_filter;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{Level, event, info_span};

/// File layout of a work directory.
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Every process instance key the broker knows.
    pub fn trusted_keys(&self) -> PathBuf {
        self.root.join("process-instances")
    }

    pub fn raw_variables(&self) -> PathBuf {
        self.root.join("variables.json")
    }

    pub fn raw_flow_nodes(&self) -> PathBuf {
        self.root.join("flow-node-instances.json")
    }

    pub fn affected_keys(&self) -> PathBuf {
        self.root.join("process-instances-4-removal")
    }

    pub fn projected_variables(&self) -> PathBuf {
        self.root.join("varNameVars.json")
    }

    pub fn reduced_flow_nodes(&self) -> PathBuf {
        self.root.join("flow-node-instances-small.json")
    }

    pub fn flow_node_mapping(&self) -> PathBuf {
        self.root.join("flow-node-instances-4-removal.json")
    }

    pub fn joined_variables(&self) -> PathBuf {
        self.root.join("varNameVars-4-removal.json")
    }

    pub fn reconciled_keys(&self) -> PathBuf {
        self.root.join("process-instances-2-cancel-in-operate")
    }

    pub fn reconciled_keys_json(&self) -> PathBuf {
        self.root.join("process-instances-2-cancel-in-operate.json")
    }

    pub fn extract_outputs(&self) -> ExtractOutputs {
        ExtractOutputs {
            keys: self.trusted_keys(),
            variables: self.raw_variables(),
            flow_nodes: self.raw_flow_nodes(),
        }
    }
}

/// Analysis stages in execution order. Stages before the resume point are
/// loaded from their checkpoint files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AnalyzeStage {
    FilterKeys,
    ProjectVariables,
    ReduceFlowNodes,
    NarrowFlowNodes,
    JoinVariables,
}

#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub affected: Staged<Vec<EntityKey>>,
    pub variables: Staged<Vec<RawVariable>>,
    /// `None` when the reduced file was taken from a previous run.
    pub reduced: Option<ReduceStats>,
    pub mapping: Staged<FlowNodeMapping>,
    pub joined: Staged<Vec<JoinedVariable>>,
}

fn open_reader(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|err| ReconcileError::io(path, err))
}

/// Computes a stage or reloads it, depending on the resume point.
fn run_stage<T>(
    stage: AnalyzeStage,
    resume_from: AnalyzeStage,
    compute: impl FnOnce() -> Result<T>,
    load: impl FnOnce() -> Result<T>,
) -> Result<Staged<T>> {
    if stage < resume_from {
        event!(Level::INFO, stage = ?stage, "stage loaded from checkpoint");
        load().map(Staged::checkpoint)
    } else {
        let _span = info_span!("analyze.stage", stage = ?stage).entered();
        compute().map(Staged::computed)
    }
}

/// Runs the analysis stages synchronously; call from a blocking context.
pub fn run_analysis(
    work_dir: &WorkDir,
    ranges: &LostRanges,
    config: &ProjectionConfig,
    resume_from: AnalyzeStage,
) -> Result<AnalysisOutcome> {
    let affected = run_stage(
        AnalyzeStage::FilterKeys,
        resume_from,
        || {
            let keys = checkpoint::open_key_lines(&work_dir.trusted_keys())?;
            let affected = range_filter::filter_affected(ranges, keys)?;
            checkpoint::write_keys(&work_dir.affected_keys(), &affected)?;
            event!(Level::INFO, affected = affected.len(), "affected process instances selected");
            Ok(affected)
        },
        || checkpoint::read_keys(&work_dir.affected_keys()),
    )?;

    let variables = run_stage(
        AnalyzeStage::ProjectVariables,
        resume_from,
        || {
            let filter = SentinelNameFilter::new(&config.variable_name)?;
            let reader = open_reader(&work_dir.raw_variables())?;
            let variables = project::project_variables(reader, &filter)?;
            checkpoint::write_json(&work_dir.projected_variables(), &variables)?;
            Ok(variables)
        },
        || checkpoint::read_json(&work_dir.projected_variables()),
    )?;

    let reduced = run_stage(
        AnalyzeStage::ReduceFlowNodes,
        resume_from,
        || {
            let reader = open_reader(&work_dir.raw_flow_nodes())?;
            project::reduce_flow_nodes(reader, &work_dir.reduced_flow_nodes()).map(Some)
        },
        || Ok(None),
    )?
    .value;

    let affected_set: HashSet<EntityKey> = affected.value.iter().copied().collect();
    let mapping = run_stage(
        AnalyzeStage::NarrowFlowNodes,
        resume_from,
        || {
            let mapping = project::narrow_flow_nodes(
                &work_dir.reduced_flow_nodes(),
                &affected_set,
                config.flow_node_batch_size,
            )?;
            checkpoint::write_json(&work_dir.flow_node_mapping(), &mapping)?;
            Ok(mapping)
        },
        || checkpoint::read_json(&work_dir.flow_node_mapping()),
    )?;

    let joined = run_stage(
        AnalyzeStage::JoinVariables,
        resume_from,
        || {
            let joined = project::join_variables(&variables.value, &mapping.value)?;
            checkpoint::write_json(&work_dir.joined_variables(), &joined)?;
            Ok(joined)
        },
        || checkpoint::read_json(&work_dir.joined_variables()),
    )?;

    Ok(AnalysisOutcome {
        affected,
        variables,
        reduced,
        mapping,
        joined,
    })
}

pub struct Pipeline {
    work_dir: WorkDir,
}

impl Pipeline {
    pub fn new(work_dir: WorkDir) -> Self {
        Self { work_dir }
    }

    pub fn work_dir(&self) -> &WorkDir {
        &self.work_dir
    }

    pub async fn extract(
        &self,
        reader: &dyn SnapshotReader,
        snapshot_root: &Path,
        truncate: bool,
    ) -> Result<ExtractionReport> {
        SnapshotExtractor::new(reader)
            .extract(snapshot_root, &self.work_dir.extract_outputs(), truncate)
            .await
    }

    /// Runs the analysis on the blocking pool; batch filtering uses rayon.
    pub async fn analyze(
        &self,
        ranges: LostRanges,
        config: ProjectionConfig,
        resume_from: AnalyzeStage,
    ) -> Result<AnalysisOutcome> {
        let work_dir = self.work_dir.clone();
        tokio::task::spawn_blocking(move || run_analysis(&work_dir, &ranges, &config, resume_from))
            .await?
    }

    /// Finds list-view instances unknown to the broker and persists them.
    pub async fn reconcile(
        &self,
        index: &dyn SearchIndex,
        collections: &CollectionNames,
        config: &ReconcileConfig,
    ) -> Result<ReconcileOutcome> {
        let trusted: HashSet<EntityKey> =
            checkpoint::open_key_lines(&self.work_dir.trusted_keys())?.collect::<Result<_>>()?;
        event!(Level::INFO, trusted = trusted.len(), "trusted keys loaded");

        let outcome = Reconciler::new(index, collections, config)
            .find_orphans(&trusted)
            .await?;
        checkpoint::write_keys(&self.work_dir.reconciled_keys(), &outcome.keys)?;
        checkpoint::write_json(&self.work_dir.reconciled_keys_json(), &outcome.keys)?;
        Ok(outcome)
    }

    /// Applies the bulk mutations to reconciled keys, either freshly computed
    /// or read back from the last reconcile run.
    pub async fn correct(
        &self,
        index: &dyn SearchIndex,
        collections: &CollectionNames,
        reconcile: &ReconcileConfig,
        mutation: &MutationConfig,
        from_checkpoint: bool,
    ) -> Result<(Staged<Vec<EntityKey>>, MutationReport)> {
        let keys = if from_checkpoint {
            Staged::checkpoint(checkpoint::read_keys(&self.work_dir.reconciled_keys())?)
        } else {
            Staged::computed(self.reconcile(index, collections, reconcile).await?.keys)
        };
        event!(
            Level::INFO,
            keys = keys.value.len(),
            source = ?keys.source,
            "correcting process instances"
        );
        let report = MutationEngine::new(index, collections, mutation)
            .apply(&keys.value)
            .await?;
        Ok((keys, report))
    }

    /// Cancels every affected instance through the live service.
    pub async fn cancel(
        &self,
        runner: Arc<dyn EntityCommandRunner>,
        config: DispatchConfig,
    ) -> Result<DispatchReport> {
        let keys = checkpoint::read_keys(&self.work_dir.affected_keys())?;
        Dispatcher::new(runner, config).cancel_all(&keys).await
    }
}

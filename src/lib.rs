// ============================================================================
// instance-reconcile
// ============================================================================
//
// Reconciles process instances between a broker's snapshot state and the
// search index that mirrors it, after keys in known ranges were lost.

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod extract;
pub mod index;
pub mod mutate;
pub mod pipeline;
pub mod project;
pub mod range_filter;
pub mod reconcile;

pub use checkpoint::{StageSource, Staged};
pub use config::{
    CandidateFilter, CollectionNames, DispatchConfig, ExtractConfig, IndexConfig, MutationConfig,
    ProjectionConfig, ReconcileConfig, load_lost_ranges,
};
pub use core::{
    EntityKey, FlowNodeRef, JoinedVariable, LostRange, LostRanges, RawVariable, ReconcileError,
    Result,
};
pub use dispatch::{
    CliCommandRunner, DispatchReport, Dispatcher, EntityCommandRunner, EntityOutcome, EntityState,
};
pub use extract::{
    ExtractOutputs, ExtractionReport, RecordFamily, SnapshotExtractor, SnapshotReader,
    ZdbSnapshotReader,
};
pub use index::{ElasticIndex, InMemoryIndex, SearchIndex};
pub use mutate::{MutationEngine, MutationOp, MutationReport};
pub use pipeline::{AnalysisOutcome, AnalyzeStage, Pipeline, WorkDir};
pub use reconcile::{ReconcileOutcome, Reconciler};

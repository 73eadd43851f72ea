use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use instance_reconcile::{
    AnalyzeStage, CliCommandRunner, CollectionNames, DispatchConfig, ElasticIndex, ExtractConfig,
    IndexConfig, MutationConfig, Pipeline, ProjectionConfig, ReconcileConfig, WorkDir,
    ZdbSnapshotReader, load_lost_ranges,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "instance-reconcile")]
#[command(about = "Reconciles process instances lost from broker state with the search index")]
struct Cli {
    /// Directory holding the intermediate files of every stage
    #[arg(long, global = true, default_value = ".")]
    work_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Dump keys, variables and flow nodes from every partition snapshot
    Extract {
        /// Root of the partitioned snapshot tree
        #[arg(long)]
        snapshots: PathBuf,
        /// Empty the output files before dumping
        #[arg(long)]
        truncate: bool,
        #[arg(long, default_value = "java")]
        dump_program: PathBuf,
        /// Arguments placed before `state list`; repeatable
        #[arg(long = "dump-arg", default_values_t = ["-jar".to_string(), "zdb.jar".to_string()])]
        dump_args: Vec<String>,
        #[arg(long, default_value = "pr-inst.sh")]
        key_dump_program: PathBuf,
    },
    /// Select affected instances and project their flow nodes and variables
    Analyze {
        /// Load earlier stages from their files and recompute from this one
        #[arg(long, value_enum, default_value_t = Stage::FilterKeys)]
        resume_from: Stage,
        /// JSON file of lost key ranges; the incident table when omitted
        #[arg(long)]
        lost_ranges: Option<PathBuf>,
        #[arg(long, default_value = "varName")]
        variable_name: String,
        #[arg(long, default_value_t = 500_000)]
        flow_node_batch_size: usize,
    },
    /// List index instances the broker no longer knows
    Reconcile {
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        scan: ScanArgs,
    },
    /// Mark reconciled instances as cancelled in the index
    Correct {
        #[command(flatten)]
        index: IndexArgs,
        #[command(flatten)]
        scan: ScanArgs,
        /// Use the keys of the last `reconcile` run instead of scanning again
        #[arg(long)]
        from_checkpoint: bool,
        /// Log batches without changing the index
        #[arg(long)]
        dry_run: bool,
        /// endDate written to closed documents
        #[arg(long)]
        end_date: Option<String>,
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
    },
    /// Cancel affected instances one by one through the live service
    Cancel {
        #[arg(long, default_value = "zbctl")]
        program: PathBuf,
        /// Arguments placed before the key; repeatable
        #[arg(long = "arg", default_values_t = ["--insecure".to_string(), "cancel".to_string(), "instance".to_string()])]
        args: Vec<String>,
        #[arg(long, default_value_t = 10)]
        workers: usize,
        #[arg(long, default_value_t = 3)]
        max_attempts: usize,
        /// First retry delay in milliseconds, doubled per attempt
        #[arg(long, default_value_t = 0)]
        backoff_ms: u64,
    },
}

#[derive(Args)]
struct IndexArgs {
    #[arg(long, env = "ES_URL", default_value = "http://localhost:9200")]
    es_url: String,
    #[arg(long, env = "ES_USERNAME")]
    es_username: Option<String>,
    #[arg(long, env = "ES_PASSWORD", hide_env_values = true)]
    es_password: Option<String>,
    #[arg(long, default_value_t = 300)]
    request_timeout_secs: u64,
}

impl IndexArgs {
    fn connect(&self) -> Result<ElasticIndex> {
        let mut config = IndexConfig::new(&self.es_url)
            .request_timeout(Duration::from_secs(self.request_timeout_secs));
        if let Some(username) = &self.es_username {
            config = config.credentials(username, self.es_password.as_deref().unwrap_or_default());
        }
        ElasticIndex::connect(&config).context("failed to create search index client")
    }
}

#[derive(Args)]
struct ScanArgs {
    /// Stop after this many pages
    #[arg(long)]
    max_pages: Option<usize>,
    #[arg(long, default_value = "now-3M")]
    started_before: String,
    #[arg(long, default_value_t = 35)]
    min_partition: u32,
}

impl ScanArgs {
    fn config(&self) -> ReconcileConfig {
        let mut config = ReconcileConfig {
            max_pages: self.max_pages,
            ..ReconcileConfig::default()
        };
        config.filter.started_before = self.started_before.clone();
        config.filter.min_partition = self.min_partition;
        config
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    FilterKeys,
    ProjectVariables,
    ReduceFlowNodes,
    NarrowFlowNodes,
    JoinVariables,
}

impl From<Stage> for AnalyzeStage {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::FilterKeys => AnalyzeStage::FilterKeys,
            Stage::ProjectVariables => AnalyzeStage::ProjectVariables,
            Stage::ReduceFlowNodes => AnalyzeStage::ReduceFlowNodes,
            Stage::NarrowFlowNodes => AnalyzeStage::NarrowFlowNodes,
            Stage::JoinVariables => AnalyzeStage::JoinVariables,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let pipeline = Pipeline::new(WorkDir::new(&cli.work_dir));
    let collections = CollectionNames::default();

    match cli.command {
        Command::Extract {
            snapshots,
            truncate,
            dump_program,
            dump_args,
            key_dump_program,
        } => {
            let reader = ZdbSnapshotReader::new(ExtractConfig {
                dump_program,
                dump_prefix_args: dump_args,
                key_dump_program,
            });
            let report = pipeline
                .extract(&reader, &snapshots, truncate)
                .await
                .with_context(|| format!("extraction from {} failed", snapshots.display()))?;
            info!(
                partitions = report.partitions,
                snapshots = report.snapshots,
                "snapshots extracted"
            );
        }
        Command::Analyze {
            resume_from,
            lost_ranges,
            variable_name,
            flow_node_batch_size,
        } => {
            let ranges = load_lost_ranges(lost_ranges.as_deref())
                .context("failed to load lost key ranges")?;
            let config = ProjectionConfig {
                variable_name,
                flow_node_batch_size,
            };
            let outcome = pipeline
                .analyze(ranges, config, resume_from.into())
                .await
                .context("analysis failed")?;
            info!(
                affected = outcome.affected.value.len(),
                flow_nodes = outcome.mapping.value.len(),
                variables = outcome.joined.value.len(),
                "analysis finished"
            );
        }
        Command::Reconcile { index, scan } => {
            let client = index.connect()?;
            let outcome = pipeline
                .reconcile(&client, &collections, &scan.config())
                .await
                .context("reconciliation failed")?;
            info!(
                orphans = outcome.keys.len(),
                file = %pipeline.work_dir().reconciled_keys().display(),
                "reconciled keys written"
            );
        }
        Command::Correct {
            index,
            scan,
            from_checkpoint,
            dry_run,
            end_date,
            batch_size,
        } => {
            let mut mutation = MutationConfig::default()
                .batch_size(batch_size)?
                .dry_run(dry_run);
            if let Some(end_date) = end_date {
                mutation = mutation.end_date(&end_date)?;
            }
            let client = index.connect()?;
            let (keys, report) = pipeline
                .correct(&client, &collections, &scan.config(), &mutation, from_checkpoint)
                .await
                .context("correction failed")?;
            if !report.short_updates.is_empty() {
                warn!(
                    batches = report.short_updates.len(),
                    "some batches updated fewer documents than keys"
                );
            }
            info!(
                keys = keys.value.len(),
                batches = report.batches,
                dry_run = report.dry_run,
                "correction finished"
            );
        }
        Command::Cancel {
            program,
            args,
            workers,
            max_attempts,
            backoff_ms,
        } => {
            let config = DispatchConfig {
                workers,
                max_attempts,
                base_backoff: Duration::from_millis(backoff_ms),
                ..DispatchConfig::default()
            };
            let runner = Arc::new(CliCommandRunner::new(program, args));
            let report = pipeline
                .cancel(runner, config)
                .await
                .context("cancellation failed")?;
            if report.failed() > 0 {
                warn!(keys = ?report.failed_keys(), "instances that could not be cancelled");
            }
            info!(
                succeeded = report.succeeded(),
                failed = report.failed(),
                "cancellation finished"
            );
        }
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("instance_reconcile=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

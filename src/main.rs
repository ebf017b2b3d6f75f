use crawl_fleet::cli::{Cli, ClusterArgs, Commands};
use crawl_fleet::fetch_worker::{FetchWorker, WorkerError, WorkerReport, worker_output_path};
use crawl_fleet::index_locator::{IndexLocator, LocatorError};
use crawl_fleet::ledger::LedgerError;
use crawl_fleet::logging;
use crawl_fleet::merge::merge_outputs;
use crawl_fleet::network::{FetchError, HttpClient};
use crawl_fleet::orchestration::executor::{
    ExecutorError, LaunchOutcome, LaunchSettings, PipelineExecutor, RunMode, RunOutcome,
};
use crawl_fleet::orchestration::fleet::{FleetConfig, FleetError, FleetMonitor, RecreateNaming};
use crawl_fleet::orchestration::manifest::{ManifestError, TaskDescriptor};
use crawl_fleet::orchestration::scheduler::{KubeScheduler, Scheduler, SchedulerError, VolumeMount};
use crawl_fleet::orchestration::stages::{RankPipeline, StageSpec};
use crawl_fleet::partition::{PartitionAssignment, PartitionError};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(#[from] FetchError),

    #[error("Index error: {0}")]
    Locator(#[from] LocatorError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("Output error: {0}")]
    Output(#[from] LedgerError),

    #[error("Invalid worker assignment: {0}")]
    Partition(#[from] PartitionError),

    #[error("Job state error: {0}")]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("Cluster error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("{0}")]
    PartialFailure(String),
}

impl From<Box<dyn std::error::Error>> for MainError {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        MainError::Config(err.to_string())
    }
}

impl MainError {
    /// 3=I/O or config error, 4=network or cluster error, 5=partial failure
    fn exit_code(&self) -> u8 {
        match self {
            MainError::Io(_)
            | MainError::Config(_)
            | MainError::Output(_)
            | MainError::Partition(_)
            | MainError::Manifest(_) => 3,
            MainError::Executor(ExecutorError::RanksFailed(_)) | MainError::PartialFailure(_) => 5,
            MainError::Executor(ExecutorError::Manifest(_))
            | MainError::Executor(ExecutorError::InvalidTaskId { .. }) => 3,
            MainError::Fleet(FleetError::NoIndexes | FleetError::NoWorkers) => 3,
            _ => 4,
        }
    }
}

fn build_scheduler(cluster: &ClusterArgs) -> Result<Arc<dyn Scheduler>, MainError> {
    let scheduler = match &cluster.api_server {
        Some(api_server) => {
            KubeScheduler::new(api_server, &cluster.namespace, cluster.api_token.clone())?
        }
        None => KubeScheduler::in_cluster(Some(cluster.namespace.as_str()))?,
    };
    Ok(Arc::new(scheduler))
}

fn launch_settings(
    cluster: &ClusterArgs,
    workers: Option<usize>,
    volume: Option<VolumeMount>,
) -> LaunchSettings {
    LaunchSettings {
        image: cluster.image.clone(),
        cpu_request: cluster.cpu.clone(),
        memory_request: cluster.memory.clone(),
        workers,
        volume,
        ..LaunchSettings::default()
    }
}

fn report_launch(job_name: &str, outcome: &LaunchOutcome) {
    match outcome {
        LaunchOutcome::AlreadyComplete => {
            println!("{}: all ranks already complete, nothing submitted", job_name)
        }
        LaunchOutcome::Submitted {
            job_id,
            replicas,
            parallelism,
        } => println!(
            "{}: submitted job {} ({} replicas, parallelism {})",
            job_name, job_id, replicas, parallelism
        ),
    }
}

async fn run(cli: Cli, mode: RunMode) -> Result<(), MainError> {
    let in_cluster_worker = matches!(cli.command, Commands::Worker { .. })
        || (matches!(cli.command, Commands::Pipeline { .. })
            && matches!(mode, RunMode::Replica { .. }));
    if in_cluster_worker {
        logging::init_stdout_logging()?;
    } else {
        logging::init_logging(&cli.log_dir)?;
    }

    let http = HttpClient::new(cli.user_agent.clone(), cli.timeout)?;

    match cli.command {
        Commands::Launch {
            job_name,
            index,
            pattern,
            tasks,
            ranks_per_replica,
            workers,
            logging_dir,
            output_dir,
            merge_output,
            depends_job_id,
            no_skip_completed,
            claim,
            mount_path,
            source,
            cluster,
        } => {
            let scheduler = build_scheduler(&cluster)?;
            let volume = claim.map(|claim_name| VolumeMount {
                claim_name,
                mount_path,
            });
            let settings = launch_settings(&cluster, workers, volume);

            let stage = StageSpec::CommonCrawl {
                index,
                pattern,
                index_server: source.index_server,
                archive_base: source.archive_base,
                output_dir: output_dir.clone(),
            };
            let descriptor = TaskDescriptor::new(&job_name, tasks, &logging_dir, stage)
                .with_ranks_per_replica(ranks_per_replica)
                .with_skip_completed(!no_skip_completed);

            let mut crawl = PipelineExecutor::new(descriptor, settings.clone())
                .with_scheduler(scheduler.clone());
            if let Some(job_id) = depends_job_id {
                crawl = crawl.depends_on_job(job_id);
            }

            match merge_output {
                None => {
                    let outcome = crawl.launch().await?;
                    report_launch(&job_name, &outcome);
                }
                Some(output) => {
                    let merge_name = format!("{}-merge", job_name);
                    let merge_descriptor = TaskDescriptor::new(
                        &merge_name,
                        1,
                        logging_dir.join("merge"),
                        StageSpec::Merge {
                            input_dir: output_dir,
                            output,
                        },
                    )
                    .with_skip_completed(!no_skip_completed);

                    let mut merge = PipelineExecutor::new(merge_descriptor, settings)
                        .with_scheduler(scheduler)
                        .depends_on(crawl);
                    let outcome = merge.launch().await?;
                    report_launch(&merge_name, &outcome);
                }
            }
        }

        Commands::Pipeline {
            descriptor,
            cluster,
        } => {
            let descriptor = TaskDescriptor::load(&descriptor)?;
            let job_name = descriptor.job_name.clone();

            let mut executor = match mode {
                RunMode::Replica { .. } => {
                    let pipeline: Arc<dyn RankPipeline> = Arc::from(descriptor.stage.build(http));
                    PipelineExecutor::new(descriptor, LaunchSettings::default())
                        .with_pipeline(pipeline)
                }
                RunMode::Controller => {
                    let scheduler = build_scheduler(&cluster)?;
                    PipelineExecutor::resume(descriptor, launch_settings(&cluster, None, None))
                        .with_scheduler(scheduler)
                }
            };

            match executor.run(mode).await? {
                RunOutcome::Launched(outcome) => report_launch(&job_name, &outcome),
                RunOutcome::Replica(report) => tracing::info!(
                    completion_index = report.completion_index,
                    completed = ?report.completed,
                    skipped = ?report.skipped,
                    "replica finished"
                ),
            }
        }

        Commands::Worker {
            indexes,
            pattern,
            worker_id,
            total_workers,
            output_dir,
            source,
        } => {
            let assignment = PartitionAssignment::new(worker_id, total_workers)?;
            let worker = FetchWorker::new(http, &source.index_server, &source.archive_base);

            let mut total = WorkerReport::default();
            let mut failed = Vec::new();
            for index in &indexes {
                let output = worker_output_path(&output_dir, index, assignment);
                match worker.process_index(index, &pattern, assignment, &output).await {
                    Ok(report) => total.merge(&report),
                    Err(e @ WorkerError::Locator { .. }) => {
                        tracing::error!(%index, error = %e, "skipping index");
                        failed.push(index.clone());
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            tracing::info!(worker = %assignment, report = %total, "worker finished");
            println!("worker {}: {}", assignment, total);
            if !failed.is_empty() {
                return Err(MainError::PartialFailure(format!(
                    "{} of {} indexes failed: {}",
                    failed.len(),
                    indexes.len(),
                    failed.join(", ")
                )));
            }
        }

        Commands::Fleet {
            pattern,
            indexes,
            workers,
            claim,
            mount_path,
            max_failures,
            poll_secs,
            cooldown_secs,
            reuse_names,
            index_server,
            cluster,
        } => {
            let indexes = if indexes.is_empty() {
                IndexLocator::new(http, index_server).list_indexes().await?
            } else {
                indexes
            };

            let mut config = FleetConfig::new(&pattern, indexes, workers);
            config.image = cluster.image.clone();
            config.cpu_request = cluster.cpu.clone();
            config.memory_request = cluster.memory.clone();
            config.data_claim = claim;
            config.mount_path = mount_path;
            config.max_failures = max_failures;
            config.poll_interval = Duration::from_secs(poll_secs);
            config.restart_cooldown = Duration::from_secs(cooldown_secs);
            if reuse_names {
                config.recreate_naming = RecreateNaming::ReuseName;
            }

            let scheduler = build_scheduler(&cluster)?;
            let report = FleetMonitor::new(scheduler, config).run().await?;

            println!(
                "fleet: {} submitted, {} succeeded, {} abandoned, {} restarts",
                report.submitted,
                report.succeeded.len(),
                report.abandoned.len(),
                report.restarts
            );
            for job in &report.abandoned {
                println!("  abandoned: {}", job);
            }
            if !report.abandoned.is_empty() {
                return Err(MainError::PartialFailure(format!(
                    "{} jobs abandoned",
                    report.abandoned.len()
                )));
            }
        }

        Commands::Merge { input_dir, output } => {
            let report = merge_outputs(&input_dir, &output)?;
            println!(
                "Merged {} files into {}: {} unique records, {} duplicates, {} unreadable lines",
                report.files,
                output.display(),
                report.unique_records,
                report.duplicates,
                report.unreadable
            );
        }

        Commands::Indexes { index_server } => {
            let indexes = IndexLocator::new(http, index_server).list_indexes().await?;
            for index in indexes {
                println!("{}", index);
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Role is fixed for the life of the process.
    let mode = match RunMode::from_env() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(2);
        }
    };

    match run(cli, mode).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "exiting with error");
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

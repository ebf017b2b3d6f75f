//! Cluster pipeline executor.
//!
//! One binary plays two roles. Started without a task id it is the controller: it works out which
//! ranks are still pending, persists the manifest and descriptor, and submits one indexed job.
//! Started with a task id it is a replica of that job: it reads the manifest back and runs its
//! slice of ranks, marking each one complete as it finishes.

use crate::config::Config;
use crate::orchestration::manifest::{
    JobResources, LoggingDir, ManifestError, TaskDescriptor, replica_count, replica_positions,
};
use crate::orchestration::scheduler::{
    JobDescriptor, JobStatus, Scheduler, SchedulerError, VolumeMount,
};
use crate::orchestration::shutdown;
use crate::orchestration::stages::{RankPipeline, StageError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Job id recorded when the controller finds nothing left to run.
pub const ALREADY_COMPLETE: &str = "already-complete";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid {var}={value:?}: expected a non-negative integer")]
    InvalidTaskId { var: &'static str, value: String },

    #[error("executor has no {0} configured")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("job submission failed: {0}")]
    Submission(#[source] SchedulerError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("dependency job {job} did not complete: {status:?}")]
    DependencyFailed { job: String, status: JobStatus },

    #[error("dependency job {job} succeeded but ranks {pending:?} have no completion marker")]
    DependencyIncomplete { job: String, pending: Vec<usize> },

    #[error(transparent)]
    Stage(#[from] StageError),

    #[error("ranks failed: {0:?}")]
    RanksFailed(Vec<usize>),
}

/// Role of this process, decided once at start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Controller,
    Replica { completion_index: usize },
}

impl RunMode {
    pub fn from_env() -> Result<Self, ExecutorError> {
        let value = std::env::var(Config::TASK_ID_ENV).ok();
        Self::from_task_id(value.as_deref())
    }

    pub fn from_task_id(value: Option<&str>) -> Result<Self, ExecutorError> {
        match value.map(str::trim) {
            None | Some("") => Ok(RunMode::Controller),
            Some(raw) => raw
                .parse()
                .map(|completion_index| RunMode::Replica { completion_index })
                .map_err(|_| ExecutorError::InvalidTaskId {
                    var: Config::TASK_ID_ENV,
                    value: raw.to_string(),
                }),
        }
    }
}

/// Cluster-side settings for the job the controller submits.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub image: String,
    /// Entry point inside the image; the replica arguments are appended by the executor.
    pub command: Vec<String>,
    pub cpu_request: String,
    pub memory_request: String,
    /// Upper bound on replicas running at once. `None` runs every replica in parallel.
    pub workers: Option<usize>,
    pub backoff_limit: u32,
    pub env: BTreeMap<String, String>,
    pub volume: Option<VolumeMount>,
    pub dependency_poll: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            image: Config::IMAGE.to_string(),
            command: vec!["crawl-fleet".to_string()],
            cpu_request: Config::CPU_REQUEST.to_string(),
            memory_request: Config::MEMORY_REQUEST.to_string(),
            workers: None,
            backoff_limit: Config::BACKOFF_LIMIT,
            env: BTreeMap::new(),
            volume: None,
            dependency_poll: Duration::from_secs(Config::DEPENDENCY_POLL_SECS),
        }
    }
}

impl LaunchSettings {
    /// The part of these settings persisted in the task descriptor.
    pub fn resources(&self) -> JobResources {
        JobResources {
            image: self.image.clone(),
            cpu_request: self.cpu_request.clone(),
            memory_request: self.memory_request.clone(),
            workers: self.workers,
            backoff_limit: self.backoff_limit,
            volume: self.volume.clone(),
        }
    }

    pub fn with_resources(mut self, resources: &JobResources) -> Self {
        self.image = resources.image.clone();
        self.cpu_request = resources.cpu_request.clone();
        self.memory_request = resources.memory_request.clone();
        self.workers = resources.workers;
        self.backoff_limit = resources.backoff_limit;
        self.volume = resources.volume.clone();
        self
    }
}

/// Something that has to finish before this pipeline's job is submitted.
pub enum Dependency {
    /// Launched (if needed) and waited on.
    Pipeline(Box<PipelineExecutor>),
    /// Already-submitted job id supplied by the caller; treated as satisfied.
    Job(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    AlreadyComplete,
    Submitted {
        job_id: String,
        replicas: usize,
        parallelism: usize,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaReport {
    pub completion_index: usize,
    pub completed: Vec<usize>,
    /// Ranks already marked complete by an earlier attempt of this replica.
    pub skipped: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Launched(LaunchOutcome),
    Replica(ReplicaReport),
}

pub struct PipelineExecutor {
    descriptor: TaskDescriptor,
    launch: LaunchSettings,
    scheduler: Option<Arc<dyn Scheduler>>,
    pipeline: Option<Arc<dyn RankPipeline>>,
    depends: Option<Dependency>,
    handle_signals: bool,
    job_id: Option<String>,
}

impl PipelineExecutor {
    pub fn new(descriptor: TaskDescriptor, launch: LaunchSettings) -> Self {
        Self {
            descriptor,
            launch,
            scheduler: None,
            pipeline: None,
            depends: None,
            handle_signals: true,
            job_id: None,
        }
    }

    /// Controller for a persisted descriptor. Resources recorded by an earlier launch take
    /// precedence over `fallback`, so the resubmitted job mounts the same volume and keeps the
    /// same parallelism cap.
    pub fn resume(descriptor: TaskDescriptor, fallback: LaunchSettings) -> Self {
        let launch = match &descriptor.resources {
            Some(resources) => fallback.with_resources(resources),
            None => fallback,
        };
        Self::new(descriptor, launch)
    }

    /// Needed in controller mode.
    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Needed in replica mode.
    pub fn with_pipeline(mut self, pipeline: Arc<dyn RankPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn depends_on(mut self, dependency: PipelineExecutor) -> Self {
        self.depends = Some(Dependency::Pipeline(Box::new(dependency)));
        self
    }

    pub fn depends_on_job(mut self, job_id: impl Into<String>) -> Self {
        self.depends = Some(Dependency::Job(job_id.into()));
        self
    }

    /// Replicas normally exit on SIGTERM/SIGINT; embedders that manage signals themselves opt out.
    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }

    pub fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    /// Job id returned by the scheduler, or [`ALREADY_COMPLETE`]. `None` before launch.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn logging(&self) -> LoggingDir {
        self.descriptor.logging()
    }

    pub fn incomplete_ranks(&self) -> Vec<usize> {
        self.logging()
            .incomplete_ranks(self.descriptor.tasks, self.descriptor.skip_completed)
    }

    pub async fn run(&mut self, mode: RunMode) -> Result<RunOutcome, ExecutorError> {
        match mode {
            RunMode::Controller => self.launch().await.map(RunOutcome::Launched),
            RunMode::Replica { completion_index } => self
                .run_replica(completion_index)
                .await
                .map(RunOutcome::Replica),
        }
    }

    /// Controller mode: gate on the dependency, then submit one replica per
    /// `ranks_per_replica` pending ranks.
    #[tracing::instrument(skip(self), fields(job = %self.descriptor.job_name))]
    pub async fn launch(&mut self) -> Result<LaunchOutcome, ExecutorError> {
        self.descriptor
            .stage
            .validate(self.descriptor.tasks)?;
        self.wait_for_dependency().await?;

        let pending = self.incomplete_ranks();
        if pending.is_empty() {
            tracing::info!(tasks = self.descriptor.tasks, "all ranks complete, nothing to submit");
            self.job_id = Some(ALREADY_COMPLETE.to_string());
            return Ok(LaunchOutcome::AlreadyComplete);
        }

        let scheduler = self
            .scheduler
            .clone()
            .ok_or(ExecutorError::NotConfigured("scheduler"))?;

        let logging = self.logging();
        if !self.descriptor.skip_completed {
            // Stale markers from an earlier run must not satisfy anyone waiting on this job.
            for &rank in &pending {
                logging.clear_complete(rank)?;
            }
        }
        self.descriptor.resources = Some(self.launch.resources());
        self.descriptor.save(logging.descriptor_path())?;
        logging.write_manifest(&pending)?;

        let replicas = replica_count(pending.len(), self.descriptor.ranks_per_replica);
        let parallelism = match self.launch.workers {
            Some(workers) if workers > 0 => workers.min(replicas),
            _ => replicas,
        };

        let job = self.job_descriptor(replicas, parallelism);
        let job_id = scheduler
            .submit(&job)
            .await
            .map_err(ExecutorError::Submission)?;

        tracing::info!(
            %job_id,
            pending = pending.len(),
            replicas,
            parallelism,
            "submitted pipeline job"
        );
        self.job_id = Some(job_id.clone());
        Ok(LaunchOutcome::Submitted {
            job_id,
            replicas,
            parallelism,
        })
    }

    /// The indexed job running every replica of this pipeline.
    pub fn job_descriptor(&self, replicas: usize, parallelism: usize) -> JobDescriptor {
        let descriptor_path = self.logging().descriptor_path();
        let mut job = JobDescriptor::new(&self.descriptor.job_name, &self.launch.image);
        job.command = self.launch.command.clone();
        job.args = vec![
            "pipeline".to_string(),
            "--descriptor".to_string(),
            descriptor_path.display().to_string(),
        ];
        job.env = self.launch.env.clone();
        job.completion_index_env = Some(Config::TASK_ID_ENV.to_string());
        job.cpu_request = self.launch.cpu_request.clone();
        job.memory_request = self.launch.memory_request.clone();
        job.parallelism = parallelism as u32;
        job.completions = replicas as u32;
        job.backoff_limit = self.launch.backoff_limit;
        job.volume = self.launch.volume.clone();
        job
    }

    async fn wait_for_dependency(&mut self) -> Result<(), ExecutorError> {
        let Some(dependency) = self.depends.as_mut() else {
            return Ok(());
        };

        match dependency {
            Dependency::Job(job_id) => {
                tracing::info!(dependency = %job_id, "dependency supplied as job id, treating as satisfied");
                Ok(())
            }
            Dependency::Pipeline(upstream) => {
                let outcome = Box::pin(upstream.launch()).await?;
                if outcome == LaunchOutcome::AlreadyComplete {
                    return Ok(());
                }
                upstream.wait_until_complete().await
            }
        }
    }

    /// Poll completion markers until every rank has one. A failed or vanished job aborts the
    /// wait. A job reporting success while markers are still missing gets
    /// [`Config::DEPENDENCY_SETTLE_POLLS`] more polls for the shared volume to catch up.
    async fn wait_until_complete(&self) -> Result<(), ExecutorError> {
        let scheduler = self
            .scheduler
            .clone()
            .ok_or(ExecutorError::NotConfigured("scheduler"))?;
        let job_id = self.job_id.clone().unwrap_or_default();
        let logging = self.logging();
        let mut settle_polls = 0;

        loop {
            // Markers only: skip_completed decides what to rerun, not what counts as done.
            let pending = logging.incomplete_ranks(self.descriptor.tasks, true);
            if pending.is_empty() {
                tracing::info!(job = %job_id, "dependency complete");
                return Ok(());
            }

            match scheduler.status(&job_id).await? {
                JobStatus::Succeeded if settle_polls >= Config::DEPENDENCY_SETTLE_POLLS => {
                    return Err(ExecutorError::DependencyIncomplete {
                        job: job_id,
                        pending,
                    });
                }
                JobStatus::Succeeded => {
                    settle_polls += 1;
                    tracing::warn!(
                        job = %job_id,
                        pending = pending.len(),
                        "dependency job succeeded but completion markers are missing"
                    );
                }
                status @ (JobStatus::Failed | JobStatus::NotFound) => {
                    return Err(ExecutorError::DependencyFailed {
                        job: job_id,
                        status,
                    });
                }
                JobStatus::Pending | JobStatus::Running { .. } => {
                    tracing::info!(job = %job_id, pending = pending.len(), "waiting for dependency");
                }
            }

            tokio::time::sleep(self.launch.dependency_poll).await;
        }
    }

    /// Replica mode: run ranks `manifest[index * rpr .. (index + 1) * rpr]` in order.
    #[tracing::instrument(skip(self), fields(job = %self.descriptor.job_name))]
    pub async fn run_replica(
        &self,
        completion_index: usize,
    ) -> Result<ReplicaReport, ExecutorError> {
        if self.handle_signals {
            shutdown::install_termination_handlers();
        }

        let pipeline = self
            .pipeline
            .clone()
            .ok_or(ExecutorError::NotConfigured("pipeline"))?;
        let logging = self.logging();
        let manifest = logging.read_manifest()?;
        let positions = replica_positions(
            completion_index,
            self.descriptor.ranks_per_replica,
            manifest.len(),
        );

        let mut report = ReplicaReport {
            completion_index,
            ..ReplicaReport::default()
        };
        if positions.is_empty() {
            tracing::info!(manifest = manifest.len(), "no ranks left for this replica");
            return Ok(report);
        }

        let mut failed = Vec::new();
        for &rank in &manifest[positions] {
            if self.descriptor.skip_completed && logging.is_complete(rank) {
                tracing::info!(rank, "rank already complete, skipping");
                report.skipped.push(rank);
                continue;
            }

            tracing::info!(rank, stage = pipeline.name(), "running rank");
            match pipeline.run_rank(rank, self.descriptor.tasks).await {
                Ok(()) => {
                    logging.mark_complete(rank)?;
                    report.completed.push(rank);
                }
                Err(e) => {
                    tracing::error!(rank, error = %e, "rank failed");
                    failed.push(rank);
                }
            }
        }

        if !failed.is_empty() {
            return Err(ExecutorError::RanksFailed(failed));
        }
        Ok(report)
    }
}

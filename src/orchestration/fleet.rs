//! Fleet job monitor: one job per (index, worker), polled until every job succeeds or is
//! abandoned after repeated failures.

use crate::config::Config;
use crate::orchestration::scheduler::{
    JobDescriptor, JobStatus, Scheduler, SchedulerError, VolumeMount, sanitize_job_name,
};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("no indexes to crawl")]
    NoIndexes,

    #[error("workers per index must be at least 1")]
    NoWorkers,

    #[error("persistent volume claim {0} does not exist")]
    MissingVolume(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// How a failed job is recreated after deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecreateNaming {
    /// Wait until the old job is gone, then recreate under the same name.
    ReuseName,
    /// Recreate as `{name}-r{attempt}` without waiting for the deletion to finish.
    #[default]
    FreshSuffix,
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub pattern: String,
    pub indexes: Vec<String>,
    pub workers_per_index: usize,
    pub image: String,
    pub command: Vec<String>,
    pub cpu_request: String,
    pub memory_request: String,
    pub data_claim: String,
    pub mount_path: String,
    pub max_failures: u32,
    pub poll_interval: Duration,
    pub restart_cooldown: Duration,
    /// Upper bound of the random delay before each submission.
    pub stagger_max: Duration,
    pub recreate_naming: RecreateNaming,
}

impl FleetConfig {
    pub fn new(pattern: &str, indexes: Vec<String>, workers_per_index: usize) -> Self {
        Self {
            pattern: pattern.to_string(),
            indexes,
            workers_per_index,
            image: Config::IMAGE.to_string(),
            command: vec!["crawl-fleet".to_string()],
            cpu_request: Config::CPU_REQUEST.to_string(),
            memory_request: Config::MEMORY_REQUEST.to_string(),
            data_claim: Config::FLEET_DATA_CLAIM.to_string(),
            mount_path: Config::FLEET_DATA_MOUNT.to_string(),
            max_failures: Config::FLEET_MAX_FAILURES,
            poll_interval: Duration::from_secs(Config::FLEET_POLL_SECS),
            restart_cooldown: Duration::from_secs(Config::FLEET_RESTART_COOLDOWN_SECS),
            stagger_max: Duration::from_millis(Config::FLEET_STAGGER_MAX_MS),
            recreate_naming: RecreateNaming::default(),
        }
    }

    /// No sleeps anywhere; for tests and dry runs.
    pub fn without_delays(mut self) -> Self {
        self.poll_interval = Duration::ZERO;
        self.restart_cooldown = Duration::ZERO;
        self.stagger_max = Duration::ZERO;
        self
    }
}

/// Final state of every job the monitor created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FleetReport {
    pub submitted: usize,
    pub succeeded: Vec<String>,
    pub abandoned: Vec<String>,
    pub restarts: u32,
    /// Failure count of each finished job at the moment it left the active set.
    pub failures: BTreeMap<String, u32>,
}

/// A job under watch. `key` is the original name; `current` is the name of the live job.
#[derive(Debug, Clone)]
struct FleetJob {
    key: String,
    descriptor: JobDescriptor,
    current: String,
    failures: u32,
    attempts: u32,
    /// Consecutive status polls that returned an error.
    poll_errors: u32,
}

pub struct FleetMonitor {
    scheduler: Arc<dyn Scheduler>,
    config: FleetConfig,
}

impl FleetMonitor {
    pub fn new(scheduler: Arc<dyn Scheduler>, config: FleetConfig) -> Self {
        Self { scheduler, config }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// One worker job per `(index, worker_id)`, each writing its own file under the mount.
    pub fn plan_jobs(&self) -> Result<Vec<JobDescriptor>, FleetError> {
        if self.config.indexes.is_empty() {
            return Err(FleetError::NoIndexes);
        }
        if self.config.workers_per_index == 0 {
            return Err(FleetError::NoWorkers);
        }

        let total = self.config.workers_per_index;
        let mut jobs = Vec::with_capacity(self.config.indexes.len() * total);
        for index in &self.config.indexes {
            for worker_id in 0..total {
                let mut job = JobDescriptor::new(
                    &format!("crawler-{}-w{}", index, worker_id),
                    &self.config.image,
                );
                job.command = self.config.command.clone();
                job.args = vec![
                    "worker".to_string(),
                    "--index".to_string(),
                    index.clone(),
                    "--pattern".to_string(),
                    self.config.pattern.clone(),
                    "--worker-id".to_string(),
                    worker_id.to_string(),
                    "--total-workers".to_string(),
                    total.to_string(),
                    "--output-dir".to_string(),
                    self.config.mount_path.clone(),
                ];
                job.cpu_request = self.config.cpu_request.clone();
                job.memory_request = self.config.memory_request.clone();
                job.volume = Some(VolumeMount {
                    claim_name: self.config.data_claim.clone(),
                    mount_path: self.config.mount_path.clone(),
                });
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Check preconditions, submit every job, then monitor until none is active.
    #[tracing::instrument(skip(self), fields(pattern = %self.config.pattern))]
    pub async fn run(&self) -> Result<FleetReport, FleetError> {
        let jobs = self.plan_jobs()?;

        if !self.scheduler.claim_exists(&self.config.data_claim).await? {
            return Err(FleetError::MissingVolume(self.config.data_claim.clone()));
        }

        let mut report = FleetReport::default();
        let mut active = Vec::with_capacity(jobs.len());
        for descriptor in jobs {
            self.stagger().await;
            match self.scheduler.submit(&descriptor).await {
                Ok(current) => {
                    tracing::info!(job = %current, "submitted");
                    report.submitted += 1;
                    active.push(FleetJob {
                        key: descriptor.name.clone(),
                        descriptor,
                        current,
                        failures: 0,
                        attempts: 0,
                        poll_errors: 0,
                    });
                }
                Err(e) => {
                    tracing::error!(job = %descriptor.name, error = %e, "submission failed, abandoning job");
                    report.abandoned.push(descriptor.name);
                }
            }
        }

        self.monitor(active, &mut report).await;
        tracing::info!(
            succeeded = report.succeeded.len(),
            abandoned = report.abandoned.len(),
            restarts = report.restarts,
            "fleet finished"
        );
        Ok(report)
    }

    async fn monitor(&self, mut active: Vec<FleetJob>, report: &mut FleetReport) {
        while !active.is_empty() {
            tokio::time::sleep(self.config.poll_interval).await;

            let mut still_active = Vec::with_capacity(active.len());
            for mut job in active.drain(..) {
                let status = match self.scheduler.status(&job.current).await {
                    Ok(status) => {
                        job.poll_errors = 0;
                        status
                    }
                    Err(e) => {
                        job.poll_errors += 1;
                        if job.poll_errors >= self.config.max_failures {
                            tracing::error!(
                                job = %job.current,
                                error = %e,
                                polls = job.poll_errors,
                                "status unreadable, abandoning"
                            );
                            report.failures.insert(job.key.clone(), job.failures);
                            report.abandoned.push(job.key);
                        } else {
                            tracing::warn!(job = %job.current, error = %e, "status poll failed");
                            still_active.push(job);
                        }
                        continue;
                    }
                };

                match status {
                    JobStatus::Succeeded => {
                        tracing::info!(job = %job.current, failures = job.failures, "job succeeded");
                        report.failures.insert(job.key.clone(), job.failures);
                        report.succeeded.push(job.key);
                    }
                    JobStatus::Failed | JobStatus::NotFound => {
                        job.failures += 1;
                        if job.failures >= self.config.max_failures {
                            tracing::error!(
                                job = %job.current,
                                failures = job.failures,
                                "job failed permanently, abandoning"
                            );
                            report.failures.insert(job.key.clone(), job.failures);
                            report.abandoned.push(job.key);
                            continue;
                        }

                        tracing::warn!(
                            job = %job.current,
                            failures = job.failures,
                            max = self.config.max_failures,
                            "job failed, restarting"
                        );
                        match self.recreate(&mut job).await {
                            Ok(()) => {
                                report.restarts += 1;
                                still_active.push(job);
                            }
                            Err(e) => {
                                tracing::error!(job = %job.key, error = %e, "recreate failed, abandoning");
                                report.failures.insert(job.key.clone(), job.failures);
                                report.abandoned.push(job.key);
                            }
                        }
                    }
                    JobStatus::Pending | JobStatus::Running { .. } => still_active.push(job),
                }
            }
            active = still_active;
        }
    }

    /// Delete the failed job, cool down, and submit the original descriptor again.
    async fn recreate(&self, job: &mut FleetJob) -> Result<(), SchedulerError> {
        if let Err(e) = self.scheduler.delete(&job.current).await {
            tracing::warn!(job = %job.current, error = %e, "delete failed");
        }
        tokio::time::sleep(self.config.restart_cooldown).await;

        job.attempts += 1;
        let descriptor = match self.config.recreate_naming {
            RecreateNaming::ReuseName => {
                self.wait_until_gone(&job.current).await?;
                job.descriptor.clone()
            }
            RecreateNaming::FreshSuffix => job
                .descriptor
                .renamed(&suffixed_name(&job.key, job.attempts)),
        };

        job.current = self.scheduler.submit(&descriptor).await?;
        Ok(())
    }

    async fn wait_until_gone(&self, name: &str) -> Result<(), SchedulerError> {
        while self.scheduler.status(name).await? != JobStatus::NotFound {
            tracing::debug!(job = %name, "waiting for deletion");
            tokio::time::sleep(self.config.poll_interval.max(Duration::from_millis(10))).await;
        }
        Ok(())
    }

    async fn stagger(&self) {
        let max_ms = self.config.stagger_max.as_millis() as u64;
        if max_ms > 0 {
            let delay = rand::thread_rng().gen_range(0..=max_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
}

/// `{key}-r{attempt}`, shortening `key` so the result stays a valid job name.
fn suffixed_name(key: &str, attempt: u32) -> String {
    let suffix = format!("-r{}", attempt);
    let keep = 63usize.saturating_sub(suffix.len()).min(key.len());
    let base = key[..keep].trim_end_matches('-');
    sanitize_job_name(&format!("{}{}", base, suffix))
}

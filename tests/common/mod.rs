//! Shared test doubles for the orchestration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use crawl_fleet::orchestration::manifest::LoggingDir;
use crawl_fleet::orchestration::scheduler::{JobDescriptor, JobStatus, Scheduler, SchedulerError};
use crawl_fleet::orchestration::stages::{RankPipeline, StageError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// In-memory scheduler. Each job name replays its scripted statuses in order, repeating the
/// last one; unscripted jobs report `Succeeded`. Deleted jobs report `NotFound` until resubmitted.
/// Jobs registered with `completing` write their ranks' completion markers whenever they report
/// `Succeeded`, the way finished replicas would.
#[derive(Default)]
pub struct ScriptedScheduler {
    claims: HashSet<String>,
    scripts: Mutex<HashMap<String, VecDeque<JobStatus>>>,
    submitted: Mutex<Vec<JobDescriptor>>,
    deleted: Mutex<Vec<String>>,
    gone: Mutex<HashSet<String>>,
    completing: HashMap<String, (LoggingDir, usize)>,
    unreachable: HashSet<String>,
    reject_submissions: bool,
}

impl ScriptedScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_claim(mut self, claim: &str) -> Self {
        self.claims.insert(claim.to_string());
        self
    }

    pub fn rejecting_submissions(mut self) -> Self {
        self.reject_submissions = true;
        self
    }

    /// Status polls for `job_name` always fail.
    pub fn unreachable(mut self, job_name: &str) -> Self {
        self.unreachable.insert(job_name.to_string());
        self
    }

    pub fn completing(mut self, job_name: &str, logging: LoggingDir, tasks: usize) -> Self {
        self.completing
            .insert(job_name.to_string(), (logging, tasks));
        self
    }

    pub fn script(self, job_name: &str, statuses: &[JobStatus]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(job_name.to_string(), statuses.iter().copied().collect());
        self
    }

    pub fn submitted(&self) -> Vec<JobDescriptor> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn submitted_names(&self) -> Vec<String> {
        self.submitted().into_iter().map(|job| job.name).collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Scheduler for ScriptedScheduler {
    async fn submit(&self, job: &JobDescriptor) -> Result<String, SchedulerError> {
        if self.reject_submissions {
            return Err(SchedulerError::Api {
                action: "job creation",
                status: 403,
                body: "forbidden".to_string(),
            });
        }
        self.gone.lock().unwrap().remove(&job.name);
        self.submitted.lock().unwrap().push(job.clone());
        Ok(job.name.clone())
    }

    async fn status(&self, job_id: &str) -> Result<JobStatus, SchedulerError> {
        if self.unreachable.contains(job_id) {
            return Err(SchedulerError::Api {
                action: "job status",
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        if self.gone.lock().unwrap().contains(job_id) {
            return Ok(JobStatus::NotFound);
        }
        let status = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(job_id) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().copied(),
                None => None,
            }
        }
        .unwrap_or(JobStatus::Succeeded);

        if status == JobStatus::Succeeded {
            if let Some((logging, tasks)) = self.completing.get(job_id) {
                for rank in 0..*tasks {
                    logging.mark_complete(rank).unwrap();
                }
            }
        }
        Ok(status)
    }

    async fn delete(&self, job_id: &str) -> Result<(), SchedulerError> {
        self.deleted.lock().unwrap().push(job_id.to_string());
        self.gone.lock().unwrap().insert(job_id.to_string());
        Ok(())
    }

    async fn claim_exists(&self, claim_name: &str) -> Result<bool, SchedulerError> {
        Ok(self.claims.contains(claim_name))
    }
}

/// Records every rank it is asked to run; ranks in `fail_on` return an error.
#[derive(Default)]
pub struct RecordingPipeline {
    runs: Mutex<Vec<usize>>,
    fail_on: HashSet<usize>,
}

impl RecordingPipeline {
    pub fn failing_on(ranks: &[usize]) -> Self {
        Self {
            runs: Mutex::new(Vec::new()),
            fail_on: ranks.iter().copied().collect(),
        }
    }

    pub fn runs(&self) -> Vec<usize> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait]
impl RankPipeline for RecordingPipeline {
    fn name(&self) -> &str {
        "recording"
    }

    async fn run_rank(&self, rank: usize, _world_size: usize) -> Result<(), StageError> {
        self.runs.lock().unwrap().push(rank);
        if self.fail_on.contains(&rank) {
            return Err(StageError::Invalid(format!("rank {} failed", rank)));
        }
        Ok(())
    }
}

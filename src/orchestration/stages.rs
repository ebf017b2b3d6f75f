//! Stage identifiers carried by the task descriptor and the per-rank pipelines they build.

use crate::fetch_worker::{FetchWorker, WorkerError};
use crate::ledger::LedgerError;
use crate::merge::merge_outputs;
use crate::network::HttpClient;
use crate::partition::{PartitionAssignment, PartitionError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Output(#[from] LedgerError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error("invalid stage: {0}")]
    Invalid(String),
}

/// The work a pipeline performs for each rank. Serialized into the task descriptor as
/// `{"kind": "...", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageSpec {
    /// Rank `r` of `T` crawls records `i` with `i mod T == r` from one index.
    CommonCrawl {
        index: String,
        pattern: String,
        index_server: String,
        archive_base: String,
        output_dir: PathBuf,
    },
    /// Single-rank merge of every output file in `input_dir`.
    Merge { input_dir: PathBuf, output: PathBuf },
}

impl StageSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            StageSpec::CommonCrawl { .. } => "common_crawl",
            StageSpec::Merge { .. } => "merge",
        }
    }

    /// Reject combinations that cannot run, such as a merge split over several ranks.
    pub fn validate(&self, tasks: usize) -> Result<(), StageError> {
        if tasks == 0 {
            return Err(StageError::Invalid("tasks must be at least 1".to_string()));
        }
        match self {
            StageSpec::Merge { .. } if tasks != 1 => Err(StageError::Invalid(format!(
                "merge runs as a single rank, got {} tasks",
                tasks
            ))),
            StageSpec::CommonCrawl { index, pattern, .. }
                if index.is_empty() || pattern.is_empty() =>
            {
                Err(StageError::Invalid(
                    "common_crawl needs an index and a pattern".to_string(),
                ))
            }
            _ => Ok(()),
        }
    }

    pub fn build(&self, http: HttpClient) -> Box<dyn RankPipeline> {
        match self {
            StageSpec::CommonCrawl {
                index,
                pattern,
                index_server,
                archive_base,
                output_dir,
            } => Box::new(CommonCrawlStage {
                worker: FetchWorker::new(http, index_server, archive_base),
                index: index.clone(),
                pattern: pattern.clone(),
                output_dir: output_dir.clone(),
            }),
            StageSpec::Merge { input_dir, output } => Box::new(MergeStage {
                input_dir: input_dir.clone(),
                output: output.clone(),
            }),
        }
    }
}

/// The downstream work executed once per rank inside a replica.
#[async_trait]
pub trait RankPipeline: Send + Sync {
    fn name(&self) -> &str;

    async fn run_rank(&self, rank: usize, world_size: usize) -> Result<(), StageError>;
}

/// `{output_dir}/{index}-{rank:05}.jsonl`. Crawls of different indexes can share `output_dir`.
pub fn rank_output_path(output_dir: &Path, index: &str, rank: usize) -> PathBuf {
    let index = index.replace(['/', '\\'], "-");
    output_dir.join(format!("{}-{:05}.jsonl", index, rank))
}

pub struct CommonCrawlStage {
    worker: FetchWorker,
    index: String,
    pattern: String,
    output_dir: PathBuf,
}

impl CommonCrawlStage {
    pub fn new(worker: FetchWorker, index: &str, pattern: &str, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker,
            index: index.to_string(),
            pattern: pattern.to_string(),
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl RankPipeline for CommonCrawlStage {
    fn name(&self) -> &str {
        "common_crawl"
    }

    async fn run_rank(&self, rank: usize, world_size: usize) -> Result<(), StageError> {
        let assignment = PartitionAssignment::new(rank, world_size)?;
        let output = rank_output_path(&self.output_dir, &self.index, rank);
        let report = self
            .worker
            .process_index(&self.index, &self.pattern, assignment, &output)
            .await?;
        tracing::info!(rank, index = %self.index, %report, "rank finished");
        Ok(())
    }
}

pub struct MergeStage {
    input_dir: PathBuf,
    output: PathBuf,
}

#[async_trait]
impl RankPipeline for MergeStage {
    fn name(&self) -> &str {
        "merge"
    }

    async fn run_rank(&self, _rank: usize, _world_size: usize) -> Result<(), StageError> {
        merge_outputs(&self.input_dir, &self.output)?;
        Ok(())
    }
}

use crate::config::Config;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Exit codes: 0=success, 2=invalid arguments, 3=I/O or config error, 4=network or cluster error,
/// 5=partial failure (some indexes or ranks failed)
#[derive(Parser, Debug)]
#[command(name = "crawl-fleet")]
#[command(about = "Distributed Common Crawl fetch pipeline for a Kubernetes cluster")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, default_value = "./logs", env = "CRAWL_FLEET_LOG_DIR")]
    pub log_dir: PathBuf,

    #[arg(long, global = true, default_value = Config::USER_AGENT)]
    pub user_agent: String,

    #[arg(long, global = true, default_value_t = Config::REQUEST_TIMEOUT_SECS, help = "HTTP request timeout in seconds")]
    pub timeout: u64,
}

/// Where and how to reach the cluster API.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    #[arg(
        long,
        env = "CRAWL_FLEET_API_SERVER",
        help = "Kubernetes API base URL (e.g. http://127.0.0.1:8001 for kubectl proxy); in-cluster service account when omitted"
    )]
    pub api_server: Option<String>,

    #[arg(long, env = "CRAWL_FLEET_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    #[arg(long, env = "CRAWL_FLEET_NAMESPACE", default_value = Config::NAMESPACE)]
    pub namespace: String,

    #[arg(long, env = "CRAWL_FLEET_IMAGE", default_value = Config::IMAGE)]
    pub image: String,

    #[arg(long, default_value = Config::CPU_REQUEST)]
    pub cpu: String,

    #[arg(long, default_value = Config::MEMORY_REQUEST)]
    pub memory: String,
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    #[arg(long, default_value = Config::INDEX_SERVER, env = "CRAWL_FLEET_INDEX_SERVER")]
    pub index_server: String,

    #[arg(long, default_value = Config::ARCHIVE_BASE, env = "CRAWL_FLEET_ARCHIVE_BASE")]
    pub archive_base: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a resumable crawl of one index as an indexed cluster job.
    Launch {
        #[arg(long, help = "Job name (sanitised to a valid cluster name)")]
        job_name: String,

        #[arg(long, default_value = Config::DEFAULT_INDEX)]
        index: String,

        #[arg(long, help = "URL pattern, e.g. '*.ar'")]
        pattern: String,

        #[arg(long, default_value_t = 1, help = "Number of ranks (world size)")]
        tasks: usize,

        #[arg(long, default_value_t = 1)]
        ranks_per_replica: usize,

        #[arg(long, help = "Maximum replicas running at once")]
        workers: Option<usize>,

        #[arg(long, help = "Shared directory for the manifest, descriptor and completion markers")]
        logging_dir: PathBuf,

        #[arg(long, help = "Directory for per-rank output files")]
        output_dir: PathBuf,

        #[arg(long, help = "Chain a merge job writing every unique record to this file")]
        merge_output: Option<PathBuf>,

        #[arg(long, help = "Treat this already-submitted job as the dependency")]
        depends_job_id: Option<String>,

        #[arg(long, help = "Re-run ranks that already have a completion marker")]
        no_skip_completed: bool,

        #[arg(long, help = "Persistent volume claim to mount into every replica")]
        claim: Option<String>,

        #[arg(long, default_value = Config::FLEET_DATA_MOUNT)]
        mount_path: String,

        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Run a persisted task descriptor: as a replica when CRAWL_FLEET_TASK_ID is set, otherwise
    /// as its controller.
    Pipeline {
        #[arg(long)]
        descriptor: PathBuf,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Fetch the records of one or more indexes owned by this worker.
    Worker {
        #[arg(long = "index", required = true, num_args = 1..)]
        indexes: Vec<String>,

        #[arg(long)]
        pattern: String,

        #[arg(long, default_value_t = 0)]
        worker_id: usize,

        #[arg(long, default_value_t = 1)]
        total_workers: usize,

        #[arg(long, default_value = Config::FLEET_DATA_MOUNT)]
        output_dir: PathBuf,

        #[command(flatten)]
        source: SourceArgs,
    },

    /// Create one worker job per (index, worker) and restart failed ones until all finish.
    Fleet {
        #[arg(long)]
        pattern: String,

        #[arg(long = "index", help = "Indexes to crawl; all published indexes when omitted")]
        indexes: Vec<String>,

        #[arg(long, default_value_t = 1)]
        workers: usize,

        #[arg(long, default_value = Config::FLEET_DATA_CLAIM)]
        claim: String,

        #[arg(long, default_value = Config::FLEET_DATA_MOUNT)]
        mount_path: String,

        #[arg(long, default_value_t = Config::FLEET_MAX_FAILURES)]
        max_failures: u32,

        #[arg(long, default_value_t = Config::FLEET_POLL_SECS)]
        poll_secs: u64,

        #[arg(long, default_value_t = Config::FLEET_RESTART_COOLDOWN_SECS)]
        cooldown_secs: u64,

        #[arg(long, help = "Recreate failed jobs under their original name")]
        reuse_names: bool,

        #[arg(long, default_value = Config::INDEX_SERVER, env = "CRAWL_FLEET_INDEX_SERVER")]
        index_server: String,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Merge every *.jsonl file in a directory into one file with unique URLs.
    Merge {
        #[arg(long, default_value = Config::FLEET_DATA_MOUNT)]
        input_dir: PathBuf,

        #[arg(long)]
        output: PathBuf,
    },

    /// List the indexes published by the index server.
    Indexes {
        #[arg(long, default_value = Config::INDEX_SERVER, env = "CRAWL_FLEET_INDEX_SERVER")]
        index_server: String,
    },
}

impl Cli {
    /// On error, clap prints help and exits with code 2 (usage error).
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

//! Cluster-facing orchestration: pipeline jobs, fleet monitoring and replica lifecycle.

pub mod executor;
pub mod fleet;
pub mod manifest;
pub mod scheduler;
pub mod shutdown;
pub mod stages;

pub use executor::{LaunchOutcome, LaunchSettings, PipelineExecutor, RunMode, RunOutcome};
pub use fleet::{FleetConfig, FleetMonitor, FleetReport, RecreateNaming};
pub use manifest::{LoggingDir, TaskDescriptor};
pub use scheduler::{JobDescriptor, JobStatus, KubeScheduler, Scheduler};
pub use shutdown::install_termination_handlers;
pub use stages::{RankPipeline, StageSpec};

//! On-disk job state shared by the controller and its replicas: the rank manifest, per-rank
//! completion markers and the task descriptor, all under one logging directory.

use crate::orchestration::scheduler::VolumeMount;
use crate::orchestration::stages::StageSpec;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "ranks_to_run.json";
pub const DESCRIPTOR_FILE: &str = "task.json";
pub const COMPLETIONS_DIR: &str = "completions";

/// Task descriptor format understood by this build.
pub const DESCRIPTOR_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} does not exist")]
    Missing(PathBuf),

    #[error("malformed {path}: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported task descriptor version {found} (expected {expected})")]
    UnsupportedVersion { found: u32, expected: u32 },
}

impl ManifestError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        ManifestError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything a replica needs to run its share of a pipeline. Written by the controller next to
/// the manifest and passed to the replica command by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub version: u32,
    pub job_name: String,
    /// World size: ranks are `0..tasks`.
    pub tasks: usize,
    pub ranks_per_replica: usize,
    pub logging_dir: PathBuf,
    pub skip_completed: bool,
    pub stage: StageSpec,
    /// Cluster resources of the last submission. Absent until a controller has launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<JobResources>,
}

/// How the controller sized and placed the job, so a controller re-run from the descriptor
/// submits the same job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResources {
    pub image: String,
    pub cpu_request: String,
    pub memory_request: String,
    pub workers: Option<usize>,
    pub backoff_limit: u32,
    pub volume: Option<VolumeMount>,
}

impl TaskDescriptor {
    pub fn new(job_name: &str, tasks: usize, logging_dir: impl Into<PathBuf>, stage: StageSpec) -> Self {
        Self {
            version: DESCRIPTOR_VERSION,
            job_name: job_name.to_string(),
            tasks,
            ranks_per_replica: 1,
            logging_dir: logging_dir.into(),
            skip_completed: true,
            stage,
            resources: None,
        }
    }

    pub fn with_ranks_per_replica(mut self, ranks_per_replica: usize) -> Self {
        self.ranks_per_replica = ranks_per_replica.max(1);
        self
    }

    pub fn with_skip_completed(mut self, skip_completed: bool) -> Self {
        self.skip_completed = skip_completed;
        self
    }

    pub fn logging(&self) -> LoggingDir {
        LoggingDir::new(&self.logging_dir)
    }

    /// Load and reject any version other than [`DESCRIPTOR_VERSION`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let descriptor: TaskDescriptor = read_json(path)?;
        if descriptor.version != DESCRIPTOR_VERSION {
            return Err(ManifestError::UnsupportedVersion {
                found: descriptor.version,
                expected: DESCRIPTOR_VERSION,
            });
        }
        Ok(descriptor)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ManifestError> {
        write_json(path.as_ref(), self)
    }
}

/// The job's logging directory and the files it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingDir {
    root: PathBuf,
}

impl LoggingDir {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.root.join(DESCRIPTOR_FILE)
    }

    pub fn completion_marker(&self, rank: usize) -> PathBuf {
        self.root.join(COMPLETIONS_DIR).join(format!("{:05}", rank))
    }

    pub fn is_complete(&self, rank: usize) -> bool {
        self.completion_marker(rank).exists()
    }

    /// Record that `rank` finished. Only called after the rank's pipeline returned successfully.
    pub fn mark_complete(&self, rank: usize) -> Result<(), ManifestError> {
        let marker = self.completion_marker(rank);
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
        }
        std::fs::write(&marker, b"").map_err(|e| ManifestError::io(&marker, e))
    }

    /// Forget that `rank` finished, so it counts as pending until a replica marks it again.
    pub fn clear_complete(&self, rank: usize) -> Result<(), ManifestError> {
        let marker = self.completion_marker(rank);
        match std::fs::remove_file(&marker) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ManifestError::io(&marker, e)),
        }
    }

    /// Ranks in `0..tasks` without a completion marker, ascending. With `skip_completed` off,
    /// every rank is incomplete.
    pub fn incomplete_ranks(&self, tasks: usize, skip_completed: bool) -> Vec<usize> {
        (0..tasks)
            .filter(|&rank| !skip_completed || !self.is_complete(rank))
            .collect()
    }

    pub fn write_manifest(&self, ranks: &[usize]) -> Result<(), ManifestError> {
        write_json(&self.manifest_path(), &ranks)
    }

    /// A missing manifest is reported as [`ManifestError::Missing`].
    pub fn read_manifest(&self) -> Result<Vec<usize>, ManifestError> {
        read_json(&self.manifest_path())
    }
}

/// Manifest positions owned by replica `completion_index`, clipped to the manifest. Empty when the
/// replica starts past the end.
pub fn replica_positions(
    completion_index: usize,
    ranks_per_replica: usize,
    manifest_len: usize,
) -> Range<usize> {
    let per_replica = ranks_per_replica.max(1);
    let start = completion_index.saturating_mul(per_replica).min(manifest_len);
    let end = completion_index
        .saturating_add(1)
        .saturating_mul(per_replica)
        .min(manifest_len);
    start..end
}

/// `ceil(pending / ranks_per_replica)`.
pub fn replica_count(pending: usize, ranks_per_replica: usize) -> usize {
    pending.div_ceil(ranks_per_replica.max(1))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ManifestError::Missing(path.to_path_buf()));
        }
        Err(e) => return Err(ManifestError::io(path, e)),
    };
    serde_json::from_slice(&bytes).map_err(|source| ManifestError::Malformed {
        path: path.to_path_buf(),
        source,
    })
}

/// Write through a temporary sibling and rename, so readers never see a partial file.
fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), ManifestError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| ManifestError::io(parent, e))?;
    }
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| ManifestError::Malformed {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).map_err(|e| ManifestError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ManifestError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_incomplete_ranks_follow_markers() {
        let dir = TempDir::new().unwrap();
        let logging = LoggingDir::new(dir.path());

        assert_eq!(logging.incomplete_ranks(4, true), vec![0, 1, 2, 3]);
        logging.mark_complete(1).unwrap();
        logging.mark_complete(3).unwrap();
        assert_eq!(logging.incomplete_ranks(4, true), vec![0, 2]);
        assert_eq!(logging.incomplete_ranks(4, false), vec![0, 1, 2, 3]);
        assert!(logging.completion_marker(3).ends_with("completions/00003"));
    }

    #[test]
    fn test_clear_complete() {
        let dir = TempDir::new().unwrap();
        let logging = LoggingDir::new(dir.path());

        logging.mark_complete(2).unwrap();
        logging.clear_complete(2).unwrap();
        assert!(!logging.is_complete(2));
        // Clearing a rank that never finished is fine.
        logging.clear_complete(0).unwrap();
    }

    #[test]
    fn test_manifest_roundtrip_and_missing() {
        let dir = TempDir::new().unwrap();
        let logging = LoggingDir::new(dir.path().join("logs"));

        assert!(matches!(logging.read_manifest(), Err(ManifestError::Missing(_))));
        logging.write_manifest(&[3, 4, 5]).unwrap();
        assert_eq!(logging.read_manifest().unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn test_replica_positions() {
        assert_eq!(replica_positions(0, 2, 5), 0..2);
        assert_eq!(replica_positions(2, 2, 5), 4..5);
        assert!(replica_positions(3, 2, 5).is_empty());
        assert!(replica_positions(7, 1, 3).is_empty());
    }

    #[test]
    fn test_replica_count() {
        assert_eq!(replica_count(5, 2), 3);
        assert_eq!(replica_count(4, 2), 2);
        assert_eq!(replica_count(0, 3), 0);
        assert_eq!(replica_count(3, 0), 3);
    }

    #[test]
    fn test_descriptor_version_is_checked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(DESCRIPTOR_FILE);
        let stage = StageSpec::Merge {
            input_dir: dir.path().join("data"),
            output: dir.path().join("merged.jsonl"),
        };
        let mut descriptor = TaskDescriptor::new("merge", 1, dir.path(), stage);
        descriptor.save(&path).unwrap();
        assert_eq!(TaskDescriptor::load(&path).unwrap(), descriptor);

        descriptor.version = 99;
        descriptor.save(&path).unwrap();
        assert!(matches!(
            TaskDescriptor::load(&path),
            Err(ManifestError::UnsupportedVersion { found: 99, .. })
        ));
    }
}

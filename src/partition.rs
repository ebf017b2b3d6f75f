//! Deterministic modulo assignment of discovered records to worker replicas.

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("total_workers must be at least 1")]
    NoWorkers,
    #[error("worker_id {worker_id} out of range for {total_workers} workers")]
    WorkerOutOfRange { worker_id: usize, total_workers: usize },
}

/// `(worker_id, total_workers)`: record `i` belongs to worker `i mod total_workers`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionAssignment {
    worker_id: usize,
    total_workers: usize,
}

impl PartitionAssignment {
    pub fn new(worker_id: usize, total_workers: usize) -> Result<Self, PartitionError> {
        if total_workers == 0 {
            return Err(PartitionError::NoWorkers);
        }
        if worker_id >= total_workers {
            return Err(PartitionError::WorkerOutOfRange {
                worker_id,
                total_workers,
            });
        }
        Ok(Self {
            worker_id,
            total_workers,
        })
    }

    /// The whole record list owned by a single worker.
    pub fn single() -> Self {
        Self {
            worker_id: 0,
            total_workers: 1,
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    pub fn owns(&self, position: usize) -> bool {
        position % self.total_workers == self.worker_id
    }

    /// The records this worker claims, in their original order.
    pub fn claim<'a, T>(&self, records: &'a [T]) -> impl Iterator<Item = &'a T> + 'a {
        let assignment = *self;
        records
            .iter()
            .enumerate()
            .filter(move |(position, _)| assignment.owns(*position))
            .map(|(_, record)| record)
    }
}

impl fmt::Display for PartitionAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worker_id, self.total_workers)
    }
}

//! The crawl-fetch chain run by one worker: locate, claim, skip seen, fetch, clean, append.

use crate::backoff::RetryPolicy;
use crate::cleaner::ContentCleaner;
use crate::index_locator::{IndexLocator, IndexRecord, LocatorError};
use crate::ledger::{DedupOutput, LedgerError};
use crate::network::HttpClient;
use crate::partition::PartitionAssignment;
use crate::range_fetcher::{RangeError, RangeFetcher};
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("index lookup failed for {index}: {source}")]
    Locator {
        index: String,
        #[source]
        source: LocatorError,
    },

    #[error("output error: {0}")]
    Output(#[from] LedgerError),
}

/// Counts reported by a worker after one index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub discovered: usize,
    pub claimed: usize,
    pub skipped_seen: usize,
    pub written: usize,
    pub no_content: usize,
    pub errors: usize,
}

impl WorkerReport {
    pub fn merge(&mut self, other: &WorkerReport) {
        self.discovered += other.discovered;
        self.claimed += other.claimed;
        self.skipped_seen += other.skipped_seen;
        self.written += other.written;
        self.no_content += other.no_content;
        self.errors += other.errors;
    }
}

impl fmt::Display for WorkerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "discovered {}, claimed {}, already seen {}, written {}, no content {}, errors {}",
            self.discovered, self.claimed, self.skipped_seen, self.written, self.no_content, self.errors
        )
    }
}

/// Output file for one worker of one index. Distinct per `(index, worker)` so no two replicas
/// ever append to the same file.
pub fn worker_output_path(dir: &Path, index: &str, assignment: PartitionAssignment) -> PathBuf {
    let index = index.replace(['/', '\\'], "-");
    dir.join(format!(
        "{}-w{:03}-of-{:03}.jsonl",
        index,
        assignment.worker_id(),
        assignment.total_workers()
    ))
}

#[derive(Debug, Clone)]
pub struct FetchWorker {
    locator: IndexLocator,
    fetcher: RangeFetcher,
    cleaner: ContentCleaner,
    archive_base: String,
    fetch_retry: RetryPolicy,
}

impl FetchWorker {
    pub fn new(http: HttpClient, index_server: &str, archive_base: &str) -> Self {
        Self {
            locator: IndexLocator::new(http.clone(), index_server),
            fetcher: RangeFetcher::new(http),
            cleaner: ContentCleaner::default(),
            archive_base: archive_base.trim_end_matches('/').to_string(),
            fetch_retry: RetryPolicy::default(),
        }
    }

    /// Use the same retry policy for index queries and range fetches.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.locator = self.locator.with_retry(retry.clone());
        self.fetch_retry = retry;
        self
    }

    pub fn with_cleaner(mut self, cleaner: ContentCleaner) -> Self {
        self.cleaner = cleaner;
        self
    }

    pub fn locator(&self) -> &IndexLocator {
        &self.locator
    }

    fn archive_url(&self, filename: &str) -> String {
        format!("{}/{}", self.archive_base, filename.trim_start_matches('/'))
    }

    /// Run the whole chain for one index into `output_path`.
    ///
    /// The ledger is rebuilt from `output_path` first, so re-running the same worker against the
    /// same file only fetches what is missing.
    #[tracing::instrument(skip(self, output_path), fields(worker = %assignment, output = %output_path.as_ref().display()))]
    pub async fn process_index<P: AsRef<Path>>(
        &self,
        index: &str,
        pattern: &str,
        assignment: PartitionAssignment,
        output_path: P,
    ) -> Result<WorkerReport, WorkerError> {
        let mut output = DedupOutput::open(output_path.as_ref())?;

        let records = self
            .locator
            .locate(pattern, index)
            .await
            .map_err(|source| WorkerError::Locator {
                index: index.to_string(),
                source,
            })?;

        let report = self.process_records(&records, assignment, &mut output).await?;
        tracing::info!(%report, "index processed");
        Ok(report)
    }

    /// Fetch, clean and append the records `assignment` owns, strictly in list order.
    ///
    /// Per-record failures are counted and skipped; only output I/O failures abort.
    pub async fn process_records(
        &self,
        records: &[IndexRecord],
        assignment: PartitionAssignment,
        output: &mut DedupOutput,
    ) -> Result<WorkerReport, LedgerError> {
        let mut report = WorkerReport {
            discovered: records.len(),
            ..WorkerReport::default()
        };

        for record in assignment.claim(records) {
            report.claimed += 1;

            if output.is_seen(&record.url) {
                report.skipped_seen += 1;
                continue;
            }

            let payload = match self.fetch_with_retry(record).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(url = %record.url, error = %e, "record fetch failed");
                    report.errors += 1;
                    continue;
                }
            };

            let Some(content) = self.cleaner.clean(payload.as_deref()) else {
                tracing::debug!(url = %record.url, "no content after cleaning");
                report.no_content += 1;
                continue;
            };

            if output.write(&record.url, content)? {
                report.written += 1;
            } else {
                report.skipped_seen += 1;
            }
        }

        Ok(report)
    }

    async fn fetch_with_retry(&self, record: &IndexRecord) -> Result<Option<String>, RangeError> {
        let url = self.archive_url(&record.filename);
        let url = url.as_str();
        let fetcher = &self.fetcher;
        let (offset, length) = (record.offset, record.length);

        self.fetch_retry
            .run(
                move |_| fetcher.fetch_payload(url, offset, length),
                RangeError::retryable,
            )
            .await
    }
}

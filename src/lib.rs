pub mod backoff;
pub mod cleaner;
pub mod cli;
pub mod config;
pub mod fetch_worker;
pub mod index_locator;
pub mod ledger;
pub mod logging;
pub mod merge;
pub mod network;
pub mod orchestration;
pub mod partition;
pub mod range_fetcher;

// Re-export main types for library usage
pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use cleaner::ContentCleaner;
pub use fetch_worker::{FetchWorker, WorkerReport};
pub use index_locator::{IndexLocator, IndexRecord, LocatorError};
pub use ledger::{DedupOutput, OutputRecord, SeenUrlLedger};
pub use merge::{MergeReport, merge_outputs};
pub use network::{FetchError, FetchResult, HttpClient};
pub use partition::PartitionAssignment;
pub use range_fetcher::{RangeError, RangeFetcher};

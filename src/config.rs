// Global configuration constants - single source of truth

pub struct Config;

impl Config {
    // Index service
    pub const INDEX_SERVER: &'static str = "http://index.commoncrawl.org/";
    pub const ARCHIVE_BASE: &'static str = "https://data.commoncrawl.org";
    pub const DEFAULT_INDEX: &'static str = "CC-MAIN-2024-33";
    pub const USER_AGENT: &'static str = "crawl-fleet/0.1 (Common Crawl Index Search Bot)";

    // HTTP/Network config
    pub const REQUEST_TIMEOUT_SECS: u64 = 60;
    pub const MAX_CONTENT_SIZE: usize = 64 * 1024 * 1024; // index responses can be large

    // Retry policy around index queries
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BASE_MS: u64 = 1_000;
    pub const RETRY_MAX_MS: u64 = 30_000;
    pub const RETRY_JITTER_PERCENT: u64 = 25;
    pub const PRE_ATTEMPT_JITTER_MS: u64 = 500;

    // Content gate
    pub const MIN_CONTENT_CHARS: usize = 50;

    // Cluster jobs
    pub const TASK_ID_ENV: &'static str = "CRAWL_FLEET_TASK_ID";
    pub const IMAGE: &'static str = "crawl-fleet:latest";
    pub const NAMESPACE: &'static str = "default";
    pub const CPU_REQUEST: &'static str = "1";
    pub const MEMORY_REQUEST: &'static str = "2Gi";
    pub const BACKOFF_LIMIT: u32 = 4;
    pub const DEPENDENCY_POLL_SECS: u64 = 30;
    /// Extra polls after a dependency reports success while completion markers are still missing.
    pub const DEPENDENCY_SETTLE_POLLS: u32 = 3;

    // Fleet monitor
    pub const FLEET_POLL_SECS: u64 = 30;
    pub const FLEET_RESTART_COOLDOWN_SECS: u64 = 60;
    pub const FLEET_MAX_FAILURES: u32 = 3;
    pub const FLEET_STAGGER_MAX_MS: u64 = 2_000;
    pub const FLEET_DATA_CLAIM: &'static str = "crawler-data-pvc";
    pub const FLEET_DATA_MOUNT: &'static str = "/data";
}

//! Canonical default values shared by the ingestion crates.

pub const DEFAULT_DATABASE_URL: &str = "sqlite:weetbix.sqlite";

/// Test variants requested per result-source page.
pub const DEFAULT_PAGE_SIZE: u32 = 10_000;

/// Ingestion tasks allowed to run at once in one process.
pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 5;

/// Commit workers used by the batched writer.
pub const DEFAULT_WRITER_WORKERS: usize = 8;

/// Test-result rows after which the writer closes a batch.
///
/// The check runs between test variants, so a batch may overshoot by one
/// variant's results. Keep this far below [`DEFAULT_MAX_ROWS_PER_COMMIT`].
pub const DEFAULT_BATCH_RESULT_THRESHOLD: usize = 1_000;

/// Hard ceiling on rows written by a single commit.
pub const DEFAULT_MAX_ROWS_PER_COMMIT: usize = 20_000;

pub const DEFAULT_MAX_TASK_RETRIES: u32 = 5;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Oldest accepted partition time, relative to now.
pub const PARTITION_TIME_MAX_AGE_DAYS: i64 = 90;

/// Furthest accepted partition time into the future, relative to now.
pub const PARTITION_TIME_MAX_FUTURE_HOURS: i64 = 24;

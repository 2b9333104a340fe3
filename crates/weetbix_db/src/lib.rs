//! Database layer for Weetbix ingestion.
//!
//! All SQL lives in this crate. Other crates go through [`WeetbixDb`].
//!
//! # Usage
//!
//! ```rust,ignore
//! use weetbix_db::{WeetbixDb, Result};
//!
//! let db = WeetbixDb::open("weetbix.sqlite").await?;
//!
//! // External trigger: control record + task 0
//! db.create_ingestion(&task).await?;
//!
//! // Continuation protocol
//! let outcome = db.schedule_continuation(&task, &next_page_token).await?;
//! ```

mod analysis;
mod error;
mod ingestion_control;
mod outbox;
mod schema;
mod task_queue;
mod test_results;
mod types;

pub use error::{DbError, Result};
pub use ingestion_control::{continuation_decision, ContinuationDecision};
pub use types::*;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use weetbix_protocol::defaults::DEFAULT_MAX_ROWS_PER_COMMIT;

/// How long a connection waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Database handle for ingestion state and results.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct WeetbixDb {
    pool: SqlitePool,
    max_rows_per_commit: usize,
}

impl WeetbixDb {
    /// Open or create a database file at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.ensure_schema().await?;

        info!(path = %path.display(), "Database opened");
        Ok(db)
    }

    /// Open a database from a `sqlite:<path>` URL. `sqlite::memory:` opens
    /// a private in-memory database.
    pub async fn open_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("sqlite:")
            .ok_or_else(|| DbError::invariant(format!("Unsupported database URL: {}", url)))?;
        if rest == ":memory:" {
            return Self::open_in_memory().await;
        }
        let path = rest.strip_prefix("//").unwrap_or(rest);
        if path.is_empty() {
            return Err(DbError::invariant(format!("sqlite URL missing path: {}", url)));
        }
        Self::open(path).await
    }

    /// Open a private in-memory database (tests, dry runs).
    ///
    /// A single connection is kept for the lifetime of the pool; every new
    /// connection would otherwise see its own empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.ensure_schema().await?;
        Ok(db)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            max_rows_per_commit: DEFAULT_MAX_ROWS_PER_COMMIT,
        }
    }

    /// Override the per-commit row ceiling.
    pub fn with_max_rows_per_commit(mut self, max_rows: usize) -> Self {
        self.max_rows_per_commit = max_rows.max(1);
        self
    }

    pub fn max_rows_per_commit(&self) -> usize {
        self.max_rows_per_commit
    }

    /// Get the underlying connection pool (escape hatch for tests and
    /// ad-hoc inspection).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }

    fn check_commit_size(&self, table: &str, rows: usize) -> Result<()> {
        if rows > self.max_rows_per_commit {
            return Err(DbError::constraint(format!(
                "{} rows for {} exceed the per-commit ceiling of {}",
                rows, table, self.max_rows_per_commit
            )));
        }
        Ok(())
    }
}

// Timestamp utilities
impl WeetbixDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> Result<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| DbError::invalid_state(format!("timestamp out of range: {}", millis)))
    }

    /// Convert microseconds to DateTime. Result tables keep microsecond
    /// precision so re-ingested rows compare equal.
    pub fn micros_to_datetime(micros: i64) -> Result<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| DbError::invalid_state(format!("timestamp out of range: {}", micros)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_database() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("nested").join("weetbix.sqlite");

        let db = WeetbixDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());

        db.close().await;
    }

    #[tokio::test]
    async fn test_open_url() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("url.sqlite");
        let url = format!("sqlite:{}", db_path.display());

        let db = WeetbixDb::open_url(&url).await.unwrap();
        assert!(db_path.exists());
        db.close().await;

        assert!(WeetbixDb::open_url("postgres://nope").await.is_err());
        assert!(WeetbixDb::open_url("sqlite:").await.is_err());
    }

    #[tokio::test]
    async fn test_in_memory_survives_reuse() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.total, 0);
        // Second call goes through the same single connection.
        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_commit_ceiling() {
        let db = WeetbixDb::open_in_memory()
            .await
            .unwrap()
            .with_max_rows_per_commit(10);
        assert!(db.check_commit_size("test_results", 10).is_ok());
        assert!(matches!(
            db.check_commit_size("test_results", 11),
            Err(DbError::Constraint(_))
        ));
    }
}

//! Task queue for ingestion tasks.
//!
//! Claiming uses a read then a guarded `UPDATE ... WHERE status = 'QUEUED'`
//! inside one transaction, so two pollers never claim the same row.

use crate::error::{DbError, Result};
use crate::types::{QueueStats, QueuedTask, TaskStatus};
use crate::WeetbixDb;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, warn};

const TASK_COLUMNS: &str =
    "id, build_id, task_index, payload, status, retry_count, error_message, created_at";

fn task_from_row(row: &SqliteRow) -> Result<QueuedTask> {
    let status: String = row.try_get("status")?;
    let status = TaskStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("unknown task status: {}", status)))?;

    Ok(QueuedTask {
        id: row.try_get("id")?,
        build_id: row.try_get("build_id")?,
        task_index: row.try_get("task_index")?,
        payload: row.try_get("payload")?,
        status,
        retry_count: row.try_get("retry_count")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
    })
}

impl WeetbixDb {
    /// Atomically claim the oldest queued task.
    pub async fn pop_task(&self) -> Result<Option<QueuedTask>> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let task_id: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM ingestion_tasks
            WHERE status = 'QUEUED'
            ORDER BY id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(task_id) = task_id else {
            tx.commit().await?;
            return Ok(None);
        };

        let rows_affected = sqlx::query(
            r#"
            UPDATE ingestion_tasks
            SET status = 'RUNNING', claim_time = ?
            WHERE id = ? AND status = 'QUEUED'
            "#,
        )
        .bind(Self::now_millis())
        .bind(task_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            // Claimed by another poller
            tx.commit().await?;
            return Ok(None);
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM ingestion_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_one(&mut *tx)
        .await?;
        let task = task_from_row(&row)?;

        tx.commit().await?;
        info!(
            task_id = task.id,
            build_id = %task.build_id,
            task_index = task.task_index,
            "Claimed task"
        );
        Ok(Some(task))
    }

    /// Mark a task as completed.
    pub async fn complete_task(&self, task_id: i64) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE ingestion_tasks
            SET status = 'COMPLETED', end_time = ?, error_message = NULL
            WHERE id = ?
            "#,
        )
        .bind(Self::now_millis())
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(DbError::not_found(format!("task {}", task_id)));
        }
        info!(task_id, "Task completed");
        Ok(())
    }

    /// Mark a task as permanently failed.
    pub async fn fail_task(&self, task_id: i64, error: &str) -> Result<()> {
        let rows = sqlx::query(
            r#"
            UPDATE ingestion_tasks
            SET status = 'FAILED', end_time = ?, error_message = ?
            WHERE id = ?
            "#,
        )
        .bind(Self::now_millis())
        .bind(error)
        .bind(task_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            return Err(DbError::not_found(format!("task {}", task_id)));
        }
        warn!(task_id, error, "Task failed");
        Ok(())
    }

    /// Put a task back on the queue for another attempt.
    ///
    /// Returns `false` without touching the row once `max_retries` attempts
    /// have been used; the caller should fail the task instead.
    pub async fn requeue_task(&self, task_id: i64, error: &str, max_retries: u32) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE ingestion_tasks
            SET status = 'QUEUED',
                claim_time = NULL,
                retry_count = retry_count + 1,
                error_message = ?
            WHERE id = ? AND retry_count < ?
            "#,
        )
        .bind(error)
        .bind(task_id)
        .bind(i64::from(max_retries))
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows == 0 {
            warn!(task_id, max_retries, "Task exhausted its retries");
            return Ok(false);
        }
        info!(task_id, error, "Task requeued");
        Ok(true)
    }

    /// Return every RUNNING task to the queue. Used at startup to recover
    /// tasks claimed by a process that died.
    pub async fn requeue_running_tasks(&self) -> Result<u64> {
        let rows = sqlx::query(
            r#"
            UPDATE ingestion_tasks
            SET status = 'QUEUED', claim_time = NULL
            WHERE status = 'RUNNING'
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows > 0 {
            info!(count = rows, "Recovered orphaned tasks");
        }
        Ok(rows)
    }

    /// Tasks for one build, in task order.
    pub async fn list_tasks(&self, build_id: &str) -> Result<Vec<QueuedTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM ingestion_tasks WHERE build_id = ? ORDER BY task_index ASC",
            TASK_COLUMNS
        ))
        .bind(build_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    /// Get queue statistics.
    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total,
                COALESCE(SUM(CASE WHEN status = 'QUEUED' THEN 1 ELSE 0 END), 0) AS queued,
                COALESCE(SUM(CASE WHEN status = 'RUNNING' THEN 1 ELSE 0 END), 0) AS running,
                COALESCE(SUM(CASE WHEN status = 'COMPLETED' THEN 1 ELSE 0 END), 0) AS completed,
                COALESCE(SUM(CASE WHEN status = 'FAILED' THEN 1 ELSE 0 END), 0) AS failed
            FROM ingestion_tasks
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count = |column: &str| -> Result<u64> {
            let value: i64 = row.try_get(column)?;
            Ok(value.max(0) as u64)
        };

        Ok(QueueStats {
            total: count("total")?,
            queued: count("queued")?,
            running: count("running")?,
            completed: count("completed")?,
            failed: count("failed")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use weetbix_protocol::{BuildRef, IngestionTask};

    fn task(id: i64) -> IngestionTask {
        IngestionTask {
            build: BuildRef {
                host: "bb.example.com".to_string(),
                id,
                project: "proj".to_string(),
            },
            presubmit_run: None,
            partition_time: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
            page_token: String::new(),
            task_index: 0,
        }
    }

    #[tokio::test]
    async fn test_pop_in_order_and_complete() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        db.create_ingestion(&task(1)).await.unwrap();
        db.create_ingestion(&task(2)).await.unwrap();

        let first = db.pop_task().await.unwrap().unwrap();
        assert_eq!(first.build_id, "bb.example.com/1");
        assert_eq!(first.status, TaskStatus::Running);

        let second = db.pop_task().await.unwrap().unwrap();
        assert_eq!(second.build_id, "bb.example.com/2");
        assert!(db.pop_task().await.unwrap().is_none());

        db.complete_task(first.id).await.unwrap();
        db.fail_task(second.id, "bad payload").await.unwrap();

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.running, 0);

        let tasks = db.list_tasks("bb.example.com/2").await.unwrap();
        assert_eq!(tasks[0].error_message.as_deref(), Some("bad payload"));
    }

    #[tokio::test]
    async fn test_requeue_until_exhausted() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        db.create_ingestion(&task(7)).await.unwrap();

        for attempt in 0..2 {
            let claimed = db.pop_task().await.unwrap().unwrap();
            assert_eq!(claimed.retry_count, attempt);
            assert!(db.requeue_task(claimed.id, "timeout", 2).await.unwrap());
        }

        let claimed = db.pop_task().await.unwrap().unwrap();
        assert_eq!(claimed.retry_count, 2);
        assert!(!db.requeue_task(claimed.id, "timeout", 2).await.unwrap());
        assert_eq!(db.queue_stats().await.unwrap().running, 1);
    }

    #[tokio::test]
    async fn test_requeue_running_on_startup() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        db.create_ingestion(&task(3)).await.unwrap();
        db.pop_task().await.unwrap().unwrap();

        assert_eq!(db.requeue_running_tasks().await.unwrap(), 1);
        assert_eq!(db.queue_stats().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn test_complete_unknown_task() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        assert!(matches!(
            db.complete_task(999).await,
            Err(DbError::NotFound(_))
        ));
    }
}

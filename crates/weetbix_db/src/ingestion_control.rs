//! Control records and the continuation protocol.
//!
//! Each build has one row in `ingestions`. `task_count` records how many
//! tasks have been created for the build. A task may only schedule its
//! successor when it is the newest task, and the row update and the
//! successor's enqueue commit together.

use crate::error::{DbError, Result};
use crate::types::{ContinuationOutcome, IngestionControl};
use crate::WeetbixDb;
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info, warn};
use weetbix_protocol::IngestionTask;

/// What the control record allows a task to do about its successor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationDecision {
    /// The caller is the newest task; create `next_index`.
    Schedule { next_index: u32 },
    /// A previous attempt already created the successor.
    AlreadyScheduled,
}

/// Decide what to do given the caller's index and the stored task count.
///
/// A task index at or beyond the count means the record was corrupted or
/// the task was forged; that is reported as [`DbError::Invariant`].
pub fn continuation_decision(task_index: u32, task_count: i64) -> Result<ContinuationDecision> {
    if i64::from(task_index) >= task_count {
        return Err(DbError::invariant(format!(
            "task index {} is not below task count {}",
            task_index, task_count
        )));
    }
    let next_index = i64::from(task_index) + 1;
    if next_index == task_count {
        let next_index = u32::try_from(next_index)
            .map_err(|_| DbError::invariant(format!("task index overflow: {}", next_index)))?;
        Ok(ContinuationDecision::Schedule { next_index })
    } else {
        Ok(ContinuationDecision::AlreadyScheduled)
    }
}

impl WeetbixDb {
    /// Create the control record for a build and enqueue task 0.
    ///
    /// Returns `false` if the build was already triggered; nothing is
    /// written in that case.
    pub async fn create_ingestion(&self, task: &IngestionTask) -> Result<bool> {
        if !task.is_first() || !task.page_token.is_empty() {
            return Err(DbError::invariant(format!(
                "ingestion must start at task 0 with no page token (got index {})",
                task.task_index
            )));
        }

        let build_id = task.build.key();
        let now = Self::now_millis();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ingestions (build_id, build_project, is_presubmit, task_count, created_at, last_updated)
            VALUES (?, ?, ?, 1, ?, ?)
            ON CONFLICT(build_id) DO NOTHING
            "#,
        )
        .bind(&build_id)
        .bind(&task.build.project)
        .bind(task.presubmit_run.is_some())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.commit().await?;
            debug!(build_id = %build_id, "Ingestion already exists");
            return Ok(false);
        }

        insert_task(&mut tx, task, now).await?;
        tx.commit().await?;

        info!(build_id = %build_id, project = %task.build.project, "Ingestion created");
        Ok(true)
    }

    /// Get the control record for a build.
    pub async fn get_ingestion_control(&self, build_id: &str) -> Result<Option<IngestionControl>> {
        let control = sqlx::query_as::<_, IngestionControl>(
            r#"
            SELECT build_id, build_project, is_presubmit, task_count, created_at, last_updated
            FROM ingestions
            WHERE build_id = ?
            "#,
        )
        .bind(build_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(control)
    }

    /// Schedule the task after `task` for `next_page_token`.
    ///
    /// Idempotent across retries of the same task: only the first attempt
    /// advances `task_count` and enqueues the successor. A concurrent
    /// writer moving `task_count` between the read and the write yields
    /// [`DbError::Conflict`], which the caller retries.
    pub async fn schedule_continuation(
        &self,
        task: &IngestionTask,
        next_page_token: &str,
    ) -> Result<ContinuationOutcome> {
        if next_page_token.is_empty() {
            return Err(DbError::invariant(
                "continuation requested without a page token",
            ));
        }

        let build_id = task.build.key();
        // Take the write lock up front; upgrading a read lock fails without waiting.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        let task_count: Option<i64> =
            sqlx::query_scalar("SELECT task_count FROM ingestions WHERE build_id = ?")
                .bind(&build_id)
                .fetch_optional(&mut *tx)
                .await?;

        let Some(task_count) = task_count else {
            tx.commit().await?;
            return Err(DbError::invalid_state(format!(
                "no ingestion control record for build {}",
                build_id
            )));
        };

        let next_index = match continuation_decision(task.task_index, task_count)? {
            ContinuationDecision::AlreadyScheduled => {
                tx.commit().await?;
                debug!(
                    build_id = %build_id,
                    task_index = task.task_index,
                    task_count,
                    "Continuation already scheduled"
                );
                return Ok(ContinuationOutcome::AlreadyScheduled { task_count });
            }
            ContinuationDecision::Schedule { next_index } => next_index,
        };

        let now = Self::now_millis();
        let updated = sqlx::query(
            r#"
            UPDATE ingestions
            SET task_count = ?, last_updated = ?
            WHERE build_id = ? AND task_count = ?
            "#,
        )
        .bind(i64::from(next_index) + 1)
        .bind(now)
        .bind(&build_id)
        .bind(task_count)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            // Row moved under us - roll back and let the caller retry
            tx.rollback().await?;
            warn!(build_id = %build_id, task_count, "task_count changed concurrently");
            return Err(DbError::conflict(format!(
                "task_count for {} changed from {}",
                build_id, task_count
            )));
        }

        let next = task.continuation(next_page_token);
        insert_task(&mut tx, &next, now).await?;
        tx.commit().await?;

        info!(
            build_id = %build_id,
            task_index = next_index,
            "Scheduled continuation task"
        );
        Ok(ContinuationOutcome::Scheduled {
            task_index: next_index,
        })
    }
}

/// Enqueue a task inside an open transaction.
async fn insert_task(
    tx: &mut Transaction<'_, Sqlite>,
    task: &IngestionTask,
    now: i64,
) -> Result<()> {
    let payload = serde_json::to_string(task)?;
    let inserted = sqlx::query(
        r#"
        INSERT INTO ingestion_tasks (build_id, task_index, payload, status, retry_count, created_at)
        VALUES (?, ?, ?, 'QUEUED', 0, ?)
        ON CONFLICT(build_id, task_index) DO NOTHING
        "#,
    )
    .bind(task.build.key())
    .bind(i64::from(task.task_index))
    .bind(&payload)
    .bind(now)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if inserted == 0 {
        return Err(DbError::invalid_state(format!(
            "task {} for {} already enqueued",
            task.task_index,
            task.build.key()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use weetbix_protocol::BuildRef;

    fn task0() -> IngestionTask {
        IngestionTask {
            build: BuildRef {
                host: "cr-buildbucket.appspot.com".to_string(),
                id: 87654321,
                project: "chromium".to_string(),
            },
            presubmit_run: None,
            partition_time: Utc.with_ymd_and_hms(2026, 10, 1, 12, 0, 0).unwrap(),
            page_token: String::new(),
            task_index: 0,
        }
    }

    #[test]
    fn test_decision_table() {
        assert_eq!(
            continuation_decision(0, 1).unwrap(),
            ContinuationDecision::Schedule { next_index: 1 }
        );
        assert_eq!(
            continuation_decision(0, 2).unwrap(),
            ContinuationDecision::AlreadyScheduled
        );
        assert_eq!(
            continuation_decision(3, 4).unwrap(),
            ContinuationDecision::Schedule { next_index: 4 }
        );
        assert!(matches!(
            continuation_decision(1, 1),
            Err(DbError::Invariant(_))
        ));
        assert!(matches!(
            continuation_decision(5, 2),
            Err(DbError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_create_ingestion_once() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let task = task0();

        assert!(db.create_ingestion(&task).await.unwrap());
        assert!(!db.create_ingestion(&task).await.unwrap());

        let control = db
            .get_ingestion_control(&task.build.key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control.task_count, 1);
        assert_eq!(control.build_project, "chromium");
        assert!(!control.is_presubmit);

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.queued, 1);
    }

    #[tokio::test]
    async fn test_create_ingestion_rejects_continuation() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let task = task0().continuation("page-2");
        assert!(matches!(
            db.create_ingestion(&task).await,
            Err(DbError::Invariant(_))
        ));
    }

    #[tokio::test]
    async fn test_schedule_is_idempotent_across_retries() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let task = task0();
        db.create_ingestion(&task).await.unwrap();

        let first = db.schedule_continuation(&task, "page-2").await.unwrap();
        assert_eq!(first, ContinuationOutcome::Scheduled { task_index: 1 });

        // Retry of task 0 sees task_count = 2 and does nothing.
        let retry = db.schedule_continuation(&task, "page-2").await.unwrap();
        assert_eq!(retry, ContinuationOutcome::AlreadyScheduled { task_count: 2 });

        let control = db
            .get_ingestion_control(&task.build.key())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(control.task_count, 2);

        let stats = db.queue_stats().await.unwrap();
        assert_eq!(stats.total, 2);

        // The continuation carries the token and the next index.
        let claimed = db.pop_task().await.unwrap().unwrap();
        assert_eq!(claimed.task_index, 0);
        let claimed = db.pop_task().await.unwrap().unwrap();
        let next = claimed.decode().unwrap();
        assert_eq!(next.task_index, 1);
        assert_eq!(next.page_token, "page-2");
        assert_eq!(next.partition_time, task.partition_time);
    }

    #[tokio::test]
    async fn test_schedule_chain() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let task = task0();
        db.create_ingestion(&task).await.unwrap();

        db.schedule_continuation(&task, "p1").await.unwrap();
        let task1 = task.continuation("p1");
        let outcome = db.schedule_continuation(&task1, "p2").await.unwrap();
        assert_eq!(outcome, ContinuationOutcome::Scheduled { task_index: 2 });

        // Task 0 retried late must not create anything.
        let outcome = db.schedule_continuation(&task, "p1").await.unwrap();
        assert_eq!(outcome, ContinuationOutcome::AlreadyScheduled { task_count: 3 });
        assert_eq!(db.queue_stats().await.unwrap().total, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_replays_schedule_once() {
        let dir = tempfile::tempdir().unwrap();
        let db = WeetbixDb::open(dir.path().join("weetbix.db")).await.unwrap();
        let task = task0();
        db.create_ingestion(&task).await.unwrap();

        let attempts: Vec<_> = (0..4)
            .map(|_| {
                let db = db.clone();
                let task = task.clone();
                tokio::spawn(async move { db.schedule_continuation(&task, "page-2").await })
            })
            .collect();

        let mut scheduled = 0;
        for attempt in attempts {
            match attempt.await.unwrap().unwrap() {
                ContinuationOutcome::Scheduled { task_index } => {
                    assert_eq!(task_index, 1);
                    scheduled += 1;
                }
                ContinuationOutcome::AlreadyScheduled { task_count } => assert_eq!(task_count, 2),
            }
        }
        assert_eq!(scheduled, 1);
        assert_eq!(db.queue_stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_schedule_requires_control_record() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let result = db.schedule_continuation(&task0(), "p1").await;
        assert!(matches!(result, Err(DbError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_schedule_rejects_empty_token_and_forged_index() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let task = task0();
        db.create_ingestion(&task).await.unwrap();

        assert!(matches!(
            db.schedule_continuation(&task, "").await,
            Err(DbError::Invariant(_))
        ));

        let forged = IngestionTask {
            task_index: 4,
            ..task.clone()
        };
        assert!(matches!(
            db.schedule_continuation(&forged, "p5").await,
            Err(DbError::Invariant(_))
        ));
        assert_eq!(db.queue_stats().await.unwrap().total, 1);
    }
}

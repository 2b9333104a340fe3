//! Outbox tables for downstream consumers.
//!
//! Clustering receives one entry per page of failures; result collection
//! receives one request per invocation. Both are keyed so that a retried
//! task writes the same entry again rather than a second one.

use crate::error::Result;
use crate::types::ClusteringOutboxEntry;
use crate::WeetbixDb;
use sqlx::Row;
use tracing::{debug, info};
use weetbix_protocol::{BuilderId, ClusteringOptions, ResultCollectionRequest, TestVariant};

impl WeetbixDb {
    /// Record a page of failures for clustering.
    pub async fn enqueue_clustering(
        &self,
        options: &ClusteringOptions,
        variants: &[TestVariant],
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO clustering_outbox (project, invocation_id, task_index, options, variants, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, invocation_id, task_index) DO UPDATE SET
                options = excluded.options,
                variants = excluded.variants
            "#,
        )
        .bind(&options.project)
        .bind(&options.invocation_id)
        .bind(i64::from(options.task_index))
        .bind(serde_json::to_string(options)?)
        .bind(serde_json::to_string(variants)?)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;

        debug!(
            project = %options.project,
            invocation_id = %options.invocation_id,
            task_index = options.task_index,
            variants = variants.len(),
            "Queued failures for clustering"
        );
        Ok(())
    }

    /// Clustering entries of a project, oldest page first.
    pub async fn list_clustering_outbox(&self, project: &str) -> Result<Vec<ClusteringOutboxEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT project, invocation_id, task_index, options, variants
            FROM clustering_outbox
            WHERE project = ?
            ORDER BY invocation_id, task_index
            "#,
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ClusteringOutboxEntry {
                    project: row.try_get("project")?,
                    invocation_id: row.try_get("invocation_id")?,
                    task_index: row.try_get("task_index")?,
                    options: serde_json::from_str(&row.try_get::<String, _>("options")?)?,
                    variants: serde_json::from_str(&row.try_get::<String, _>("variants")?)?,
                })
            })
            .collect()
    }

    /// Schedule result collection for an invocation.
    ///
    /// Returns `false` if it was already scheduled.
    pub async fn enqueue_result_collection(&self, request: &ResultCollectionRequest) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO result_collection_tasks (
                invocation_id, resultdb_host, builder, is_presubmit, contributed_to_submission, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(invocation_id) DO NOTHING
            "#,
        )
        .bind(&request.invocation_id)
        .bind(&request.resultdb_host)
        .bind(serde_json::to_string(&request.builder)?)
        .bind(request.is_presubmit)
        .bind(request.contributed_to_submission)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            info!(invocation_id = %request.invocation_id, "Scheduled result collection");
        }
        Ok(inserted > 0)
    }

    pub async fn list_result_collection_tasks(&self) -> Result<Vec<ResultCollectionRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT invocation_id, resultdb_host, builder, is_presubmit, contributed_to_submission
            FROM result_collection_tasks
            ORDER BY created_at, invocation_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let builder: BuilderId = serde_json::from_str(&row.try_get::<String, _>("builder")?)?;
                Ok(ResultCollectionRequest {
                    invocation_id: row.try_get("invocation_id")?,
                    resultdb_host: row.try_get("resultdb_host")?,
                    builder,
                    is_presubmit: row.try_get("is_presubmit")?,
                    contributed_to_submission: row.try_get("contributed_to_submission")?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use weetbix_protocol::BuildStatus;

    fn options(task_index: u32) -> ClusteringOptions {
        ClusteringOptions {
            task_index,
            project: "chromium".to_string(),
            partition_time: Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).unwrap(),
            realm: "chromium:ci".to_string(),
            invocation_id: "build-1".to_string(),
            build_status: BuildStatus::Failure,
            build_critical: true,
            changelists: Vec::new(),
            presubmit_run: None,
        }
    }

    #[tokio::test]
    async fn test_clustering_entry_per_page() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        db.enqueue_clustering(&options(0), &[]).await.unwrap();
        db.enqueue_clustering(&options(0), &[]).await.unwrap();
        db.enqueue_clustering(&options(1), &[]).await.unwrap();

        let entries = db.list_clustering_outbox("chromium").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].task_index, 1);
        assert_eq!(entries[1].options, options(1));
    }

    #[tokio::test]
    async fn test_result_collection_once() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let request = ResultCollectionRequest {
            invocation_id: "build-1".to_string(),
            resultdb_host: "results.api.cr.dev".to_string(),
            builder: BuilderId {
                project: "chromium".to_string(),
                bucket: "ci".to_string(),
                builder: "linux-rel".to_string(),
            },
            is_presubmit: false,
            contributed_to_submission: false,
        };

        assert!(db.enqueue_result_collection(&request).await.unwrap());
        assert!(!db.enqueue_result_collection(&request).await.unwrap());
        assert_eq!(db.list_result_collection_tasks().await.unwrap(), vec![request]);
    }
}

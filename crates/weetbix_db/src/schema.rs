//! Schema creation for all ingestion tables.
//!
//! All CREATE TABLE statements live here - single source of truth.

use crate::error::Result;
use crate::WeetbixDb;
use tracing::debug;

impl WeetbixDb {
    /// Ensure all tables exist.
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        self.create_control_tables().await?;
        self.create_result_tables().await?;
        self.create_downstream_tables().await?;

        debug!("Database schema verified");
        Ok(())
    }

    /// Control records and the task queue.
    async fn create_control_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ingestions (
                build_id TEXT PRIMARY KEY,
                build_project TEXT NOT NULL,
                is_presubmit INTEGER NOT NULL DEFAULT 0,
                task_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                last_updated INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ingestion_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id TEXT NOT NULL,
                task_index INTEGER NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'QUEUED',
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at INTEGER NOT NULL,
                claim_time INTEGER,
                end_time INTEGER,
                UNIQUE(build_id, task_index)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_ingestion_tasks_status ON ingestion_tasks(status)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Ingested invocations, git references, realms and results.
    async fn create_result_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS ingested_invocations (
                project TEXT NOT NULL,
                invocation_id TEXT NOT NULL,
                sub_realm TEXT NOT NULL,
                partition_time INTEGER NOT NULL,
                build_status TEXT NOT NULL,
                presubmit_mode TEXT,
                presubmit_owner TEXT,
                presubmit_critical INTEGER,
                git_reference_hash TEXT,
                commit_position INTEGER NOT NULL DEFAULT 0,
                commit_hash TEXT NOT NULL DEFAULT '',
                changelist_hosts TEXT NOT NULL DEFAULT '[]',
                changelist_changes TEXT NOT NULL DEFAULT '[]',
                changelist_patchsets TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (project, invocation_id)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS git_references (
                project TEXT NOT NULL,
                git_reference_hash TEXT NOT NULL,
                hostname TEXT NOT NULL,
                repository TEXT NOT NULL,
                reference TEXT NOT NULL,
                last_ingestion_time INTEGER NOT NULL,
                PRIMARY KEY (project, git_reference_hash)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS test_variant_realms (
                project TEXT NOT NULL,
                test_id TEXT NOT NULL,
                variant_hash TEXT NOT NULL,
                sub_realm TEXT NOT NULL,
                variant TEXT NOT NULL,
                last_ingestion_time INTEGER NOT NULL,
                PRIMARY KEY (project, test_id, variant_hash, sub_realm)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS test_results (
                project TEXT NOT NULL,
                test_id TEXT NOT NULL,
                variant_hash TEXT NOT NULL,
                invocation_id TEXT NOT NULL,
                run_index INTEGER NOT NULL,
                result_index INTEGER NOT NULL,
                partition_time INTEGER NOT NULL,
                sub_realm TEXT NOT NULL,
                is_unexpected INTEGER NOT NULL,
                status TEXT NOT NULL,
                run_duration_micros INTEGER,
                exoneration_reasons TEXT NOT NULL DEFAULT '[]',
                build_status TEXT NOT NULL,
                presubmit_mode TEXT,
                presubmit_owner TEXT,
                presubmit_critical INTEGER,
                git_reference_hash TEXT,
                commit_position INTEGER NOT NULL DEFAULT 0,
                changelist_hosts TEXT NOT NULL DEFAULT '[]',
                changelist_changes TEXT NOT NULL DEFAULT '[]',
                changelist_patchsets TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (project, test_id, variant_hash, invocation_id, run_index, result_index)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_test_results_invocation ON test_results(project, invocation_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_test_results_partition ON test_results(project, partition_time)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Analysis aggregates and outbox tables for downstream consumers.
    async fn create_downstream_tables(&self) -> Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS analyzed_test_variants (
                realm TEXT NOT NULL,
                test_id TEXT NOT NULL,
                variant_hash TEXT NOT NULL,
                variant TEXT NOT NULL,
                status TEXT NOT NULL,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                last_invocation_id TEXT NOT NULL,
                PRIMARY KEY (realm, test_id, variant_hash)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS clustering_outbox (
                project TEXT NOT NULL,
                invocation_id TEXT NOT NULL,
                task_index INTEGER NOT NULL,
                options TEXT NOT NULL,
                variants TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (project, invocation_id, task_index)
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS result_collection_tasks (
                invocation_id TEXT PRIMARY KEY,
                resultdb_host TEXT NOT NULL,
                builder TEXT NOT NULL,
                is_presubmit INTEGER NOT NULL,
                contributed_to_submission INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

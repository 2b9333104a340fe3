//! Ingested invocations, git references, test variant realms and results.
//!
//! Every write here is an upsert keyed on the table's natural key, so a
//! retried page rewrites the same rows instead of duplicating them.

use crate::error::{DbError, Result};
use crate::types::{TestResultRow, TestVariantRealm};
use crate::WeetbixDb;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::debug;
use weetbix_protocol::{
    BuildStatus, Changelist, ExonerationReason, GitReference, IngestedInvocation, PresubmitInfo,
    PresubmitRunMode, TestStatus,
};

/// Changelists as three parallel JSON arrays.
struct ChangelistColumns {
    hosts: String,
    changes: String,
    patchsets: String,
}

impl ChangelistColumns {
    fn encode(changelists: &[Changelist]) -> Result<Self> {
        let hosts: Vec<&str> = changelists.iter().map(|cl| cl.host.as_str()).collect();
        let changes: Vec<i64> = changelists.iter().map(|cl| cl.change).collect();
        let patchsets: Vec<i64> = changelists.iter().map(|cl| cl.patchset).collect();
        Ok(Self {
            hosts: serde_json::to_string(&hosts)?,
            changes: serde_json::to_string(&changes)?,
            patchsets: serde_json::to_string(&patchsets)?,
        })
    }

    fn decode(row: &SqliteRow) -> Result<Vec<Changelist>> {
        let hosts: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("changelist_hosts")?)?;
        let changes: Vec<i64> =
            serde_json::from_str(&row.try_get::<String, _>("changelist_changes")?)?;
        let patchsets: Vec<i64> =
            serde_json::from_str(&row.try_get::<String, _>("changelist_patchsets")?)?;

        if hosts.len() != changes.len() || hosts.len() != patchsets.len() {
            return Err(DbError::invalid_state(format!(
                "changelist columns differ in length: {} hosts, {} changes, {} patchsets",
                hosts.len(),
                changes.len(),
                patchsets.len()
            )));
        }

        Ok(hosts
            .into_iter()
            .zip(changes)
            .zip(patchsets)
            .map(|((host, change), patchset)| Changelist {
                host,
                change,
                patchset,
            })
            .collect())
    }
}

fn decode_presubmit(row: &SqliteRow) -> Result<Option<PresubmitInfo>> {
    let mode: Option<String> = row.try_get("presubmit_mode")?;
    let Some(mode) = mode else {
        return Ok(None);
    };
    let mode = PresubmitRunMode::parse(&mode)
        .ok_or_else(|| DbError::invalid_state(format!("unknown presubmit mode: {}", mode)))?;
    let owner: Option<String> = row.try_get("presubmit_owner")?;
    let critical: Option<bool> = row.try_get("presubmit_critical")?;
    Ok(Some(PresubmitInfo {
        mode,
        owner: owner.unwrap_or_default(),
        critical: critical.unwrap_or(false),
    }))
}

fn decode_build_status(row: &SqliteRow) -> Result<BuildStatus> {
    let status: String = row.try_get("build_status")?;
    BuildStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("unknown build status: {}", status)))
}

fn invocation_from_row(row: &SqliteRow) -> Result<IngestedInvocation> {
    Ok(IngestedInvocation {
        project: row.try_get("project")?,
        invocation_id: row.try_get("invocation_id")?,
        sub_realm: row.try_get("sub_realm")?,
        partition_time: WeetbixDb::micros_to_datetime(row.try_get("partition_time")?)?,
        build_status: decode_build_status(row)?,
        presubmit: decode_presubmit(row)?,
        git_reference_hash: row.try_get("git_reference_hash")?,
        commit_position: row.try_get("commit_position")?,
        commit_hash: row.try_get("commit_hash")?,
        changelists: ChangelistColumns::decode(row)?,
    })
}

fn result_from_row(row: &SqliteRow) -> Result<TestResultRow> {
    let status: String = row.try_get("status")?;
    let status = TestStatus::parse(&status)
        .ok_or_else(|| DbError::invalid_state(format!("unknown test status: {}", status)))?;
    let reasons: Vec<ExonerationReason> =
        serde_json::from_str(&row.try_get::<String, _>("exoneration_reasons")?)?;

    Ok(TestResultRow {
        project: row.try_get("project")?,
        test_id: row.try_get("test_id")?,
        variant_hash: row.try_get("variant_hash")?,
        invocation_id: row.try_get("invocation_id")?,
        run_index: row.try_get("run_index")?,
        result_index: row.try_get("result_index")?,
        partition_time: WeetbixDb::micros_to_datetime(row.try_get("partition_time")?)?,
        sub_realm: row.try_get("sub_realm")?,
        is_unexpected: row.try_get("is_unexpected")?,
        status,
        run_duration_micros: row.try_get("run_duration_micros")?,
        exoneration_reasons: reasons,
        build_status: decode_build_status(row)?,
        presubmit: decode_presubmit(row)?,
        git_reference_hash: row.try_get("git_reference_hash")?,
        commit_position: row.try_get("commit_position")?,
        changelists: ChangelistColumns::decode(row)?,
    })
}

impl WeetbixDb {
    /// Record the invocation-level facts extracted from the build.
    pub async fn record_ingested_invocation(&self, inv: &IngestedInvocation) -> Result<()> {
        let cls = ChangelistColumns::encode(&inv.changelists)?;
        let presubmit = inv.presubmit.as_ref();

        sqlx::query(
            r#"
            INSERT INTO ingested_invocations (
                project, invocation_id, sub_realm, partition_time, build_status,
                presubmit_mode, presubmit_owner, presubmit_critical,
                git_reference_hash, commit_position, commit_hash,
                changelist_hosts, changelist_changes, changelist_patchsets
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, invocation_id) DO UPDATE SET
                sub_realm = excluded.sub_realm,
                partition_time = excluded.partition_time,
                build_status = excluded.build_status,
                presubmit_mode = excluded.presubmit_mode,
                presubmit_owner = excluded.presubmit_owner,
                presubmit_critical = excluded.presubmit_critical,
                git_reference_hash = excluded.git_reference_hash,
                commit_position = excluded.commit_position,
                commit_hash = excluded.commit_hash,
                changelist_hosts = excluded.changelist_hosts,
                changelist_changes = excluded.changelist_changes,
                changelist_patchsets = excluded.changelist_patchsets
            "#,
        )
        .bind(&inv.project)
        .bind(&inv.invocation_id)
        .bind(&inv.sub_realm)
        .bind(inv.partition_time.timestamp_micros())
        .bind(inv.build_status.as_str())
        .bind(presubmit.map(|p| p.mode.as_str()))
        .bind(presubmit.map(|p| p.owner.as_str()))
        .bind(presubmit.map(|p| p.critical))
        .bind(inv.git_reference_hash.as_deref())
        .bind(inv.commit_position)
        .bind(&inv.commit_hash)
        .bind(&cls.hosts)
        .bind(&cls.changes)
        .bind(&cls.patchsets)
        .execute(&self.pool)
        .await?;

        debug!(
            project = %inv.project,
            invocation_id = %inv.invocation_id,
            "Recorded ingested invocation"
        );
        Ok(())
    }

    /// Read back an ingested invocation, as continuation tasks do.
    pub async fn read_ingested_invocation(
        &self,
        project: &str,
        invocation_id: &str,
    ) -> Result<Option<IngestedInvocation>> {
        let row = sqlx::query(
            "SELECT * FROM ingested_invocations WHERE project = ? AND invocation_id = ?",
        )
        .bind(project)
        .bind(invocation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(invocation_from_row).transpose()
    }

    /// Record a git reference; refreshes its last ingestion time.
    pub async fn record_git_reference(&self, git_ref: &GitReference) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO git_references (project, git_reference_hash, hostname, repository, reference, last_ingestion_time)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(project, git_reference_hash) DO UPDATE SET
                last_ingestion_time = excluded.last_ingestion_time
            "#,
        )
        .bind(&git_ref.project)
        .bind(&git_ref.git_reference_hash)
        .bind(&git_ref.hostname)
        .bind(&git_ref.repository)
        .bind(&git_ref.reference)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_git_reference(
        &self,
        project: &str,
        git_reference_hash: &str,
    ) -> Result<Option<GitReference>> {
        let row = sqlx::query(
            r#"
            SELECT project, git_reference_hash, hostname, repository, reference
            FROM git_references
            WHERE project = ? AND git_reference_hash = ?
            "#,
        )
        .bind(project)
        .bind(git_reference_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(GitReference {
                project: row.try_get("project")?,
                git_reference_hash: row.try_get("git_reference_hash")?,
                hostname: row.try_get("hostname")?,
                repository: row.try_get("repository")?,
                reference: row.try_get("reference")?,
            })
        })
        .transpose()
    }

    /// Upsert test variant realms in a single commit.
    pub async fn upsert_test_variant_realms(&self, realms: &[TestVariantRealm]) -> Result<()> {
        if realms.is_empty() {
            return Ok(());
        }
        self.check_commit_size("test_variant_realms", realms.len())?;

        let mut tx = self.pool.begin().await?;
        for realm in realms {
            sqlx::query(
                r#"
                INSERT INTO test_variant_realms (project, test_id, variant_hash, sub_realm, variant, last_ingestion_time)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(project, test_id, variant_hash, sub_realm) DO UPDATE SET
                    variant = excluded.variant,
                    last_ingestion_time = excluded.last_ingestion_time
                "#,
            )
            .bind(&realm.project)
            .bind(&realm.test_id)
            .bind(&realm.variant_hash)
            .bind(&realm.sub_realm)
            .bind(serde_json::to_string(&realm.variant)?)
            .bind(realm.last_ingestion_time.timestamp_micros())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(rows = realms.len(), "Committed test variant realms");
        Ok(())
    }

    /// Realms recorded for a project, ordered by key.
    pub async fn read_test_variant_realms(&self, project: &str) -> Result<Vec<TestVariantRealm>> {
        let rows = sqlx::query(
            r#"
            SELECT project, test_id, variant_hash, sub_realm, variant, last_ingestion_time
            FROM test_variant_realms
            WHERE project = ?
            ORDER BY test_id, variant_hash, sub_realm
            "#,
        )
        .bind(project)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let variant: BTreeMap<String, String> =
                    serde_json::from_str(&row.try_get::<String, _>("variant")?)?;
                Ok(TestVariantRealm {
                    project: row.try_get("project")?,
                    test_id: row.try_get("test_id")?,
                    variant_hash: row.try_get("variant_hash")?,
                    sub_realm: row.try_get("sub_realm")?,
                    variant,
                    last_ingestion_time: Self::micros_to_datetime(
                        row.try_get("last_ingestion_time")?,
                    )?,
                })
            })
            .collect()
    }

    /// Write test result rows in a single commit.
    ///
    /// Rows already present are overwritten with the same content, so a
    /// retried page converges on the same stored state.
    pub async fn insert_test_results(&self, results: &[TestResultRow]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        self.check_commit_size("test_results", results.len())?;

        let mut tx = self.pool.begin().await?;
        for result in results {
            let cls = ChangelistColumns::encode(&result.changelists)?;
            let presubmit = result.presubmit.as_ref();

            sqlx::query(
                r#"
                INSERT INTO test_results (
                    project, test_id, variant_hash, invocation_id, run_index, result_index,
                    partition_time, sub_realm, is_unexpected, status, run_duration_micros,
                    exoneration_reasons, build_status,
                    presubmit_mode, presubmit_owner, presubmit_critical,
                    git_reference_hash, commit_position,
                    changelist_hosts, changelist_changes, changelist_patchsets
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(project, test_id, variant_hash, invocation_id, run_index, result_index)
                DO UPDATE SET
                    partition_time = excluded.partition_time,
                    sub_realm = excluded.sub_realm,
                    is_unexpected = excluded.is_unexpected,
                    status = excluded.status,
                    run_duration_micros = excluded.run_duration_micros,
                    exoneration_reasons = excluded.exoneration_reasons,
                    build_status = excluded.build_status,
                    presubmit_mode = excluded.presubmit_mode,
                    presubmit_owner = excluded.presubmit_owner,
                    presubmit_critical = excluded.presubmit_critical,
                    git_reference_hash = excluded.git_reference_hash,
                    commit_position = excluded.commit_position,
                    changelist_hosts = excluded.changelist_hosts,
                    changelist_changes = excluded.changelist_changes,
                    changelist_patchsets = excluded.changelist_patchsets
                "#,
            )
            .bind(&result.project)
            .bind(&result.test_id)
            .bind(&result.variant_hash)
            .bind(&result.invocation_id)
            .bind(result.run_index)
            .bind(result.result_index)
            .bind(result.partition_time.timestamp_micros())
            .bind(&result.sub_realm)
            .bind(result.is_unexpected)
            .bind(result.status.as_str())
            .bind(result.run_duration_micros)
            .bind(serde_json::to_string(&result.exoneration_reasons)?)
            .bind(result.build_status.as_str())
            .bind(presubmit.map(|p| p.mode.as_str()))
            .bind(presubmit.map(|p| p.owner.as_str()))
            .bind(presubmit.map(|p| p.critical))
            .bind(result.git_reference_hash.as_deref())
            .bind(result.commit_position)
            .bind(&cls.hosts)
            .bind(&cls.changes)
            .bind(&cls.patchsets)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(rows = results.len(), "Committed test results");
        Ok(())
    }

    /// All results of one invocation, ordered by key.
    pub async fn read_test_results(
        &self,
        project: &str,
        invocation_id: &str,
    ) -> Result<Vec<TestResultRow>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM test_results
            WHERE project = ? AND invocation_id = ?
            ORDER BY test_id, variant_hash, run_index, result_index
            "#,
        )
        .bind(project)
        .bind(invocation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(result_from_row).collect()
    }

    /// Number of stored results for a project.
    pub async fn count_test_results(&self, project: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM test_results WHERE project = ?")
            .bind(project)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn invocation() -> IngestedInvocation {
        IngestedInvocation {
            project: "chromium".to_string(),
            invocation_id: "build-1234".to_string(),
            sub_realm: "ci".to_string(),
            partition_time: Utc.with_ymd_and_hms(2026, 10, 1, 8, 30, 0).unwrap(),
            build_status: BuildStatus::Failure,
            presubmit: Some(PresubmitInfo {
                mode: PresubmitRunMode::FullRun,
                owner: "user".to_string(),
                critical: true,
            }),
            git_reference_hash: Some("0123456789abcdef".to_string()),
            commit_position: 111888,
            commit_hash: "deadbeef".to_string(),
            changelists: vec![
                Changelist {
                    host: "chromium".to_string(),
                    change: 12345,
                    patchset: 2,
                },
                Changelist {
                    host: "chrome-internal".to_string(),
                    change: 678,
                    patchset: 9,
                },
            ],
        }
    }

    fn result_row(test_id: &str, run_index: i64, result_index: i64) -> TestResultRow {
        let inv = invocation();
        TestResultRow {
            project: inv.project,
            test_id: test_id.to_string(),
            variant_hash: "hash".to_string(),
            invocation_id: inv.invocation_id,
            run_index,
            result_index,
            partition_time: inv.partition_time,
            sub_realm: inv.sub_realm,
            is_unexpected: true,
            status: TestStatus::Fail,
            run_duration_micros: Some(1_500_000),
            exoneration_reasons: vec![ExonerationReason::OccursOnMainline],
            build_status: inv.build_status,
            presubmit: inv.presubmit,
            git_reference_hash: inv.git_reference_hash,
            commit_position: inv.commit_position,
            changelists: inv.changelists,
        }
    }

    #[tokio::test]
    async fn test_ingested_invocation_round_trip() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let inv = invocation();
        db.record_ingested_invocation(&inv).await.unwrap();
        // Retry overwrites, never duplicates.
        db.record_ingested_invocation(&inv).await.unwrap();

        let read = db
            .read_ingested_invocation("chromium", "build-1234")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, inv);
        assert!(db
            .read_ingested_invocation("chromium", "missing")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_changelist_length_mismatch_is_invalid_state() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        db.record_ingested_invocation(&invocation()).await.unwrap();
        sqlx::query("UPDATE ingested_invocations SET changelist_patchsets = '[1]'")
            .execute(db.pool())
            .await
            .unwrap();

        let result = db.read_ingested_invocation("chromium", "build-1234").await;
        assert!(matches!(result, Err(DbError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_git_reference_upsert() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let git_ref = GitReference {
            project: "chromium".to_string(),
            git_reference_hash: "0123456789abcdef".to_string(),
            hostname: "chromium.googlesource.com".to_string(),
            repository: "chromium/src".to_string(),
            reference: "refs/heads/main".to_string(),
        };
        db.record_git_reference(&git_ref).await.unwrap();
        db.record_git_reference(&git_ref).await.unwrap();

        let read = db
            .get_git_reference("chromium", "0123456789abcdef")
            .await
            .unwrap();
        assert_eq!(read, Some(git_ref));
    }

    #[tokio::test]
    async fn test_results_overwrite_on_retry() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let rows = vec![result_row("t1", 0, 0), result_row("t1", 0, 1), result_row("t2", 1, 0)];

        db.insert_test_results(&rows).await.unwrap();
        db.insert_test_results(&rows).await.unwrap();

        let stored = db.read_test_results("chromium", "build-1234").await.unwrap();
        assert_eq!(stored, rows);
        assert_eq!(db.count_test_results("chromium").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_commit_ceiling_rejects_whole_batch() {
        let db = WeetbixDb::open_in_memory()
            .await
            .unwrap()
            .with_max_rows_per_commit(2);
        let rows = vec![result_row("t1", 0, 0), result_row("t1", 0, 1), result_row("t2", 1, 0)];

        assert!(matches!(
            db.insert_test_results(&rows).await,
            Err(DbError::Constraint(_))
        ));
        assert_eq!(db.count_test_results("chromium").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_variant_realms_upsert() {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let mut variant = BTreeMap::new();
        variant.insert("builder".to_string(), "linux-rel".to_string());
        let realm = TestVariantRealm {
            project: "chromium".to_string(),
            test_id: "ninja://tests:a".to_string(),
            variant_hash: "hash".to_string(),
            sub_realm: "ci".to_string(),
            variant,
            last_ingestion_time: Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap(),
        };
        db.upsert_test_variant_realms(&[realm.clone()]).await.unwrap();

        let later = TestVariantRealm {
            last_ingestion_time: Utc.with_ymd_and_hms(2026, 10, 2, 9, 0, 0).unwrap(),
            ..realm.clone()
        };
        db.upsert_test_variant_realms(&[later.clone()]).await.unwrap();

        let stored = db.read_test_variant_realms("chromium").await.unwrap();
        assert_eq!(stored, vec![later]);
    }
}

//! Row types for the ingestion tables.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use weetbix_protocol::{
    BuildStatus, Changelist, ExonerationReason, IngestionTask, PresubmitInfo, TestStatus,
    TestVariantStatus,
};

// ============================================================================
// Control records and task queue
// ============================================================================

/// Control record for one build.
///
/// `task_count = N` means tasks `0..N` have been created. Only ever grows.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct IngestionControl {
    pub build_id: String,
    pub build_project: String,
    pub is_presubmit: bool,
    pub task_count: i64,
    pub created_at: i64,
    pub last_updated: i64,
}

/// What `schedule_continuation` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationOutcome {
    /// The next task was enqueued and the control record advanced.
    Scheduled { task_index: u32 },
    /// An earlier attempt of the same task already scheduled it.
    AlreadyScheduled { task_count: i64 },
}

/// Status of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Some(Self::Queued),
            "RUNNING" => Some(Self::Running),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A row of the task queue.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: i64,
    pub build_id: String,
    pub task_index: i64,
    /// JSON-encoded [`IngestionTask`]; decoding can fail for bad payloads.
    pub payload: String,
    pub status: TaskStatus,
    pub retry_count: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
}

impl QueuedTask {
    pub fn decode(&self) -> std::result::Result<IngestionTask, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

// ============================================================================
// Results
// ============================================================================

/// Variant definition of a test, per sub-realm. Upserted once per page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVariantRealm {
    pub project: String,
    pub test_id: String,
    pub variant_hash: String,
    pub sub_realm: String,
    pub variant: BTreeMap<String, String>,
    pub last_ingestion_time: DateTime<Utc>,
}

/// One stored test result.
///
/// Keyed by (project, test_id, variant_hash, invocation_id, run_index,
/// result_index). Re-ingesting a page must produce the same rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestResultRow {
    pub project: String,
    pub test_id: String,
    pub variant_hash: String,
    pub invocation_id: String,
    pub run_index: i64,
    pub result_index: i64,
    pub partition_time: DateTime<Utc>,
    pub sub_realm: String,
    pub is_unexpected: bool,
    pub status: TestStatus,
    pub run_duration_micros: Option<i64>,
    pub exoneration_reasons: Vec<ExonerationReason>,
    pub build_status: BuildStatus,
    pub presubmit: Option<PresubmitInfo>,
    pub git_reference_hash: Option<String>,
    pub commit_position: i64,
    pub changelists: Vec<Changelist>,
}

impl TestResultRow {
    pub fn key(&self) -> (&str, &str, &str, &str, i64, i64) {
        (
            &self.project,
            &self.test_id,
            &self.variant_hash,
            &self.invocation_id,
            self.run_index,
            self.result_index,
        )
    }
}

/// Aggregate over the not-expected appearances of a test variant in a realm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedTestVariant {
    pub realm: String,
    pub test_id: String,
    pub variant_hash: String,
    pub variant: BTreeMap<String, String>,
    /// Status at the latest partition time seen.
    pub status: TestVariantStatus,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_invocation_id: String,
}

/// A page of failures waiting for the clustering consumer.
#[derive(Debug, Clone)]
pub struct ClusteringOutboxEntry {
    pub project: String,
    pub invocation_id: String,
    pub task_index: i64,
    pub options: weetbix_protocol::ClusteringOptions,
    pub variants: Vec<weetbix_protocol::TestVariant>,
}

//! Requests handed to downstream consumers of ingested results.

use crate::build::BuilderId;
use crate::ingested::{BuildStatus, Changelist};
use crate::task::PresubmitRun;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-build context passed with each page of failures to the clustering
/// sink. The sink treats (options, variants) as idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusteringOptions {
    /// Page of the build these failures came from.
    pub task_index: u32,
    pub project: String,
    pub partition_time: DateTime<Utc>,
    pub realm: String,
    pub invocation_id: String,
    pub build_status: BuildStatus,
    pub build_critical: bool,
    #[serde(default)]
    pub changelists: Vec<Changelist>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_run: Option<PresubmitRun>,
}

/// Follow-up collection of an invocation's results, scheduled once per
/// build after its final page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultCollectionRequest {
    pub invocation_id: String,
    pub resultdb_host: String,
    pub builder: BuilderId,
    pub is_presubmit: bool,
    /// Whether the run fed a CL submission decision.
    pub contributed_to_submission: bool,
}

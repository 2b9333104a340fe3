//! Ingestion task payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Key of the control record for a build: `"<host>/<id>"`.
pub fn build_key(host: &str, id: i64) -> String {
    format!("{}/{}", host, id)
}

/// Build identity carried by every task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRef {
    /// Build service host, e.g. `cr-buildbucket.appspot.com`.
    pub host: String,
    #[serde(with = "crate::serde_util::int64_string")]
    pub id: i64,
    /// LUCI project the build belongs to.
    pub project: String,
}

impl BuildRef {
    pub fn key(&self) -> String {
        build_key(&self.host, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresubmitRunId {
    /// System that ran the presubmit, e.g. `luci-cv`.
    pub system: String,
    pub id: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresubmitRunMode {
    #[default]
    #[serde(rename = "PRESUBMIT_RUN_MODE_UNSPECIFIED")]
    Unspecified,
    FullRun,
    DryRun,
    QuickDryRun,
}

impl PresubmitRunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "PRESUBMIT_RUN_MODE_UNSPECIFIED",
            Self::FullRun => "FULL_RUN",
            Self::DryRun => "DRY_RUN",
            Self::QuickDryRun => "QUICK_DRY_RUN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PRESUBMIT_RUN_MODE_UNSPECIFIED" => Some(Self::Unspecified),
            "FULL_RUN" => Some(Self::FullRun),
            "DRY_RUN" => Some(Self::DryRun),
            "QUICK_DRY_RUN" => Some(Self::QuickDryRun),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresubmitRunStatus {
    #[default]
    #[serde(rename = "PRESUBMIT_RUN_STATUS_UNSPECIFIED")]
    Unspecified,
    Succeeded,
    Failed,
    Canceled,
}

/// Presubmit run that requested the build, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresubmitRun {
    pub presubmit_run_id: PresubmitRunId,
    /// `"user"` or `"automation"`.
    pub owner: String,
    #[serde(default)]
    pub mode: PresubmitRunMode,
    #[serde(default)]
    pub status: PresubmitRunStatus,
}

impl PresubmitRun {
    pub fn is_full_run(&self) -> bool {
        self.mode == PresubmitRunMode::FullRun
    }
}

/// Payload of one ingestion task invocation.
///
/// Task 0 is created by the external trigger with an empty `page_token`.
/// Every continuation carries `task_index + 1` and the next page token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionTask {
    pub build: BuildRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit_run: Option<PresubmitRun>,
    /// Logical event time of the results, used for retention and ordering.
    pub partition_time: DateTime<Utc>,
    #[serde(default)]
    pub page_token: String,
    #[serde(default)]
    pub task_index: u32,
}

impl IngestionTask {
    pub fn is_first(&self) -> bool {
        self.task_index == 0
    }

    /// Continuation of this task for the given page.
    pub fn continuation(&self, next_page_token: &str) -> Self {
        Self {
            page_token: next_page_token.to_string(),
            task_index: self.task_index + 1,
            ..self.clone()
        }
    }
}

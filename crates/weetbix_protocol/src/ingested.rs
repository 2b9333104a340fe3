//! Normalized records produced by ingestion.

use crate::task::PresubmitRunMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Most changelists kept per invocation.
pub const MAXIMUM_CLS: usize = 10;

/// Build outcome as stored alongside ingested results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    #[default]
    Unspecified,
    Success,
    Failure,
    InfraFailure,
    Canceled,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::InfraFailure => "INFRA_FAILURE",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UNSPECIFIED" => Some(Self::Unspecified),
            "SUCCESS" => Some(Self::Success),
            "FAILURE" => Some(Self::Failure),
            "INFRA_FAILURE" => Some(Self::InfraFailure),
            "CANCELED" => Some(Self::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A tested changelist. Field order defines the storage sort order:
/// host, then change, then patchset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changelist {
    /// Gerrit host without the `-review.googlesource.com` suffix.
    pub host: String,
    pub change: i64,
    pub patchset: i64,
}

/// Presubmit details denormalized into every result row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresubmitInfo {
    pub mode: PresubmitRunMode,
    pub owner: String,
    /// Whether the build was critical to the presubmit run.
    pub critical: bool,
}

/// A git branch that results were produced against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitReference {
    pub project: String,
    pub git_reference_hash: String,
    pub hostname: String,
    pub repository: String,
    pub reference: String,
}

/// Per-build result set, written once by task 0 and read by later pages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedInvocation {
    pub project: String,
    pub invocation_id: String,
    pub sub_realm: String,
    pub partition_time: DateTime<Utc>,
    pub build_status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presubmit: Option<PresubmitInfo>,
    /// Set when the invocation is tied to a commit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_reference_hash: Option<String>,
    /// Zero when the invocation is not tied to a commit position.
    #[serde(default)]
    pub commit_position: i64,
    #[serde(default)]
    pub commit_hash: String,
    /// Sorted by (host, change, patchset), at most [`MAXIMUM_CLS`] entries.
    #[serde(default)]
    pub changelists: Vec<Changelist>,
}

impl IngestedInvocation {
    /// Realm string, `<project>:<sub-realm>`.
    pub fn realm(&self) -> String {
        format!("{}:{}", self.project, self.sub_realm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changelist_order() {
        let mut cls = vec![
            Changelist { host: "b".to_string(), change: 1, patchset: 1 },
            Changelist { host: "a".to_string(), change: 2, patchset: 1 },
            Changelist { host: "a".to_string(), change: 1, patchset: 3 },
            Changelist { host: "a".to_string(), change: 1, patchset: 2 },
        ];
        cls.sort();
        let keys: Vec<_> = cls
            .iter()
            .map(|c| (c.host.as_str(), c.change, c.patchset))
            .collect();
        assert_eq!(keys, vec![("a", 1, 2), ("a", 1, 3), ("a", 2, 1), ("b", 1, 1)]);
    }

    #[test]
    fn test_build_status_strings() {
        for status in [
            BuildStatus::Unspecified,
            BuildStatus::Success,
            BuildStatus::Failure,
            BuildStatus::InfraFailure,
            BuildStatus::Canceled,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BuildStatus::parse("bogus"), None);
    }
}

//! Build service types (subset of `buildbucket.v2.Build`).

use serde::{Deserialize, Serialize};

/// Build status as reported by the build service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildbucketStatus {
    #[default]
    StatusUnspecified,
    Scheduled,
    Started,
    EndedMask,
    Success,
    Failure,
    InfraFailure,
    Canceled,
    /// Any value this client does not know about.
    #[serde(other)]
    Unrecognized,
}

/// Tri-state boolean used by the build service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trinary {
    #[default]
    Unset,
    Yes,
    No,
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuilderId {
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub builder: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GerritChange {
    /// Review host, e.g. `chromium-review.googlesource.com`.
    pub host: String,
    #[serde(default)]
    pub project: String,
    #[serde(with = "crate::serde_util::int64_string")]
    pub change: i64,
    #[serde(with = "crate::serde_util::int64_string")]
    pub patchset: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitilesCommit {
    pub host: String,
    /// Repository name.
    pub project: String,
    /// Commit hash.
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "ref")]
    pub reference: String,
    #[serde(default)]
    pub position: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitiles_commit: Option<GitilesCommit>,
    #[serde(default)]
    pub gerrit_changes: Vec<GerritChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gitiles_commit: Option<GitilesCommit>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultDbInfra {
    #[serde(default)]
    pub hostname: String,
    /// Invocation name, `invocations/<id>`. Empty when the build has no
    /// result-source linkage.
    #[serde(default)]
    pub invocation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resultdb: Option<ResultDbInfra>,
}

/// Build metadata restricted to the fields ingestion asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Build {
    #[serde(with = "crate::serde_util::int64_string")]
    pub id: i64,
    #[serde(default)]
    pub builder: BuilderId,
    #[serde(default)]
    pub status: BuildbucketStatus,
    #[serde(default)]
    pub input: BuildInput,
    #[serde(default)]
    pub output: BuildOutput,
    #[serde(default)]
    pub infra: BuildInfra,
    /// Ancestors from the root down to the immediate parent.
    #[serde(default, with = "crate::serde_util::int64_string_vec")]
    pub ancestor_ids: Vec<i64>,
    #[serde(default)]
    pub critical: Trinary,
}

impl Build {
    /// Result-source linkage, when the build has one.
    pub fn resultdb(&self) -> Option<&ResultDbInfra> {
        self.infra
            .resultdb
            .as_ref()
            .filter(|rdb| !rdb.invocation.is_empty())
    }

    pub fn has_invocation(&self) -> bool {
        self.resultdb().is_some()
    }

    /// Immediate parent build, if any.
    pub fn parent_id(&self) -> Option<i64> {
        self.ancestor_ids.last().copied()
    }

    /// Builds are critical unless explicitly marked otherwise.
    pub fn is_critical(&self) -> bool {
        self.critical != Trinary::No
    }

    /// Output commit wins over the input commit.
    pub fn effective_commit(&self) -> Option<&GitilesCommit> {
        self.output
            .gitiles_commit
            .as_ref()
            .or(self.input.gitiles_commit.as_ref())
    }
}

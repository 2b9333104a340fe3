//! Extraction of the per-build ingestion context.
//!
//! Pure functions over the task, the build and its invocation. Running the
//! extractor twice on the same inputs gives the same records.

use crate::error::ExtractError;
use weetbix_protocol::resultdb::REALM_SEPARATOR;
use weetbix_protocol::{
    git_reference_hash, Build, BuildStatus, BuildbucketStatus, Changelist, GerritChange,
    GitReference, IngestedInvocation, IngestionTask, Invocation, PresubmitInfo, MAXIMUM_CLS,
};

/// Suffix stripped from gerrit hosts before storing changelists.
const GERRIT_HOST_SUFFIX: &str = "-review.googlesource.com";

/// Records produced from a build's first task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedContext {
    pub invocation: IngestedInvocation,
    /// Present when the build is tied to a commit.
    pub git_reference: Option<GitReference>,
}

pub fn extract(
    task: &IngestionTask,
    build: &Build,
    invocation: &Invocation,
) -> Result<ExtractedContext, ExtractError> {
    let (project, sub_realm) = split_realm(&invocation.realm)?;
    if project != task.build.project {
        return Err(ExtractError::ProjectMismatch {
            expected: task.build.project.clone(),
            actual: project.to_string(),
        });
    }

    let build_status = build_status(build.status)?;

    let presubmit = task.presubmit_run.as_ref().map(|run| PresubmitInfo {
        mode: run.mode,
        owner: run.owner.clone(),
        critical: build.is_critical(),
    });

    let mut ingested = IngestedInvocation {
        project: project.to_string(),
        invocation_id: invocation.id().to_string(),
        sub_realm: sub_realm.to_string(),
        partition_time: task.partition_time,
        build_status,
        presubmit,
        git_reference_hash: None,
        commit_position: 0,
        commit_hash: String::new(),
        changelists: changelists(&build.input.gerrit_changes),
    };

    let git_reference = build.effective_commit().map(|commit| {
        let hash = git_reference_hash(&commit.host, &commit.project, &commit.reference);
        ingested.git_reference_hash = Some(hash.clone());
        ingested.commit_position = i64::from(commit.position);
        ingested.commit_hash = commit.id.to_lowercase();
        GitReference {
            project: project.to_string(),
            git_reference_hash: hash,
            hostname: commit.host.clone(),
            repository: commit.project.clone(),
            reference: commit.reference.clone(),
        }
    });

    Ok(ExtractedContext {
        invocation: ingested,
        git_reference,
    })
}

/// Split `<project>:<sub-realm>`.
pub fn split_realm(realm: &str) -> Result<(&str, &str), ExtractError> {
    match realm.split_once(REALM_SEPARATOR) {
        Some((project, sub_realm)) if !project.is_empty() && !sub_realm.is_empty() => {
            Ok((project, sub_realm))
        }
        _ => Err(ExtractError::InvalidRealm(realm.to_string())),
    }
}

pub fn build_status(status: BuildbucketStatus) -> Result<BuildStatus, ExtractError> {
    match status {
        BuildbucketStatus::Success => Ok(BuildStatus::Success),
        BuildbucketStatus::Failure => Ok(BuildStatus::Failure),
        BuildbucketStatus::InfraFailure => Ok(BuildStatus::InfraFailure),
        BuildbucketStatus::Canceled => Ok(BuildStatus::Canceled),
        other => Err(ExtractError::UnsupportedBuildStatus(format!("{:?}", other))),
    }
}

/// Tested changelists, sorted then capped at [`MAXIMUM_CLS`].
pub fn changelists(changes: &[GerritChange]) -> Vec<Changelist> {
    let mut cls: Vec<Changelist> = changes
        .iter()
        .map(|change| Changelist {
            host: change
                .host
                .strip_suffix(GERRIT_HOST_SUFFIX)
                .unwrap_or(&change.host)
                .to_string(),
            change: change.change,
            patchset: change.patchset,
        })
        .collect();
    cls.sort();
    cls.truncate(MAXIMUM_CLS);
    cls
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build_with_invocation, invocation_for, sample_task};
    use weetbix_protocol::{
        GitilesCommit, PresubmitRun, PresubmitRunId, PresubmitRunMode, PresubmitRunStatus, Trinary,
    };

    fn change(host: &str, change: i64, patchset: i64) -> GerritChange {
        GerritChange {
            host: host.to_string(),
            project: "chromium/src".to_string(),
            change,
            patchset,
        }
    }

    #[test]
    fn test_extract_ci_build() {
        let task = sample_task(1, "chromium");
        let mut build = build_with_invocation(1, "chromium");
        build.input.gitiles_commit = Some(GitilesCommit {
            host: "chromium.googlesource.com".to_string(),
            project: "chromium/src".to_string(),
            id: "ABCDEF0123".to_string(),
            reference: "refs/heads/main".to_string(),
            position: 111888,
        });
        let invocation = invocation_for(&build, "chromium:ci");

        let ctx = extract(&task, &build, &invocation).unwrap();
        let inv = &ctx.invocation;
        assert_eq!(inv.project, "chromium");
        assert_eq!(inv.sub_realm, "ci");
        assert_eq!(inv.invocation_id, "build-1");
        assert_eq!(inv.build_status, BuildStatus::Failure);
        assert_eq!(inv.partition_time, task.partition_time);
        assert_eq!(inv.commit_position, 111888);
        assert_eq!(inv.commit_hash, "abcdef0123");
        assert!(inv.presubmit.is_none());

        let git_ref = ctx.git_reference.unwrap();
        assert_eq!(
            git_ref.git_reference_hash,
            git_reference_hash("chromium.googlesource.com", "chromium/src", "refs/heads/main")
        );
        assert_eq!(inv.git_reference_hash.as_deref(), Some(git_ref.git_reference_hash.as_str()));
    }

    #[test]
    fn test_output_commit_wins() {
        let task = sample_task(1, "chromium");
        let mut build = build_with_invocation(1, "chromium");
        let commit = |position| GitilesCommit {
            host: "chromium.googlesource.com".to_string(),
            project: "chromium/src".to_string(),
            id: "abc".to_string(),
            reference: "refs/heads/main".to_string(),
            position,
        };
        build.input.gitiles_commit = Some(commit(1));
        build.output.gitiles_commit = Some(commit(2));

        let ctx = extract(&task, &build, &invocation_for(&build, "chromium:ci")).unwrap();
        assert_eq!(ctx.invocation.commit_position, 2);
    }

    #[test]
    fn test_no_commit() {
        let task = sample_task(1, "chromium");
        let build = build_with_invocation(1, "chromium");
        let ctx = extract(&task, &build, &invocation_for(&build, "chromium:ci")).unwrap();
        assert!(ctx.git_reference.is_none());
        assert_eq!(ctx.invocation.commit_position, 0);
        assert!(ctx.invocation.git_reference_hash.is_none());
    }

    #[test]
    fn test_presubmit_info() {
        let mut task = sample_task(1, "chromium");
        task.presubmit_run = Some(PresubmitRun {
            presubmit_run_id: PresubmitRunId {
                system: "luci-cv".to_string(),
                id: "chromium/123".to_string(),
            },
            owner: "user".to_string(),
            mode: PresubmitRunMode::FullRun,
            status: PresubmitRunStatus::Succeeded,
        });
        let mut build = build_with_invocation(1, "chromium");
        build.critical = Trinary::No;

        let ctx = extract(&task, &build, &invocation_for(&build, "chromium:try")).unwrap();
        let presubmit = ctx.invocation.presubmit.unwrap();
        assert_eq!(presubmit.mode, PresubmitRunMode::FullRun);
        assert_eq!(presubmit.owner, "user");
        assert!(!presubmit.critical);
    }

    #[test]
    fn test_realm_errors() {
        let task = sample_task(1, "chromium");
        let build = build_with_invocation(1, "chromium");

        for realm in ["chromium", ":ci", "chromium:", ""] {
            assert_eq!(
                extract(&task, &build, &invocation_for(&build, realm)),
                Err(ExtractError::InvalidRealm(realm.to_string()))
            );
        }

        assert!(matches!(
            extract(&task, &build, &invocation_for(&build, "v8:ci")),
            Err(ExtractError::ProjectMismatch { .. })
        ));
    }

    #[test]
    fn test_unsupported_status() {
        let task = sample_task(1, "chromium");
        let mut build = build_with_invocation(1, "chromium");
        build.status = BuildbucketStatus::Started;
        assert!(matches!(
            extract(&task, &build, &invocation_for(&build, "chromium:ci")),
            Err(ExtractError::UnsupportedBuildStatus(_))
        ));
    }

    #[test]
    fn test_changelists_sorted_then_truncated() {
        let mut changes: Vec<GerritChange> = (0..12)
            .rev()
            .map(|i| change("chromium-review.googlesource.com", 100 + i, 1))
            .collect();
        changes.push(change("aaa-review.googlesource.com", 999, 3));
        changes.push(change("custom.example.com", 1, 1));

        let cls = changelists(&changes);
        assert_eq!(cls.len(), MAXIMUM_CLS);
        assert_eq!(cls[0].host, "aaa");
        assert_eq!(cls[1].host, "chromium");
        assert_eq!(cls[1].change, 100);
        assert_eq!(cls[9].change, 108);
        // Host order puts the unsuffixed host after "chromium".
        assert!(cls.iter().all(|cl| cl.host != "custom.example.com"));

        // Same input in any order gives the same output.
        let mut shuffled = changes.clone();
        shuffled.reverse();
        assert_eq!(changelists(&shuffled), cls);
    }
}

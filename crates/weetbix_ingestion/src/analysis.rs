//! Test variant analysis: which pages qualify, and the rows they produce.

use crate::config::RealmConfig;
use weetbix_db::AnalyzedTestVariant;
use weetbix_protocol::{
    IngestedInvocation, IngestionTask, PresubmitRunStatus, TestVariant, TestVariantStatus,
};

/// Decides whether a task's results feed test variant analysis.
pub trait AnalysisPolicy: Send + Sync {
    /// `realm` is `None` when the realm has no configuration.
    fn qualifies(&self, realm: Option<&RealmConfig>, task: &IngestionTask) -> bool;
}

/// Analysis runs for realms that opt in. Presubmit results count only from
/// full runs that succeeded, so dry runs and rejected CLs are left out.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAnalysisPolicy;

impl AnalysisPolicy for DefaultAnalysisPolicy {
    fn qualifies(&self, realm: Option<&RealmConfig>, task: &IngestionTask) -> bool {
        if !realm.is_some_and(|r| r.test_variant_analysis) {
            return false;
        }
        match &task.presubmit_run {
            None => true,
            Some(run) => run.is_full_run() && run.status == PresubmitRunStatus::Succeeded,
        }
    }
}

/// Whether the run fed a CL submission decision.
pub fn contributed_to_submission(task: &IngestionTask, inv: &IngestedInvocation) -> bool {
    let Some(run) = &task.presubmit_run else {
        return false;
    };
    let critical = inv.presubmit.as_ref().is_some_and(|p| p.critical);
    run.is_full_run() && run.status == PresubmitRunStatus::Succeeded && critical
}

/// Analysis rows for every variant on the page that was not expected.
pub fn analyzed_variants(inv: &IngestedInvocation, variants: &[TestVariant]) -> Vec<AnalyzedTestVariant> {
    let realm = inv.realm();
    variants
        .iter()
        .filter(|tv| tv.status != TestVariantStatus::Expected)
        .map(|tv| AnalyzedTestVariant {
            realm: realm.clone(),
            test_id: tv.test_id.clone(),
            variant_hash: tv.effective_variant_hash(),
            variant: tv.variant.def.clone(),
            status: tv.status,
            first_seen: inv.partition_time,
            last_seen: inv.partition_time,
            last_invocation_id: inv.invocation_id.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{presubmit_run, sample_invocation, sample_task, test_variant};
    use weetbix_protocol::{PresubmitInfo, PresubmitRunMode};

    fn realm(enabled: bool) -> RealmConfig {
        RealmConfig {
            name: "ci".to_string(),
            test_variant_analysis: enabled,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = DefaultAnalysisPolicy;
        let ci = sample_task(1, "chromium");
        assert!(policy.qualifies(Some(&realm(true)), &ci));
        assert!(!policy.qualifies(Some(&realm(false)), &ci));
        assert!(!policy.qualifies(None, &ci));

        let mut full = sample_task(1, "chromium");
        full.presubmit_run = Some(presubmit_run(
            PresubmitRunMode::FullRun,
            PresubmitRunStatus::Succeeded,
        ));
        assert!(policy.qualifies(Some(&realm(true)), &full));

        let mut failed = full.clone();
        failed.presubmit_run = Some(presubmit_run(
            PresubmitRunMode::FullRun,
            PresubmitRunStatus::Failed,
        ));
        assert!(!policy.qualifies(Some(&realm(true)), &failed));

        let mut dry = full.clone();
        dry.presubmit_run = Some(presubmit_run(
            PresubmitRunMode::DryRun,
            PresubmitRunStatus::Succeeded,
        ));
        assert!(!policy.qualifies(Some(&realm(true)), &dry));
    }

    #[test]
    fn test_contributed_to_submission() {
        let mut task = sample_task(1, "chromium");
        let mut inv = sample_invocation();
        assert!(!contributed_to_submission(&task, &inv));

        task.presubmit_run = Some(presubmit_run(
            PresubmitRunMode::FullRun,
            PresubmitRunStatus::Succeeded,
        ));
        inv.presubmit = Some(PresubmitInfo {
            mode: PresubmitRunMode::FullRun,
            owner: "user".to_string(),
            critical: true,
        });
        assert!(contributed_to_submission(&task, &inv));

        inv.presubmit.as_mut().unwrap().critical = false;
        assert!(!contributed_to_submission(&task, &inv));
    }

    #[test]
    fn test_expected_variants_skipped() {
        let inv = sample_invocation();
        let mut expected = test_variant("t1", Vec::new());
        expected.status = TestVariantStatus::Expected;
        let mut flaky = test_variant("t2", Vec::new());
        flaky.status = TestVariantStatus::Flaky;

        let rows = analyzed_variants(&inv, &[expected, flaky]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].test_id, "t2");
        assert_eq!(rows[0].realm, inv.realm());
        assert_eq!(rows[0].first_seen, inv.partition_time);
    }
}

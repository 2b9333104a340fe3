//! Hand-off of a written page to downstream consumers.

use crate::analysis::{analyzed_variants, contributed_to_submission, AnalysisPolicy};
use crate::clients::{ClusteringSink, ConfigProvider, ResultCollector};
use crate::error::{ConfigError, FanoutError};
use std::sync::Arc;
use tracing::{debug, info};
use weetbix_db::WeetbixDb;
use weetbix_protocol::{
    Build, ClusteringOptions, IngestedInvocation, IngestionTask, ResultCollectionRequest,
    TestVariant,
};

/// One page, after it has been written.
#[derive(Debug, Clone, Copy)]
pub struct FanoutInput<'a> {
    pub task: &'a IngestionTask,
    pub build: &'a Build,
    pub invocation: &'a IngestedInvocation,
    pub variants: &'a [TestVariant],
    pub is_final_page: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Variants sent to clustering; `None` when clustering was skipped.
    pub clustered: Option<usize>,
    /// Analysis rows written; `None` when the page did not qualify.
    pub analyzed: Option<usize>,
    pub collection_scheduled: bool,
}

pub struct Fanout {
    db: WeetbixDb,
    configs: Arc<dyn ConfigProvider>,
    clustering: Arc<dyn ClusteringSink>,
    collector: Arc<dyn ResultCollector>,
    policy: Arc<dyn AnalysisPolicy>,
}

impl Fanout {
    pub fn new(
        db: WeetbixDb,
        configs: Arc<dyn ConfigProvider>,
        clustering: Arc<dyn ClusteringSink>,
        collector: Arc<dyn ResultCollector>,
        policy: Arc<dyn AnalysisPolicy>,
    ) -> Self {
        Self {
            db,
            configs,
            clustering,
            collector,
            policy,
        }
    }

    pub async fn run(&self, input: FanoutInput<'_>) -> Result<FanoutReport, FanoutError> {
        let mut report = FanoutReport::default();
        let task = input.task;
        let inv = input.invocation;

        // Dry runs are not clustered.
        let skip_clustering = task.presubmit_run.as_ref().is_some_and(|run| !run.is_full_run());
        if !skip_clustering {
            let failures: Vec<TestVariant> = input
                .variants
                .iter()
                .filter(|tv| tv.has_unexpected_failures())
                .cloned()
                .collect();
            let options = clustering_options(input);
            self.clustering
                .ingest(&options, &failures)
                .await
                .map_err(FanoutError::Clustering)?;
            report.clustered = Some(failures.len());
        }

        let realm = match self.configs.realm_config(&inv.realm()).await {
            Ok(realm) => Some(realm),
            Err(ConfigError::NotExists(_)) => None,
            Err(err) => return Err(err.into()),
        };
        if !self.policy.qualifies(realm.as_ref(), task) {
            debug!(realm = %inv.realm(), "Page does not qualify for analysis");
            return Ok(report);
        }

        let rows = analyzed_variants(inv, input.variants);
        for chunk in rows.chunks(self.db.max_rows_per_commit()) {
            self.db.upsert_analyzed_test_variants(chunk).await?;
        }
        report.analyzed = Some(rows.len());

        if input.is_final_page {
            if let Some(rdb) = input.build.resultdb() {
                let request = ResultCollectionRequest {
                    invocation_id: inv.invocation_id.clone(),
                    resultdb_host: rdb.hostname.clone(),
                    builder: input.build.builder.clone(),
                    is_presubmit: task.presubmit_run.is_some(),
                    contributed_to_submission: contributed_to_submission(task, inv),
                };
                self.collector
                    .schedule(&request)
                    .await
                    .map_err(FanoutError::ResultCollection)?;
                report.collection_scheduled = true;
                info!(invocation_id = %inv.invocation_id, "Result collection requested");
            }
        }

        Ok(report)
    }
}

pub fn clustering_options(input: FanoutInput<'_>) -> ClusteringOptions {
    let inv = input.invocation;
    ClusteringOptions {
        task_index: input.task.task_index,
        project: inv.project.clone(),
        partition_time: inv.partition_time,
        realm: inv.realm(),
        invocation_id: inv.invocation_id.clone(),
        build_status: inv.build_status,
        build_critical: input.build.is_critical(),
        changelists: inv.changelists.clone(),
        presubmit_run: input.task.presubmit_run.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::DefaultAnalysisPolicy;
    use crate::config::{ProjectConfig, RealmConfig, StaticConfigProvider};
    use crate::test_utils::{
        build_with_invocation, failing_variant, passing_variant, presubmit_run, sample_invocation,
        sample_task, RecordingClusteringSink, RecordingResultCollector,
    };
    use weetbix_protocol::{PresubmitRunMode, PresubmitRunStatus};

    struct Harness {
        db: WeetbixDb,
        clustering: Arc<RecordingClusteringSink>,
        collector: Arc<RecordingResultCollector>,
        fanout: Fanout,
    }

    async fn harness(analysis: bool) -> Harness {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let configs = Arc::new(StaticConfigProvider::new([ProjectConfig {
            name: "chromium".to_string(),
            realms: vec![RealmConfig {
                name: "ci".to_string(),
                test_variant_analysis: analysis,
            }],
        }]));
        let clustering = Arc::new(RecordingClusteringSink::new());
        let collector = Arc::new(RecordingResultCollector::new());
        let fanout = Fanout::new(
            db.clone(),
            configs,
            clustering.clone(),
            collector.clone(),
            Arc::new(DefaultAnalysisPolicy),
        );
        Harness {
            db,
            clustering,
            collector,
            fanout,
        }
    }

    #[tokio::test]
    async fn test_failures_go_to_clustering() {
        let h = harness(false).await;
        let task = sample_task(1, "chromium");
        let build = build_with_invocation(1, "chromium");
        let inv = sample_invocation();
        let variants = vec![passing_variant("t1"), failing_variant("t2")];

        let report = h
            .fanout
            .run(FanoutInput {
                task: &task,
                build: &build,
                invocation: &inv,
                variants: &variants,
                is_final_page: true,
            })
            .await
            .unwrap();

        assert_eq!(report.clustered, Some(1));
        assert_eq!(report.analyzed, None);
        assert!(!report.collection_scheduled);

        let calls = h.clustering.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0.realm, "chromium:ci");
        assert_eq!(calls[0].1[0].test_id, "t2");
        assert!(h.collector.requests().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_not_clustered() {
        let h = harness(false).await;
        let mut task = sample_task(1, "chromium");
        task.presubmit_run = Some(presubmit_run(
            PresubmitRunMode::DryRun,
            PresubmitRunStatus::Succeeded,
        ));
        let build = build_with_invocation(1, "chromium");
        let inv = sample_invocation();
        let variants = vec![failing_variant("t1")];

        let report = h
            .fanout
            .run(FanoutInput {
                task: &task,
                build: &build,
                invocation: &inv,
                variants: &variants,
                is_final_page: true,
            })
            .await
            .unwrap();
        assert_eq!(report.clustered, None);
        assert!(h.clustering.calls().is_empty());
    }

    #[tokio::test]
    async fn test_analysis_and_collection_on_final_page() {
        let h = harness(true).await;
        let task = sample_task(1, "chromium");
        let build = build_with_invocation(1, "chromium");
        let inv = sample_invocation();
        let variants = vec![failing_variant("t1")];

        let input = FanoutInput {
            task: &task,
            build: &build,
            invocation: &inv,
            variants: &variants,
            is_final_page: false,
        };
        let report = h.fanout.run(input).await.unwrap();
        assert_eq!(report.analyzed, Some(1));
        assert!(!report.collection_scheduled);

        let report = h
            .fanout
            .run(FanoutInput {
                is_final_page: true,
                ..input
            })
            .await
            .unwrap();
        assert!(report.collection_scheduled);

        let requests = h.collector.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].invocation_id, inv.invocation_id);
        assert!(!requests[0].is_presubmit);
        assert!(!requests[0].contributed_to_submission);

        let analyzed = h.db.read_analyzed_test_variants("chromium:ci").await.unwrap();
        assert_eq!(analyzed.len(), 1);
    }

    #[tokio::test]
    async fn test_clustering_failure_propagates() {
        let h = harness(false).await;
        h.clustering.fail_next();
        let task = sample_task(1, "chromium");
        let build = build_with_invocation(1, "chromium");
        let inv = sample_invocation();

        let result = h
            .fanout
            .run(FanoutInput {
                task: &task,
                build: &build,
                invocation: &inv,
                variants: &[],
                is_final_page: true,
            })
            .await;
        assert!(matches!(result, Err(FanoutError::Clustering(_))));
    }
}

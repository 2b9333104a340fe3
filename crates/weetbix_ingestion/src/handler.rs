//! The ingestion task handler.
//!
//! One call ingests one page of one build. The first task of a build does
//! the one-time work (ancestor check, context extraction); every task with a
//! next page token schedules its successor before writing its own page.
//!
//! Every side effect here can be repeated: the queue redelivers the same
//! payload after a transient failure and the handler must converge on the
//! same stored state.

use crate::analysis::{AnalysisPolicy, DefaultAnalysisPolicy};
use crate::clients::{BuildClient, ClusteringSink, ConfigProvider, ResultCollector, ResultSourceClient};
use crate::config::IngestionSettings;
use crate::context::extract;
use crate::error::{ConfigError, TaskError, ValidationError, WriteError};
use crate::fanout::{Fanout, FanoutInput, FanoutReport};
use crate::limiter::TaskLimiter;
use crate::metrics::{IngestionMetrics, TaskOutcome};
use crate::resolver::{check_ancestor, resolve_build};
use crate::writer::{write_page, ResultStore, WriteSummary, WriterConfig};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use weetbix_db::{ContinuationOutcome, WeetbixDb};
use weetbix_protocol::defaults::{
    DEFAULT_PAGE_SIZE, PARTITION_TIME_MAX_AGE_DAYS, PARTITION_TIME_MAX_FUTURE_HOURS,
};
use weetbix_protocol::{IngestedInvocation, IngestionTask, QueryTestVariantsRequest, TestVariant};

/// Fields requested for each test variant.
pub const TEST_VARIANT_READ_MASK: &str = "testId,variantHash,status,variant,\
exonerations.*.reason,\
results.*.result.name,results.*.result.resultId,results.*.result.expected,\
results.*.result.status,results.*.result.startTime,results.*.result.duration";

/// Reject tasks that cannot be ingested however often they are retried.
pub fn validate_task(task: &IngestionTask, now: DateTime<Utc>) -> Result<(), ValidationError> {
    if task.build.project.is_empty() {
        return Err(ValidationError::MissingProject);
    }
    if task.partition_time < now - Duration::days(PARTITION_TIME_MAX_AGE_DAYS) {
        return Err(ValidationError::PartitionTimeTooOld(task.partition_time.to_rfc3339()));
    }
    if task.partition_time > now + Duration::hours(PARTITION_TIME_MAX_FUTURE_HOURS) {
        return Err(ValidationError::PartitionTimeInFuture(task.partition_time.to_rfc3339()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    pub page_size: u32,
    pub writer: WriterConfig,
}

impl Default for HandlerSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            writer: WriterConfig::default(),
        }
    }
}

impl From<&IngestionSettings> for HandlerSettings {
    fn from(settings: &IngestionSettings) -> Self {
        Self {
            page_size: settings.page_size,
            writer: WriterConfig {
                workers: settings.writer_workers,
                batch_result_threshold: settings.batch_result_threshold,
            },
        }
    }
}

/// External services the handler reads from and writes to.
#[derive(Clone)]
pub struct Collaborators {
    pub builds: Arc<dyn BuildClient>,
    pub results: Arc<dyn ResultSourceClient>,
    pub configs: Arc<dyn ConfigProvider>,
    pub clustering: Arc<dyn ClusteringSink>,
    pub collector: Arc<dyn ResultCollector>,
}

/// What a successful call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskReport {
    /// Set on skips and on the final page.
    pub outcome: Option<TaskOutcome>,
    pub continuation: Option<ContinuationOutcome>,
    pub written: WriteSummary,
    pub fanout: FanoutReport,
}

impl TaskReport {
    fn skipped(outcome: TaskOutcome) -> Self {
        Self {
            outcome: Some(outcome),
            ..Self::default()
        }
    }
}

pub struct IngestionHandler {
    db: WeetbixDb,
    builds: Arc<dyn BuildClient>,
    results: Arc<dyn ResultSourceClient>,
    configs: Arc<dyn ConfigProvider>,
    store: Arc<dyn ResultStore>,
    fanout: Fanout,
    limiter: TaskLimiter,
    metrics: Arc<IngestionMetrics>,
    settings: HandlerSettings,
}

impl IngestionHandler {
    pub fn new(db: WeetbixDb, collaborators: Collaborators, settings: HandlerSettings) -> Self {
        Self::with_policy(db, collaborators, settings, Arc::new(DefaultAnalysisPolicy))
    }

    pub fn with_policy(
        db: WeetbixDb,
        collaborators: Collaborators,
        settings: HandlerSettings,
        policy: Arc<dyn AnalysisPolicy>,
    ) -> Self {
        let fanout = Fanout::new(
            db.clone(),
            Arc::clone(&collaborators.configs),
            collaborators.clustering,
            collaborators.collector,
            policy,
        );
        Self {
            store: Arc::new(db.clone()),
            db,
            builds: collaborators.builds,
            results: collaborators.results,
            configs: collaborators.configs,
            fanout,
            limiter: TaskLimiter::default(),
            metrics: Arc::new(IngestionMetrics::new()),
            settings,
        }
    }

    /// Commit pages somewhere other than the database (tests).
    pub fn with_result_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_limiter(mut self, limiter: TaskLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<IngestionMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn db(&self) -> &WeetbixDb {
        &self.db
    }

    pub fn limiter(&self) -> &TaskLimiter {
        &self.limiter
    }

    pub fn metrics(&self) -> &Arc<IngestionMetrics> {
        &self.metrics
    }

    /// Handle one task.
    ///
    /// Skips return `Ok` with their outcome. Errors say whether the queue
    /// should redeliver the task.
    pub async fn handle(&self, task: &IngestionTask) -> Result<TaskReport, TaskError> {
        if let Err(err) = validate_task(task, Utc::now()) {
            self.metrics.record_task(TaskOutcome::FailedValidation);
            error!(
                build_id = %task.build.key(),
                task_index = task.task_index,
                outcome = %TaskOutcome::FailedValidation,
                error = %err,
                "Rejected ingestion task"
            );
            return Err(TaskError::permanent(err.to_string()));
        }

        let _permit = self.limiter.acquire().await?;
        let result = self.ingest(task).await;

        if let Err(err) = &result {
            if err.is_transient() {
                warn!(build_id = %task.build.key(), task_index = task.task_index, error = %err, "Ingestion task will be retried");
            } else {
                error!(build_id = %task.build.key(), task_index = task.task_index, error = %err, "Ingestion task failed");
            }
        }
        result
    }

    fn skip(&self, task: &IngestionTask, outcome: TaskOutcome, reason: &str) -> TaskReport {
        self.metrics.record_task(outcome);
        info!(
            build_id = %task.build.key(),
            task_index = task.task_index,
            outcome = %outcome,
            reason,
            "Skipping build"
        );
        TaskReport::skipped(outcome)
    }

    async fn ingest(&self, task: &IngestionTask) -> Result<TaskReport, TaskError> {
        let build_id = task.build.key();

        let build = match resolve_build(&*self.builds, &task.build.host, task.build.id).await {
            Ok(build) => build,
            Err(err) if err.is_no_access() => {
                return Ok(self.skip(task, TaskOutcome::IgnoredNoBbAccess, &err.to_string()));
            }
            Err(err) => {
                return Err(TaskError::transient(format!("get build {}: {}", build_id, err)));
            }
        };

        let Some(rdb) = build.resultdb().cloned() else {
            return Ok(self.skip(task, TaskOutcome::IgnoredNoInvocation, "build has no invocation"));
        };

        if task.is_first() {
            let ancestor = check_ancestor(&*self.builds, &task.build.host, &build)
                .await
                .map_err(|err| TaskError::transient(format!("check ancestor of {}: {}", build_id, err)))?;
            if let Some(outcome) = ancestor {
                self.metrics.record_ancestor(outcome);
                if outcome.is_included() {
                    return Ok(self.skip(
                        task,
                        TaskOutcome::IgnoredHasAncestor,
                        "results included in ancestor invocation",
                    ));
                }
            }
        }

        let invocation = match self.results.get_invocation(&rdb.hostname, &rdb.invocation).await {
            Ok(invocation) => invocation,
            Err(err) if err.is_no_access() => {
                return Ok(self.skip(task, TaskOutcome::IgnoredNoResultdbAccess, &err.to_string()));
            }
            Err(err) => {
                return Err(TaskError::transient(format!(
                    "get invocation {}: {}",
                    rdb.invocation, err
                )));
            }
        };

        match self.configs.project_config(&task.build.project).await {
            Ok(_) => {}
            Err(ConfigError::NotExists(msg)) => {
                return Ok(self.skip(task, TaskOutcome::IgnoredNoProjectConfig, &msg));
            }
            Err(err) => {
                return Err(TaskError::transient(format!(
                    "project config {}: {}",
                    task.build.project, err
                )));
            }
        }

        let ingested = if task.is_first() {
            let ctx = extract(task, &build, &invocation)
                .map_err(|err| TaskError::permanent(format!("extract context: {}", err)))?;
            if let Some(git_ref) = &ctx.git_reference {
                self.db.record_git_reference(git_ref).await?;
            }
            self.db.record_ingested_invocation(&ctx.invocation).await?;
            ctx.invocation
        } else {
            self.db
                .read_ingested_invocation(&task.build.project, invocation.id())
                .await?
                .ok_or_else(|| {
                    TaskError::permanent(format!(
                        "ingested invocation {} missing for task {}",
                        invocation.id(),
                        task.task_index
                    ))
                })?
        };

        let request = QueryTestVariantsRequest {
            invocations: vec![rdb.invocation.clone()],
            page_size: self.settings.page_size,
            page_token: task.page_token.clone(),
            read_mask: Some(TEST_VARIANT_READ_MASK.to_string()),
        };
        let page = self
            .results
            .query_test_variants(&rdb.hostname, &request)
            .await
            .map_err(|err| TaskError::transient(format!("query test variants: {}", err)))?;

        let is_final_page = page.next_page_token.is_empty();
        let continuation = if is_final_page {
            None
        } else {
            let outcome = self
                .db
                .schedule_continuation(task, &page.next_page_token)
                .await?;
            if let ContinuationOutcome::Scheduled { .. } = outcome {
                self.metrics.inc_continuations_scheduled();
            }
            Some(outcome)
        };

        let variants: Arc<[TestVariant]> = page.test_variants.into();
        let written = self.write(&ingested, Arc::clone(&variants)).await?;

        let fanout = self
            .fanout
            .run(FanoutInput {
                task,
                build: &build,
                invocation: &ingested,
                variants: &variants,
                is_final_page,
            })
            .await
            .map_err(|err| TaskError::transient(err.to_string()))?;

        let outcome = if is_final_page {
            self.metrics.record_task(TaskOutcome::Success);
            info!(
                build_id = %build_id,
                task_index = task.task_index,
                outcome = %TaskOutcome::Success,
                "Build ingested"
            );
            Some(TaskOutcome::Success)
        } else {
            info!(
                build_id = %build_id,
                task_index = task.task_index,
                results = written.results,
                "Page ingested"
            );
            None
        };

        Ok(TaskReport {
            outcome,
            continuation,
            written,
            fanout,
        })
    }

    async fn write(
        &self,
        ingested: &IngestedInvocation,
        variants: Arc<[TestVariant]>,
    ) -> Result<WriteSummary, TaskError> {
        write_page(Arc::clone(&self.store), ingested, variants, self.settings.writer)
            .await
            .map_err(|err| match &err {
                WriteError::MalformedResultName(_) => TaskError::permanent(err.to_string()),
                WriteError::Commit { source, .. } if !source.is_retryable() => {
                    TaskError::permanent(err.to_string())
                }
                _ => TaskError::transient(err.to_string()),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::sample_task;
    use chrono::TimeZone;

    #[test]
    fn test_validation_window() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        let mut task = sample_task(1, "chromium");

        task.partition_time = now - Duration::days(89);
        assert!(validate_task(&task, now).is_ok());

        task.partition_time = now + Duration::hours(23);
        assert!(validate_task(&task, now).is_ok());

        task.partition_time = now - Duration::days(91);
        assert!(matches!(
            validate_task(&task, now),
            Err(ValidationError::PartitionTimeTooOld(_))
        ));

        task.partition_time = now + Duration::hours(25);
        assert!(matches!(
            validate_task(&task, now),
            Err(ValidationError::PartitionTimeInFuture(_))
        ));

        task.partition_time = now;
        task.build.project.clear();
        assert_eq!(validate_task(&task, now), Err(ValidationError::MissingProject));
    }

    #[test]
    fn test_settings_from_config() {
        let settings = IngestionSettings {
            page_size: 100,
            writer_workers: 2,
            batch_result_threshold: 10,
            ..IngestionSettings::default()
        };
        let handler_settings = HandlerSettings::from(&settings);
        assert_eq!(handler_settings.page_size, 100);
        assert_eq!(handler_settings.writer.workers, 2);
        assert_eq!(handler_settings.writer.batch_result_threshold, 10);
    }
}

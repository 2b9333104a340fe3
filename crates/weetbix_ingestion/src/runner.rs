//! Queue poller that feeds claimed tasks to the [`IngestionHandler`].
//!
//! The runner owns task lifecycle in the queue: a handler success completes
//! the row, a transient error requeues it until retries run out, anything
//! else fails it. Concurrency is bounded by the handler's limiter; the
//! runner only stops claiming when no permit is free.

use crate::config::IngestionSettings;
use crate::handler::IngestionHandler;
use crate::metrics::TaskOutcome;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use weetbix_db::{QueuedTask, WeetbixDb};

/// What happened to a claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    Completed,
    Requeued,
    Failed,
}

pub struct TaskRunner {
    db: WeetbixDb,
    handler: Arc<IngestionHandler>,
    max_retries: u32,
    poll_interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
}

impl TaskRunner {
    /// Create a runner and the sender that stops it.
    pub fn new(
        db: WeetbixDb,
        handler: Arc<IngestionHandler>,
        settings: &IngestionSettings,
    ) -> (Self, mpsc::Sender<()>) {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let runner = Self {
            db,
            handler,
            max_retries: settings.max_task_retries,
            poll_interval: settings.poll_interval(),
            shutdown_rx,
        };
        (runner, shutdown_tx)
    }

    /// Poll until a shutdown signal arrives or every sender is dropped.
    ///
    /// Tasks left RUNNING by a previous process are requeued first. On
    /// shutdown, in-flight tasks are allowed to finish.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.db.requeue_running_tasks().await?;
        info!(
            capacity = self.handler.limiter().capacity(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Task runner started"
        );

        let mut in_flight: JoinSet<TaskDisposition> = JoinSet::new();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Task runner received stop signal");
                    break;
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join(joined);
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.dispatch(&mut in_flight).await {
                        error!(error = %err, "Failed to claim tasks");
                    }
                }
            }
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight tasks");
        }
        while let Some(joined) = in_flight.join_next().await {
            log_join(joined);
        }
        info!("Task runner stopped");
        Ok(())
    }

    /// Process queued tasks one at a time until the queue is empty,
    /// including continuations enqueued along the way. Returns the number
    /// of task attempts made.
    pub async fn run_until_idle(&self) -> anyhow::Result<usize> {
        let mut attempts = 0;
        while let Some(queued) = self.db.pop_task().await? {
            process(&self.db, &self.handler, queued, self.max_retries).await;
            attempts += 1;
        }
        Ok(attempts)
    }

    async fn dispatch(&self, in_flight: &mut JoinSet<TaskDisposition>) -> weetbix_db::Result<()> {
        let limiter = self.handler.limiter();
        while in_flight.len() < limiter.capacity() && limiter.available() > 0 {
            let Some(queued) = self.db.pop_task().await? else {
                break;
            };
            let db = self.db.clone();
            let handler = Arc::clone(&self.handler);
            let max_retries = self.max_retries;
            in_flight.spawn(async move { process(&db, &handler, queued, max_retries).await });
        }
        Ok(())
    }
}

fn log_join(joined: Result<TaskDisposition, JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "Ingestion task panicked");
    }
}

/// Run one claimed task and settle its queue row.
pub async fn process(
    db: &WeetbixDb,
    handler: &IngestionHandler,
    queued: QueuedTask,
    max_retries: u32,
) -> TaskDisposition {
    let metrics = handler.metrics();

    let task = match queued.decode() {
        Ok(task) => task,
        Err(err) => {
            metrics.record_task(TaskOutcome::FailedValidation);
            metrics.inc_tasks_failed();
            let message = format!("undecodable payload: {}", err);
            error!(task_id = queued.id, build_id = %queued.build_id, error = %message, "Rejected ingestion task");
            settle_failed(db, queued.id, &message).await;
            return TaskDisposition::Failed;
        }
    };

    match handler.handle(&task).await {
        Ok(_) => {
            metrics.inc_tasks_completed();
            if let Err(err) = db.complete_task(queued.id).await {
                error!(task_id = queued.id, error = %err, "Failed to complete task");
            }
            TaskDisposition::Completed
        }
        Err(err) if err.is_transient() => {
            match db.requeue_task(queued.id, err.message(), max_retries).await {
                Ok(true) => {
                    metrics.inc_tasks_retried();
                    TaskDisposition::Requeued
                }
                Ok(false) => {
                    metrics.inc_tasks_failed();
                    settle_failed(db, queued.id, err.message()).await;
                    TaskDisposition::Failed
                }
                Err(db_err) => {
                    // Row stays RUNNING; recovered on the next start.
                    warn!(task_id = queued.id, error = %db_err, "Failed to requeue task");
                    TaskDisposition::Requeued
                }
            }
        }
        Err(err) => {
            metrics.inc_tasks_failed();
            settle_failed(db, queued.id, err.message()).await;
            TaskDisposition::Failed
        }
    }
}

async fn settle_failed(db: &WeetbixDb, task_id: i64, message: &str) {
    if let Err(err) = db.fail_task(task_id, message).await {
        error!(task_id, error = %err, "Failed to mark task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProjectConfig, RealmConfig, StaticConfigProvider};
    use crate::handler::{Collaborators, HandlerSettings};
    use crate::test_utils::{
        build_with_invocation, failing_variant, invocation_for, sample_task, FakeBuildClient,
        FakeResultSource, RecordingClusteringSink, RecordingResultCollector,
    };
    use weetbix_db::TaskStatus;

    struct Setup {
        db: WeetbixDb,
        builds: Arc<FakeBuildClient>,
        results: Arc<FakeResultSource>,
        runner: TaskRunner,
    }

    async fn setup(max_retries: u32) -> Setup {
        let db = WeetbixDb::open_in_memory().await.unwrap();
        let builds = Arc::new(FakeBuildClient::new());
        let results = Arc::new(FakeResultSource::new());
        let collaborators = Collaborators {
            builds: builds.clone(),
            results: results.clone(),
            configs: Arc::new(StaticConfigProvider::new([ProjectConfig {
                name: "chromium".to_string(),
                realms: vec![RealmConfig {
                    name: "ci".to_string(),
                    test_variant_analysis: false,
                }],
            }])),
            clustering: Arc::new(RecordingClusteringSink::new()),
            collector: Arc::new(RecordingResultCollector::new()),
        };
        let handler = Arc::new(IngestionHandler::new(
            db.clone(),
            collaborators,
            HandlerSettings::default(),
        ));
        let settings = IngestionSettings {
            max_task_retries: max_retries,
            poll_interval_ms: 10,
            ..IngestionSettings::default()
        };
        let (runner, _stop) = TaskRunner::new(db.clone(), handler, &settings);
        Setup {
            db,
            builds,
            results,
            runner,
        }
    }

    fn seed_build(s: &Setup, id: i64) {
        let build = build_with_invocation(id, "chromium");
        s.results.insert_invocation(invocation_for(&build, "chromium:ci"));
        s.results.add_page(
            &format!("invocations/build-{}", id),
            "",
            vec![failing_variant("t1")],
            "",
        );
        s.builds.insert(build);
    }

    #[tokio::test]
    async fn test_completes_task() {
        let s = setup(3).await;
        seed_build(&s, 1);
        let task = sample_task(1, "chromium");
        s.db.create_ingestion(&task).await.unwrap();

        assert_eq!(s.runner.run_until_idle().await.unwrap(), 1);

        let tasks = s.db.list_tasks(&task.build.key()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        let metrics = s.runner.handler.metrics();
        assert_eq!(metrics.task_count(TaskOutcome::Success), 1);
        assert_eq!(metrics.snapshot().tasks_completed, 1);
    }

    #[tokio::test]
    async fn test_transient_error_retries_then_fails() {
        let s = setup(1).await;
        seed_build(&s, 1);
        let task = sample_task(1, "chromium");
        s.db.create_ingestion(&task).await.unwrap();
        s.results.fail_next_query();

        // First attempt fails transiently, the retry succeeds.
        assert_eq!(s.runner.run_until_idle().await.unwrap(), 2);
        let tasks = s.db.list_tasks(&task.build.key()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        assert_eq!(tasks[0].retry_count, 1);
        assert_eq!(s.runner.handler.metrics().snapshot().tasks_retried, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let s = setup(0).await;
        seed_build(&s, 1);
        let task = sample_task(1, "chromium");
        s.db.create_ingestion(&task).await.unwrap();
        s.results.fail_next_query();

        assert_eq!(s.runner.run_until_idle().await.unwrap(), 1);
        let tasks = s.db.list_tasks(&task.build.key()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert!(tasks[0].error_message.as_deref().unwrap().contains("query test variants"));
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let s = setup(3).await;
        let mut task = sample_task(1, "chromium");
        task.partition_time = chrono::Utc::now() + chrono::Duration::days(2);
        s.db.create_ingestion(&task).await.unwrap();

        assert_eq!(s.runner.run_until_idle().await.unwrap(), 1);
        let tasks = s.db.list_tasks(&task.build.key()).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Failed);
        assert_eq!(s.builds.calls(), 0);
        assert_eq!(
            s.runner.handler.metrics().task_count(TaskOutcome::FailedValidation),
            1
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let s = setup(3).await;
        seed_build(&s, 1);
        let task = sample_task(1, "chromium");
        s.db.create_ingestion(&task).await.unwrap();

        let settings = IngestionSettings {
            poll_interval_ms: 5,
            ..IngestionSettings::default()
        };
        let (runner, stop) = TaskRunner::new(s.db.clone(), Arc::clone(&s.runner.handler), &settings);
        let handle = tokio::spawn(runner.run());

        let key = task.build.key();
        for _ in 0..200 {
            let tasks = s.db.list_tasks(&key).await.unwrap();
            if tasks[0].status == TaskStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        stop.send(()).await.unwrap();
        handle.await.unwrap().unwrap();

        let tasks = s.db.list_tasks(&key).await.unwrap();
        assert_eq!(tasks[0].status, TaskStatus::Completed);
    }
}

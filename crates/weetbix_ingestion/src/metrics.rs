//! Outcome counters for ingestion tasks.
//!
//! One [`IngestionMetrics`] is created per process and shared by the
//! handler and the runner. Rendering follows the Prometheus text format;
//! exporting it is left to the embedding process.

use crate::resolver::AncestorOutcome;
use std::sync::atomic::{AtomicU64, Ordering};

/// Terminal outcome of a task, counted once per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskOutcome {
    Success,
    FailedValidation,
    IgnoredNoBbAccess,
    IgnoredNoProjectConfig,
    IgnoredNoInvocation,
    IgnoredHasAncestor,
    IgnoredNoResultdbAccess,
}

impl TaskOutcome {
    pub const ALL: [TaskOutcome; 7] = [
        Self::Success,
        Self::FailedValidation,
        Self::IgnoredNoBbAccess,
        Self::IgnoredNoProjectConfig,
        Self::IgnoredNoInvocation,
        Self::IgnoredHasAncestor,
        Self::IgnoredNoResultdbAccess,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::FailedValidation => "failed_validation",
            Self::IgnoredNoBbAccess => "ignored_no_bb_access",
            Self::IgnoredNoProjectConfig => "ignored_no_project_config",
            Self::IgnoredNoInvocation => "ignored_no_invocation",
            Self::IgnoredHasAncestor => "ignored_has_ancestor",
            Self::IgnoredNoResultdbAccess => "ignored_no_resultdb_access",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn ancestor_index(outcome: AncestorOutcome) -> usize {
    outcome as usize
}

/// Ingestion metrics - all fields are atomic for thread-safe access
#[derive(Debug, Default)]
pub struct IngestionMetrics {
    task_outcomes: [AtomicU64; 7],
    ancestor_outcomes: [AtomicU64; 3],

    // Runner counters
    pub tasks_completed: AtomicU64,
    pub tasks_retried: AtomicU64,
    pub tasks_failed: AtomicU64,
    pub continuations_scheduled: AtomicU64,
}

impl IngestionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_task(&self, outcome: TaskOutcome) {
        self.task_outcomes[outcome.index()].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_ancestor(&self, outcome: AncestorOutcome) {
        self.ancestor_outcomes[ancestor_index(outcome)].fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_completed(&self) {
        self.tasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_retried(&self) {
        self.tasks_retried.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_tasks_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_continuations_scheduled(&self) {
        self.continuations_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_count(&self, outcome: TaskOutcome) -> u64 {
        self.task_outcomes[outcome.index()].load(Ordering::Relaxed)
    }

    pub fn ancestor_count(&self, outcome: AncestorOutcome) -> u64 {
        self.ancestor_outcomes[ancestor_index(outcome)].load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            task_outcomes: TaskOutcome::ALL.map(|o| (o, self.task_count(o))),
            ancestor_outcomes: AncestorOutcome::ALL.map(|o| (o, self.ancestor_count(o))),
            tasks_completed: self.tasks_completed.load(Ordering::Relaxed),
            tasks_retried: self.tasks_retried.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            continuations_scheduled: self.continuations_scheduled.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        out.push_str("# HELP weetbix_ingestion_task_outcomes_total Ingestion tasks by terminal outcome\n");
        out.push_str("# TYPE weetbix_ingestion_task_outcomes_total counter\n");
        for (outcome, count) in s.task_outcomes {
            out.push_str(&format!(
                "weetbix_ingestion_task_outcomes_total{{outcome=\"{}\"}} {}\n",
                outcome, count
            ));
        }

        out.push_str("\n# HELP weetbix_ingestion_ancestor_outcomes_total Ancestor checks by outcome\n");
        out.push_str("# TYPE weetbix_ingestion_ancestor_outcomes_total counter\n");
        for (outcome, count) in s.ancestor_outcomes {
            out.push_str(&format!(
                "weetbix_ingestion_ancestor_outcomes_total{{outcome=\"{}\"}} {}\n",
                outcome, count
            ));
        }

        out.push_str(&format!(
            r#"
# HELP weetbix_ingestion_tasks_completed_total Tasks marked completed in the queue
# TYPE weetbix_ingestion_tasks_completed_total counter
weetbix_ingestion_tasks_completed_total {}

# HELP weetbix_ingestion_tasks_retried_total Tasks requeued after a transient failure
# TYPE weetbix_ingestion_tasks_retried_total counter
weetbix_ingestion_tasks_retried_total {}

# HELP weetbix_ingestion_tasks_failed_total Tasks marked failed in the queue
# TYPE weetbix_ingestion_tasks_failed_total counter
weetbix_ingestion_tasks_failed_total {}

# HELP weetbix_ingestion_continuations_scheduled_total Continuation tasks created
# TYPE weetbix_ingestion_continuations_scheduled_total counter
weetbix_ingestion_continuations_scheduled_total {}
"#,
            s.tasks_completed, s.tasks_retried, s.tasks_failed, s.continuations_scheduled
        ));
        out
    }
}

/// Point-in-time copy of all metrics values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub task_outcomes: [(TaskOutcome, u64); 7],
    pub ancestor_outcomes: [(AncestorOutcome, u64); 3],
    pub tasks_completed: u64,
    pub tasks_retried: u64,
    pub tasks_failed: u64,
    pub continuations_scheduled: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_counters_are_independent() {
        let metrics = IngestionMetrics::new();
        metrics.record_task(TaskOutcome::Success);
        metrics.record_task(TaskOutcome::Success);
        metrics.record_task(TaskOutcome::IgnoredHasAncestor);
        metrics.record_ancestor(AncestorOutcome::Included);

        assert_eq!(metrics.task_count(TaskOutcome::Success), 2);
        assert_eq!(metrics.task_count(TaskOutcome::IgnoredHasAncestor), 1);
        assert_eq!(metrics.task_count(TaskOutcome::FailedValidation), 0);
        assert_eq!(metrics.ancestor_count(AncestorOutcome::Included), 1);
        assert_eq!(metrics.ancestor_count(AncestorOutcome::NoInvocation), 0);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = IngestionMetrics::new();
        metrics.record_task(TaskOutcome::IgnoredNoBbAccess);
        metrics.record_ancestor(AncestorOutcome::NoBuildAccess);
        metrics.inc_tasks_retried();

        let output = metrics.prometheus_format();
        assert!(output.contains(
            "weetbix_ingestion_task_outcomes_total{outcome=\"ignored_no_bb_access\"} 1"
        ));
        assert!(output.contains("weetbix_ingestion_task_outcomes_total{outcome=\"success\"} 0"));
        assert!(output.contains(
            "weetbix_ingestion_ancestor_outcomes_total{outcome=\"no_bb_access_to_ancestor\"} 1"
        ));
        assert!(output.contains("weetbix_ingestion_tasks_retried_total 1"));
    }
}

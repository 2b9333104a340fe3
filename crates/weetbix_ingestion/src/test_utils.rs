//! In-memory fakes of every collaborator, and builders for sample data.
//!
//! Fakes record their calls and can be told to fail, so tests can replay
//! the failure modes the queue retries.

use crate::clients::{BuildClient, ClusteringSink, ResultCollector, ResultSourceClient};
use crate::error::ClientError;
use crate::writer::ResultStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SubsecRound, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use weetbix_db::{TestResultRow, TestVariantRealm, WeetbixDb};
use weetbix_protocol::{
    Build, BuildRef, BuilderId, BuildbucketStatus, ClusteringOptions, Changelist,
    IngestedInvocation, IngestionTask, Invocation, PresubmitRun, PresubmitRunId,
    PresubmitRunMode, PresubmitRunStatus, QueryTestVariantsRequest, QueryTestVariantsResponse,
    ResultCollectionRequest, ResultDbInfra, TestResult, TestResultBundle, TestStatus, TestVariant,
    TestVariantStatus, Variant, BuildStatus,
};

pub const BUILD_HOST: &str = "bb.example.com";
pub const RESULTDB_HOST: &str = "results.example.com";

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// Sample data
// ============================================================================

/// First task of build `id`, partitioned an hour ago.
pub fn sample_task(id: i64, project: &str) -> IngestionTask {
    IngestionTask {
        build: BuildRef {
            host: BUILD_HOST.to_string(),
            id,
            project: project.to_string(),
        },
        presubmit_run: None,
        partition_time: Utc::now().trunc_subsecs(0) - Duration::hours(1),
        page_token: String::new(),
        task_index: 0,
    }
}

pub fn presubmit_run(mode: PresubmitRunMode, status: PresubmitRunStatus) -> PresubmitRun {
    PresubmitRun {
        presubmit_run_id: PresubmitRunId {
            system: "luci-cv".to_string(),
            id: "chromium/8800000000000-1-abcdef".to_string(),
        },
        owner: "user".to_string(),
        mode,
        status,
    }
}

/// Failed build `id` with invocation `invocations/build-<id>`.
pub fn build_with_invocation(id: i64, project: &str) -> Build {
    let mut build = Build {
        id,
        builder: BuilderId {
            project: project.to_string(),
            bucket: "ci".to_string(),
            builder: "linux-rel".to_string(),
        },
        status: BuildbucketStatus::Failure,
        ..Build::default()
    };
    build.infra.resultdb = Some(ResultDbInfra {
        hostname: RESULTDB_HOST.to_string(),
        invocation: format!("invocations/build-{}", id),
    });
    build
}

pub fn invocation_for(build: &Build, realm: &str) -> Invocation {
    Invocation {
        name: build
            .resultdb()
            .map(|rdb| rdb.invocation.clone())
            .unwrap_or_default(),
        realm: realm.to_string(),
        create_time: None,
    }
}

pub fn sample_invocation() -> IngestedInvocation {
    IngestedInvocation {
        project: "chromium".to_string(),
        invocation_id: "build-1".to_string(),
        sub_realm: "ci".to_string(),
        partition_time: Utc
            .with_ymd_and_hms(2026, 10, 1, 0, 0, 0)
            .single()
            .unwrap_or_default(),
        build_status: BuildStatus::Failure,
        presubmit: None,
        git_reference_hash: None,
        commit_position: 0,
        commit_hash: String::new(),
        changelists: vec![Changelist {
            host: "chromium".to_string(),
            change: 12345,
            patchset: 1,
        }],
    }
}

/// Unexpected FAIL in child invocation `run`.
pub fn timed_result(run: &str, result_id: &str, start: Option<DateTime<Utc>>) -> TestResultBundle {
    TestResultBundle {
        result: TestResult {
            name: format!("invocations/{}/tests/t/results/{}", run, result_id),
            result_id: result_id.to_string(),
            expected: false,
            status: TestStatus::Fail,
            start_time: start,
            duration_micros: Some(1_000),
        },
    }
}

pub fn test_variant(test_id: &str, results: Vec<TestResultBundle>) -> TestVariant {
    let mut def = BTreeMap::new();
    def.insert("builder".to_string(), "linux-rel".to_string());
    TestVariant {
        test_id: test_id.to_string(),
        variant_hash: String::new(),
        variant: Variant { def },
        status: TestVariantStatus::Unexpected,
        results,
        exonerations: Vec::new(),
    }
}

pub fn failing_variant(test_id: &str) -> TestVariant {
    test_variant(test_id, vec![timed_result("task-a", "r1", None)])
}

pub fn passing_variant(test_id: &str) -> TestVariant {
    let mut result = timed_result("task-a", "r1", None);
    result.result.expected = true;
    result.result.status = TestStatus::Pass;
    let mut variant = test_variant(test_id, vec![result]);
    variant.status = TestVariantStatus::Expected;
    variant
}

// ============================================================================
// Build service
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeBuildClient {
    builds: Mutex<HashMap<i64, Build>>,
    denied: Mutex<HashSet<i64>>,
    requests: Mutex<Vec<(i64, String)>>,
    fail_next: AtomicBool,
}

impl FakeBuildClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, build: Build) {
        lock(&self.builds).insert(build.id, build);
    }

    /// Answer PermissionDenied for this build.
    pub fn deny(&self, id: i64) {
        lock(&self.denied).insert(id);
    }

    /// Next call fails with a transport error.
    pub fn fail_next_with_transport(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }

    pub fn requested_ids(&self) -> Vec<i64> {
        lock(&self.requests).iter().map(|(id, _)| *id).collect()
    }

    pub fn last_fields(&self) -> Option<String> {
        lock(&self.requests).last().map(|(_, fields)| fields.clone())
    }
}

#[async_trait]
impl BuildClient for FakeBuildClient {
    async fn get_build(&self, _host: &str, id: i64, fields: &str) -> Result<Build, ClientError> {
        lock(&self.requests).push((id, fields.to_string()));
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Transport("injected".to_string()));
        }
        if lock(&self.denied).contains(&id) {
            return Err(ClientError::PermissionDenied(format!("build {}", id)));
        }
        lock(&self.builds)
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("build {}", id)))
    }
}

// ============================================================================
// Result source
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeResultSource {
    invocations: Mutex<HashMap<String, Invocation>>,
    pages: Mutex<HashMap<(String, String), QueryTestVariantsResponse>>,
    queries: Mutex<Vec<QueryTestVariantsRequest>>,
    fail_next_query: AtomicBool,
}

impl FakeResultSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_invocation(&self, invocation: Invocation) {
        lock(&self.invocations).insert(invocation.name.clone(), invocation);
    }

    /// Serve `variants` for `(invocation, page_token)`.
    pub fn add_page(
        &self,
        invocation: &str,
        page_token: &str,
        variants: Vec<TestVariant>,
        next_page_token: &str,
    ) {
        lock(&self.pages).insert(
            (invocation.to_string(), page_token.to_string()),
            QueryTestVariantsResponse {
                test_variants: variants,
                next_page_token: next_page_token.to_string(),
            },
        );
    }

    pub fn fail_next_query(&self) {
        self.fail_next_query.store(true, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<QueryTestVariantsRequest> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl ResultSourceClient for FakeResultSource {
    async fn get_invocation(&self, _host: &str, name: &str) -> Result<Invocation, ClientError> {
        lock(&self.invocations)
            .get(name)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(name.to_string()))
    }

    async fn query_test_variants(
        &self,
        _host: &str,
        request: &QueryTestVariantsRequest,
    ) -> Result<QueryTestVariantsResponse, ClientError> {
        lock(&self.queries).push(request.clone());
        if self.fail_next_query.swap(false, Ordering::SeqCst) {
            return Err(ClientError::Transport("injected".to_string()));
        }
        let invocation = request.invocations.first().cloned().unwrap_or_default();
        Ok(lock(&self.pages)
            .get(&(invocation, request.page_token.clone()))
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Result store
// ============================================================================

/// Keeps committed rows in memory.
#[derive(Debug, Default)]
pub struct FakeResultStore {
    realms: Mutex<Vec<TestVariantRealm>>,
    results: Mutex<Vec<TestResultRow>>,
    /// Result commits allowed before every further one fails.
    result_budget: Mutex<Option<usize>>,
}

impl FakeResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_results_after(&self, commits: usize) {
        *lock(&self.result_budget) = Some(commits);
    }

    pub fn realm_rows(&self) -> Vec<TestVariantRealm> {
        lock(&self.realms).clone()
    }

    pub fn result_rows(&self) -> Vec<TestResultRow> {
        lock(&self.results).clone()
    }
}

#[async_trait]
impl ResultStore for FakeResultStore {
    async fn commit_variant_realms(&self, rows: &[TestVariantRealm]) -> weetbix_db::Result<()> {
        lock(&self.realms).extend_from_slice(rows);
        Ok(())
    }

    async fn commit_test_results(&self, rows: &[TestResultRow]) -> weetbix_db::Result<()> {
        {
            let mut budget = lock(&self.result_budget);
            if let Some(remaining) = budget.as_mut() {
                if *remaining == 0 {
                    return Err(weetbix_db::DbError::conflict("injected result commit failure"));
                }
                *remaining -= 1;
            }
        }
        lock(&self.results).extend_from_slice(rows);
        Ok(())
    }
}

/// Database-backed store whose first result commits fail.
pub struct FlakyResultStore {
    db: WeetbixDb,
    failures_left: AtomicUsize,
}

impl FlakyResultStore {
    pub fn new(db: WeetbixDb, failures: usize) -> Self {
        Self {
            db,
            failures_left: AtomicUsize::new(failures),
        }
    }
}

#[async_trait]
impl ResultStore for FlakyResultStore {
    async fn commit_variant_realms(&self, rows: &[TestVariantRealm]) -> weetbix_db::Result<()> {
        self.db.upsert_test_variant_realms(rows).await
    }

    async fn commit_test_results(&self, rows: &[TestResultRow]) -> weetbix_db::Result<()> {
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(weetbix_db::DbError::conflict("injected result commit failure"));
        }
        self.db.insert_test_results(rows).await
    }
}

// ============================================================================
// Downstream sinks
// ============================================================================

#[derive(Debug, Default)]
pub struct RecordingClusteringSink {
    calls: Mutex<Vec<(ClusteringOptions, Vec<TestVariant>)>>,
    fail_next: AtomicBool,
}

impl RecordingClusteringSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(ClusteringOptions, Vec<TestVariant>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl ClusteringSink for RecordingClusteringSink {
    async fn ingest(
        &self,
        options: &ClusteringOptions,
        variants: &[TestVariant],
    ) -> anyhow::Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("injected clustering failure");
        }
        lock(&self.calls).push((options.clone(), variants.to_vec()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingResultCollector {
    requests: Mutex<Vec<ResultCollectionRequest>>,
}

impl RecordingResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ResultCollectionRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ResultCollector for RecordingResultCollector {
    async fn schedule(&self, request: &ResultCollectionRequest) -> anyhow::Result<()> {
        lock(&self.requests).push(request.clone());
        Ok(())
    }
}

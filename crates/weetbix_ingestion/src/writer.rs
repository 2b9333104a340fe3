//! Batched, concurrent writer for one page of test variants.
//!
//! A producer turns the page into batches and feeds a bounded channel;
//! a fixed pool of workers commits each batch as two transactions, realms
//! first and results second. Row keys depend only on the page contents, so
//! rewriting a page after a failure converges on the same rows.
//!
//! The batch threshold is checked after each variant has been added. A
//! variant's rows are never split, so a batch can exceed the threshold by
//! one variant's results. The store's own ceiling has to leave room for that.

use crate::cancel::CancellationToken;
use crate::error::WriteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use weetbix_db::{TestResultRow, TestVariantRealm, WeetbixDb};
use weetbix_protocol::defaults::{DEFAULT_BATCH_RESULT_THRESHOLD, DEFAULT_WRITER_WORKERS};
use weetbix_protocol::{IngestedInvocation, TestResult, TestVariant};

/// Where the writer commits batches.
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn commit_variant_realms(&self, rows: &[TestVariantRealm]) -> weetbix_db::Result<()>;
    async fn commit_test_results(&self, rows: &[TestResultRow]) -> weetbix_db::Result<()>;
}

#[async_trait]
impl ResultStore for WeetbixDb {
    async fn commit_variant_realms(&self, rows: &[TestVariantRealm]) -> weetbix_db::Result<()> {
        self.upsert_test_variant_realms(rows).await
    }

    async fn commit_test_results(&self, rows: &[TestResultRow]) -> weetbix_db::Result<()> {
        self.insert_test_results(rows).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    pub workers: usize,
    /// Result rows after which a batch is closed.
    pub batch_result_threshold: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WRITER_WORKERS,
            batch_result_threshold: DEFAULT_BATCH_RESULT_THRESHOLD,
        }
    }
}

/// Rows committed together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub realms: Vec<TestVariantRealm>,
    pub results: Vec<TestResultRow>,
}

impl Batch {
    fn is_empty(&self) -> bool {
        self.realms.is_empty() && self.results.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    pub batches: usize,
    pub realms: usize,
    pub results: usize,
}

/// Group a variant's results into runs, one per child invocation.
///
/// Runs are ordered by their earliest start time, then invocation; results
/// within a run by start time, then result id. Both orders are total, so
/// indexes do not depend on the order the source returned results in.
pub fn group_runs(variant: &TestVariant) -> Result<Vec<Vec<&TestResult>>, WriteError> {
    let mut runs: Vec<(&str, Vec<&TestResult>)> = Vec::new();
    for bundle in &variant.results {
        let result = &bundle.result;
        let invocation = result
            .invocation()
            .ok_or_else(|| WriteError::MalformedResultName(result.name.clone()))?;
        match runs.iter_mut().find(|(inv, _)| *inv == invocation) {
            Some((_, results)) => results.push(result),
            None => runs.push((invocation, vec![result])),
        }
    }

    for (_, results) in runs.iter_mut() {
        results.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.result_id.cmp(&b.result_id))
        });
    }
    runs.sort_by(|(inv_a, a), (inv_b, b)| {
        let first_a = a.first().and_then(|r| r.start_time);
        let first_b = b.first().and_then(|r| r.start_time);
        first_a.cmp(&first_b).then_with(|| inv_a.cmp(inv_b))
    });

    Ok(runs.into_iter().map(|(_, results)| results).collect())
}

/// Rows for one variant: its realm and every result.
pub fn variant_rows(
    inv: &IngestedInvocation,
    variant: &TestVariant,
    ingestion_time: DateTime<Utc>,
) -> Result<(TestVariantRealm, Vec<TestResultRow>), WriteError> {
    let variant_hash = variant.effective_variant_hash();
    let realm = TestVariantRealm {
        project: inv.project.clone(),
        test_id: variant.test_id.clone(),
        variant_hash: variant_hash.clone(),
        sub_realm: inv.sub_realm.clone(),
        variant: variant.variant.def.clone(),
        last_ingestion_time: ingestion_time,
    };

    let exoneration_reasons = variant.exoneration_reasons();
    let mut rows = Vec::with_capacity(variant.results.len());
    for (run_index, run) in group_runs(variant)?.into_iter().enumerate() {
        for (result_index, result) in run.into_iter().enumerate() {
            rows.push(TestResultRow {
                project: inv.project.clone(),
                test_id: variant.test_id.clone(),
                variant_hash: variant_hash.clone(),
                invocation_id: inv.invocation_id.clone(),
                run_index: run_index as i64,
                result_index: result_index as i64,
                partition_time: inv.partition_time,
                sub_realm: inv.sub_realm.clone(),
                is_unexpected: !result.expected,
                status: result.status,
                run_duration_micros: result.duration_micros,
                exoneration_reasons: exoneration_reasons.clone(),
                build_status: inv.build_status,
                presubmit: inv.presubmit.clone(),
                git_reference_hash: inv.git_reference_hash.clone(),
                commit_position: inv.commit_position,
                changelists: inv.changelists.clone(),
            });
        }
    }
    Ok((realm, rows))
}

/// Accumulates variant rows until the threshold is reached.
struct BatchBuilder {
    threshold: usize,
    current: Batch,
}

impl BatchBuilder {
    fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            current: Batch::default(),
        }
    }

    /// Add one variant's rows; returns the batch if it is now full.
    fn push(&mut self, realm: TestVariantRealm, rows: Vec<TestResultRow>) -> Option<Batch> {
        self.current.realms.push(realm);
        self.current.results.extend(rows);
        if self.current.results.len() >= self.threshold {
            Some(std::mem::take(&mut self.current))
        } else {
            None
        }
    }

    fn finish(self) -> Option<Batch> {
        (!self.current.is_empty()).then_some(self.current)
    }
}

/// Split a page into batches, preserving variant order.
pub fn build_batches(
    inv: &IngestedInvocation,
    variants: &[TestVariant],
    threshold: usize,
    ingestion_time: DateTime<Utc>,
) -> Result<Vec<Batch>, WriteError> {
    let mut builder = BatchBuilder::new(threshold);
    let mut batches = Vec::new();
    for variant in variants {
        let (realm, rows) = variant_rows(inv, variant, ingestion_time)?;
        batches.extend(builder.push(realm, rows));
    }
    batches.extend(builder.finish());
    Ok(batches)
}

/// Write one page.
///
/// The first failing batch cancels the write: batches already committing
/// finish, no new ones start, and the error names the failing batch.
pub async fn write_page(
    store: Arc<dyn ResultStore>,
    inv: &IngestedInvocation,
    variants: Arc<[TestVariant]>,
    config: WriterConfig,
) -> Result<WriteSummary, WriteError> {
    let workers = config.workers.max(1);
    let threshold = config.batch_result_threshold;
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel::<(usize, Batch)>(workers);
    let rx = Arc::new(Mutex::new(rx));

    let producer = {
        let inv = inv.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { produce(inv, variants, threshold, tx, cancel).await })
    };

    let mut pool = JoinSet::new();
    for worker_id in 0..workers {
        let store = Arc::clone(&store);
        let rx = Arc::clone(&rx);
        let cancel = cancel.clone();
        pool.spawn(async move { commit_batches(worker_id, store, rx, cancel).await });
    }
    drop(rx);

    let mut summary = WriteSummary::default();
    let mut first_error: Option<WriteError> = None;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(Ok(done)) => {
                summary.batches += done.batches;
                summary.realms += done.realms;
                summary.results += done.results;
            }
            Ok(Err(err)) => {
                first_error.get_or_insert(err);
            }
            Err(join_err) => {
                cancel.cancel();
                first_error.get_or_insert(WriteError::Worker(join_err.to_string()));
            }
        }
    }

    let produced = producer
        .await
        .map_err(|e| WriteError::Worker(e.to_string()))
        .and_then(|r| r);

    if let Some(err) = first_error {
        return Err(err);
    }
    produced?;

    debug!(
        invocation_id = %inv.invocation_id,
        batches = summary.batches,
        results = summary.results,
        "Page written"
    );
    Ok(summary)
}

async fn produce(
    inv: IngestedInvocation,
    variants: Arc<[TestVariant]>,
    threshold: usize,
    tx: mpsc::Sender<(usize, Batch)>,
    cancel: CancellationToken,
) -> Result<(), WriteError> {
    let ingestion_time = Utc::now();
    let mut builder = BatchBuilder::new(threshold);
    let mut index = 0;

    for variant in variants.iter() {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let (realm, rows) = match variant_rows(&inv, variant, ingestion_time) {
            Ok(rows) => rows,
            Err(err) => {
                cancel.cancel();
                return Err(err);
            }
        };
        if let Some(batch) = builder.push(realm, rows) {
            if tx.send((index, batch)).await.is_err() {
                // Every worker has stopped
                return Ok(());
            }
            index += 1;
        }
    }

    if let Some(batch) = builder.finish() {
        if !cancel.is_cancelled() && tx.send((index, batch)).await.is_err() {
            // Every worker has stopped
            return Ok(());
        }
    }
    Ok(())
}

async fn commit_batches(
    worker_id: usize,
    store: Arc<dyn ResultStore>,
    rx: Arc<Mutex<mpsc::Receiver<(usize, Batch)>>>,
    cancel: CancellationToken,
) -> Result<WriteSummary, WriteError> {
    let mut done = WriteSummary::default();
    loop {
        if cancel.is_cancelled() {
            return Ok(done);
        }
        let next = rx.lock().await.recv().await;
        let Some((index, batch)) = next else {
            return Ok(done);
        };
        if cancel.is_cancelled() {
            return Ok(done);
        }

        let committed = match store.commit_variant_realms(&batch.realms).await {
            Ok(()) => store.commit_test_results(&batch.results).await,
            Err(err) => Err(err),
        };
        if let Err(source) = committed {
            cancel.cancel();
            warn!(worker_id, batch = index, error = %source, "Batch commit failed");
            return Err(WriteError::Commit {
                batch: index,
                source,
            });
        }

        done.batches += 1;
        done.realms += batch.realms.len();
        done.results += batch.results.len();
    }
}

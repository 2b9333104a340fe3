//! Wire and payload types for Weetbix test-result ingestion.
//!
//! Three families of types live here:
//!
//! - [`task`]: the payload passed between ingestion task invocations.
//! - [`build`] and [`resultdb`]: the subset of the build service and the
//!   result source that ingestion reads. Field names follow protojson
//!   (`camelCase`, 64-bit integers as strings) so the HTTP clients can decode
//!   responses directly.
//! - [`ingested`]: the normalized records written by ingestion.

pub mod build;
pub mod defaults;
pub mod hashing;
pub mod ingested;
pub mod resultdb;
pub mod serde_util;
pub mod sinks;
pub mod task;

pub use build::{
    Build, BuildInfra, BuildInput, BuildOutput, BuilderId, BuildbucketStatus, GerritChange,
    GitilesCommit, ResultDbInfra, Trinary,
};
pub use hashing::{git_reference_hash, variant_hash};
pub use ingested::{
    BuildStatus, Changelist, GitReference, IngestedInvocation, PresubmitInfo, MAXIMUM_CLS,
};
pub use resultdb::{
    Exoneration, ExonerationReason, Invocation, QueryTestVariantsRequest,
    QueryTestVariantsResponse, TestResult, TestResultBundle, TestStatus, TestVariant,
    TestVariantStatus, Variant,
};
pub use sinks::{ClusteringOptions, ResultCollectionRequest};
pub use task::{
    build_key, BuildRef, IngestionTask, PresubmitRun, PresubmitRunId, PresubmitRunMode,
    PresubmitRunStatus,
};

//! Interfaces of the services ingestion talks to.
//!
//! The task handler only sees these traits. HTTP implementations live in
//! [`buildbucket`] and [`resultdb`]; outbox-backed sinks are implemented on
//! `WeetbixDb` in [`crate::sinks`].

pub mod buildbucket;
pub mod prpc;
pub mod resultdb;

use crate::config::{ProjectConfig, RealmConfig};
use crate::error::{ClientError, ConfigError};
use async_trait::async_trait;
use weetbix_protocol::{
    Build, ClusteringOptions, Invocation, QueryTestVariantsRequest, QueryTestVariantsResponse,
    ResultCollectionRequest, TestVariant,
};

pub use buildbucket::HttpBuildClient;
pub use prpc::PrpcClient;
pub use resultdb::HttpResultSourceClient;

/// Build lookup.
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Fetch a build, restricted to the comma separated `fields` mask.
    async fn get_build(&self, host: &str, id: i64, fields: &str) -> Result<Build, ClientError>;
}

/// Test result source.
#[async_trait]
pub trait ResultSourceClient: Send + Sync {
    /// `name` is `invocations/<id>`.
    async fn get_invocation(&self, host: &str, name: &str) -> Result<Invocation, ClientError>;

    /// One page of test variants. An empty `next_page_token` ends the query.
    async fn query_test_variants(
        &self,
        host: &str,
        request: &QueryTestVariantsRequest,
    ) -> Result<QueryTestVariantsResponse, ClientError>;
}

/// Project and realm configuration.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    async fn project_config(&self, project: &str) -> Result<ProjectConfig, ConfigError>;

    /// `realm` is `<project>:<sub-realm>`.
    async fn realm_config(&self, realm: &str) -> Result<RealmConfig, ConfigError>;
}

/// Consumer of unexpected failures. Must accept the same
/// (options, variants) more than once.
#[async_trait]
pub trait ClusteringSink: Send + Sync {
    async fn ingest(&self, options: &ClusteringOptions, variants: &[TestVariant])
        -> anyhow::Result<()>;
}

/// Scheduler of follow-up result collection.
#[async_trait]
pub trait ResultCollector: Send + Sync {
    async fn schedule(&self, request: &ResultCollectionRequest) -> anyhow::Result<()>;
}

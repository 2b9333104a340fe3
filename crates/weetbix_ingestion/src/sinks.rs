//! Outbox-backed downstream sinks.
//!
//! Both write to tables keyed so that a replayed page or a replayed final
//! task leaves a single entry.

use crate::clients::{ClusteringSink, ResultCollector};
use async_trait::async_trait;
use weetbix_db::WeetbixDb;
use weetbix_protocol::{ClusteringOptions, ResultCollectionRequest, TestVariant};

#[async_trait]
impl ClusteringSink for WeetbixDb {
    async fn ingest(
        &self,
        options: &ClusteringOptions,
        variants: &[TestVariant],
    ) -> anyhow::Result<()> {
        self.enqueue_clustering(options, variants).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultCollector for WeetbixDb {
    async fn schedule(&self, request: &ResultCollectionRequest) -> anyhow::Result<()> {
        self.enqueue_result_collection(request).await?;
        Ok(())
    }
}

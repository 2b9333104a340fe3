//! Result source over pRPC.

use super::prpc::PrpcClient;
use super::ResultSourceClient;
use crate::error::ClientError;
use async_trait::async_trait;
use serde::Serialize;
use weetbix_protocol::{Invocation, QueryTestVariantsRequest, QueryTestVariantsResponse};

const SERVICE: &str = "luci.resultdb.v1.ResultDB";

#[derive(Debug, Serialize)]
struct GetInvocationRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpResultSourceClient {
    prpc: PrpcClient,
}

impl HttpResultSourceClient {
    pub fn new(prpc: PrpcClient) -> Self {
        Self { prpc }
    }
}

#[async_trait]
impl ResultSourceClient for HttpResultSourceClient {
    async fn get_invocation(&self, host: &str, name: &str) -> Result<Invocation, ClientError> {
        self.prpc
            .call(host, SERVICE, "GetInvocation", &GetInvocationRequest { name })
            .await
    }

    async fn query_test_variants(
        &self,
        host: &str,
        request: &QueryTestVariantsRequest,
    ) -> Result<QueryTestVariantsResponse, ClientError> {
        self.prpc
            .call(host, SERVICE, "QueryTestVariants", request)
            .await
    }
}

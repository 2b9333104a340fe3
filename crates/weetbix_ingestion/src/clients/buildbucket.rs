//! Build lookup over pRPC.

use super::prpc::PrpcClient;
use super::BuildClient;
use crate::error::ClientError;
use async_trait::async_trait;
use serde::Serialize;
use weetbix_protocol::Build;

const SERVICE: &str = "buildbucket.v2.Builds";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GetBuildRequest<'a> {
    #[serde(with = "weetbix_protocol::serde_util::int64_string")]
    id: i64,
    fields: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpBuildClient {
    prpc: PrpcClient,
}

impl HttpBuildClient {
    pub fn new(prpc: PrpcClient) -> Self {
        Self { prpc }
    }
}

#[async_trait]
impl BuildClient for HttpBuildClient {
    async fn get_build(&self, host: &str, id: i64, fields: &str) -> Result<Build, ClientError> {
        let request = GetBuildRequest { id, fields };
        self.prpc.call(host, SERVICE, "GetBuild", &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let request = GetBuildRequest {
            id: 8800000000000000001,
            fields: "builder,status",
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["id"], "8800000000000000001");
        assert_eq!(json["fields"], "builder,status");
    }
}

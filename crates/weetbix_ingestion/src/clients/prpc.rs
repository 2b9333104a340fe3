//! Minimal pRPC client: JSON over HTTP POST.
//!
//! Requests go to `https://<host>/prpc/<service>/<method>`. The gRPC status
//! comes back in the `X-Prpc-Grpc-Code` header and successful JSON bodies
//! start with the `)]}'` XSSI guard.

use crate::error::ClientError;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

const GRPC_CODE_HEADER: &str = "x-prpc-grpc-code";
const XSSI_PREFIX: &str = ")]}'";

const GRPC_OK: u32 = 0;
const GRPC_NOT_FOUND: u32 = 5;
const GRPC_PERMISSION_DENIED: u32 = 7;

/// Longest response excerpt kept in error messages.
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Clone)]
pub struct PrpcClient {
    http: reqwest::Client,
    scheme: &'static str,
}

impl PrpcClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("weetbix-ingester/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            scheme: "https",
        })
    }

    /// Talk plain HTTP, for local fakes of the services.
    pub fn insecure(mut self) -> Self {
        self.scheme = "http";
        self
    }

    pub fn endpoint(&self, host: &str, service: &str, method: &str) -> String {
        format!("{}://{}/prpc/{}/{}", self.scheme, host, service, method)
    }

    pub async fn call<Req, Resp>(
        &self,
        host: &str,
        service: &str,
        method: &str,
        request: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(host, service, method);
        debug!(url = %url, "pRPC call");

        let response = self
            .http
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let grpc_code = grpc_code(response.headers());
        let body = response.text().await?;

        let payload = check_response(status, grpc_code, &body)
            .map_err(|err| annotate(err, service, method))?;
        serde_json::from_str(payload)
            .map_err(|e| ClientError::Decode(format!("{}.{}: {}", service, method, e)))
    }
}

fn grpc_code(headers: &HeaderMap) -> Option<u32> {
    headers
        .get(GRPC_CODE_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn annotate(err: ClientError, service: &str, method: &str) -> ClientError {
    match err {
        ClientError::NotFound(msg) => ClientError::NotFound(format!("{}.{}: {}", service, method, msg)),
        ClientError::PermissionDenied(msg) => {
            ClientError::PermissionDenied(format!("{}.{}: {}", service, method, msg))
        }
        ClientError::Transport(msg) => {
            ClientError::Transport(format!("{}.{}: {}", service, method, msg))
        }
        other => other,
    }
}

/// Map an HTTP status and gRPC code to the JSON payload or an error.
pub(crate) fn check_response(
    http_status: u16,
    grpc_code: Option<u32>,
    body: &str,
) -> Result<&str, ClientError> {
    let excerpt = || {
        let trimmed = body.trim();
        match trimmed.char_indices().nth(MAX_ERROR_BODY) {
            Some((idx, _)) => format!("{}...", &trimmed[..idx]),
            None => trimmed.to_string(),
        }
    };

    match grpc_code {
        Some(GRPC_NOT_FOUND) => return Err(ClientError::NotFound(excerpt())),
        Some(GRPC_PERMISSION_DENIED) => return Err(ClientError::PermissionDenied(excerpt())),
        Some(GRPC_OK) | None => {}
        Some(code) => {
            return Err(ClientError::Transport(format!(
                "grpc code {} (http {}): {}",
                code,
                http_status,
                excerpt()
            )))
        }
    }

    match http_status {
        200..=299 => Ok(strip_xssi_prefix(body)),
        404 => Err(ClientError::NotFound(excerpt())),
        403 => Err(ClientError::PermissionDenied(excerpt())),
        status => Err(ClientError::Transport(format!("http {}: {}", status, excerpt()))),
    }
}

pub(crate) fn strip_xssi_prefix(body: &str) -> &str {
    let body = body.trim_start();
    body.strip_prefix(XSSI_PREFIX).unwrap_or(body).trim_start()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_xssi_prefix() {
        assert_eq!(strip_xssi_prefix(")]}'\n{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_xssi_prefix("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(check_response(200, Some(0), ")]}'\n{}").unwrap(), "{}");
        assert!(matches!(
            check_response(404, Some(5), "build not found"),
            Err(ClientError::NotFound(_))
        ));
        assert!(matches!(
            check_response(403, Some(7), "no access"),
            Err(ClientError::PermissionDenied(_))
        ));
        // Status alone is enough when the header is missing.
        assert!(matches!(
            check_response(404, None, ""),
            Err(ClientError::NotFound(_))
        ));
        assert!(matches!(
            check_response(403, None, ""),
            Err(ClientError::PermissionDenied(_))
        ));
        assert!(matches!(
            check_response(503, Some(14), "unavailable"),
            Err(ClientError::Transport(_))
        ));
        assert!(matches!(
            check_response(500, None, "oops"),
            Err(ClientError::Transport(_))
        ));
    }

    #[test]
    fn test_long_error_body_truncated() {
        let body = "x".repeat(1000);
        let Err(ClientError::Transport(msg)) = check_response(500, None, &body) else {
            panic!("expected transport error");
        };
        assert!(msg.len() < 300);
        assert!(msg.ends_with("..."));
    }

    #[test]
    fn test_endpoint() {
        let client = PrpcClient::new(Duration::from_secs(5)).unwrap();
        assert_eq!(
            client.endpoint("cr-buildbucket.appspot.com", "buildbucket.v2.Builds", "GetBuild"),
            "https://cr-buildbucket.appspot.com/prpc/buildbucket.v2.Builds/GetBuild"
        );
        let client = client.insecure();
        assert!(client
            .endpoint("localhost:8080", "s", "m")
            .starts_with("http://localhost:8080/"));
    }
}

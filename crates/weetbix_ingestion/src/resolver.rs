//! Build lookup and the ancestor check.

use crate::clients::BuildClient;
use crate::error::ClientError;
use tracing::debug;
use weetbix_protocol::Build;

/// Fields ingestion reads from a build.
pub const BUILD_FIELDS: &str = "builder,infra.resultdb,status,input,output,ancestorIds,critical";

/// Fetch a build with [`BUILD_FIELDS`].
///
/// Not found and permission denied come back as such; callers treat them as
/// a terminal skip rather than a retryable failure.
pub async fn resolve_build(client: &dyn BuildClient, host: &str, id: i64) -> Result<Build, ClientError> {
    client.get_build(host, id, BUILD_FIELDS).await
}

/// Result of looking at a build's immediate parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AncestorOutcome {
    /// The parent could not be read. Ingest the child.
    NoBuildAccess,
    /// The parent has no result invocation. Ingest the child.
    NoInvocation,
    /// The parent's invocation already includes the child's results.
    Included,
}

impl AncestorOutcome {
    pub const ALL: [AncestorOutcome; 3] = [Self::NoBuildAccess, Self::NoInvocation, Self::Included];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoBuildAccess => "no_bb_access_to_ancestor",
            Self::NoInvocation => "no_resultdb_invocation_on_ancestor",
            Self::Included => "ok",
        }
    }

    pub fn is_included(&self) -> bool {
        matches!(self, Self::Included)
    }
}

impl std::fmt::Display for AncestorOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decide whether `build`'s results are already part of its parent's
/// invocation. Returns `None` for builds without ancestors.
pub async fn check_ancestor(
    client: &dyn BuildClient,
    host: &str,
    build: &Build,
) -> Result<Option<AncestorOutcome>, ClientError> {
    let Some(parent_id) = build.parent_id() else {
        return Ok(None);
    };

    let outcome = match resolve_build(client, host, parent_id).await {
        Ok(parent) if parent.has_invocation() => AncestorOutcome::Included,
        Ok(_) => AncestorOutcome::NoInvocation,
        Err(err) if err.is_no_access() => {
            debug!(parent_id, error = %err, "Ancestor not readable");
            AncestorOutcome::NoBuildAccess
        }
        Err(err) => return Err(err),
    };

    debug!(build_id = build.id, parent_id, outcome = %outcome, "Ancestor checked");
    Ok(Some(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{build_with_invocation, FakeBuildClient};

    const HOST: &str = "bb.example.com";

    #[tokio::test]
    async fn test_no_ancestors() {
        let client = FakeBuildClient::new();
        let build = build_with_invocation(1, "chromium");
        assert_eq!(check_ancestor(&client, HOST, &build).await.unwrap(), None);
        assert_eq!(client.calls(), 0);
    }

    #[tokio::test]
    async fn test_parent_with_invocation_includes_child() {
        let client = FakeBuildClient::new();
        client.insert(build_with_invocation(10, "chromium"));
        let mut child = build_with_invocation(11, "chromium");
        child.ancestor_ids = vec![9, 10];

        let outcome = check_ancestor(&client, HOST, &child).await.unwrap();
        assert_eq!(outcome, Some(AncestorOutcome::Included));
        // Only the immediate parent is consulted.
        assert_eq!(client.requested_ids(), vec![10]);
    }

    #[tokio::test]
    async fn test_parent_without_invocation() {
        let client = FakeBuildClient::new();
        let mut parent = build_with_invocation(10, "chromium");
        parent.infra.resultdb = None;
        client.insert(parent);
        let mut child = build_with_invocation(11, "chromium");
        child.ancestor_ids = vec![10];

        let outcome = check_ancestor(&client, HOST, &child).await.unwrap();
        assert_eq!(outcome, Some(AncestorOutcome::NoInvocation));
    }

    #[tokio::test]
    async fn test_parent_not_found_and_transient() {
        let client = FakeBuildClient::new();
        let mut child = build_with_invocation(11, "chromium");
        child.ancestor_ids = vec![10];

        let outcome = check_ancestor(&client, HOST, &child).await.unwrap();
        assert_eq!(outcome, Some(AncestorOutcome::NoBuildAccess));

        client.fail_next_with_transport();
        assert!(matches!(
            check_ancestor(&client, HOST, &child).await,
            Err(ClientError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_resolve_uses_field_mask() {
        let client = FakeBuildClient::new();
        client.insert(build_with_invocation(5, "chromium"));
        resolve_build(&client, HOST, 5).await.unwrap();
        assert_eq!(client.last_fields().as_deref(), Some(BUILD_FIELDS));
    }
}

//! Error types for ingestion.
//!
//! Components return their own error enums. [`TaskError`] is produced only by
//! the task handler, which decides whether a failure is worth retrying.

use thiserror::Error;

/// Failure of a call to an external service.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Network failures, timeouts, 5xx and any other status
    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Not found or permission denied. Both are expected for builds the
    /// service account cannot see.
    pub fn is_no_access(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PermissionDenied(_))
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// Project or realm configuration lookup failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration does not exist: {0}")]
    NotExists(String),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// The build and invocation disagree with the task, or carry values the
/// extractor cannot represent.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ExtractError {
    #[error("invalid realm {0:?}: expected <project>:<sub-realm>")]
    InvalidRealm(String),

    #[error("invocation project {actual:?} does not match task project {expected:?}")]
    ProjectMismatch { expected: String, actual: String },

    #[error("build has unsupported status {0}")]
    UnsupportedBuildStatus(String),
}

/// Rejected task payloads.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("build project is required")]
    MissingProject,

    #[error("partition time {0} is too far in the past")]
    PartitionTimeTooOld(String),

    #[error("partition time {0} is too far in the future")]
    PartitionTimeInFuture(String),
}

/// Failure of the batched writer. The first failing batch aborts the write.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("committing batch {batch} failed: {source}")]
    Commit {
        batch: usize,
        #[source]
        source: weetbix_db::DbError,
    },

    #[error("write worker failed: {0}")]
    Worker(String),

    #[error("result {0:?} has no parsable invocation in its name")]
    MalformedResultName(String),
}

/// Failure to hand a written page to downstream consumers.
#[derive(Error, Debug)]
pub enum FanoutError {
    #[error("clustering ingestion failed: {0}")]
    Clustering(#[source] anyhow::Error),

    #[error("realm config lookup failed: {0}")]
    Config(#[from] ConfigError),

    #[error("analysis update failed: {0}")]
    Analysis(#[from] weetbix_db::DbError),

    #[error("scheduling result collection failed: {0}")]
    ResultCollection(#[source] anyhow::Error),
}

/// Task failure as seen by the queue.
///
/// Transient failures are retried with the same payload; permanent ones
/// are not.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("permanent: {message}")]
    Permanent { message: String },

    #[error("transient: {message}")]
    Transient { message: String },
}

impl TaskError {
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent {
            message: msg.into(),
        }
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient {
            message: msg.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Permanent { message } | Self::Transient { message } => message,
        }
    }
}

/// Retry classification for store errors.
impl From<weetbix_db::DbError> for TaskError {
    fn from(err: weetbix_db::DbError) -> Self {
        if err.is_retryable() {
            Self::transient(err.to_string())
        } else {
            Self::permanent(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_classification() {
        assert!(TaskError::transient("timeout").is_transient());
        assert!(!TaskError::permanent("bad payload").is_transient());

        let err: TaskError = weetbix_db::DbError::conflict("moved").into();
        assert!(err.is_transient());
        let err: TaskError = weetbix_db::DbError::invariant("index ahead").into();
        assert!(!err.is_transient());
        assert!(err.message().contains("index ahead"));
    }

    #[test]
    fn test_no_access() {
        assert!(ClientError::NotFound("build".into()).is_no_access());
        assert!(ClientError::PermissionDenied("build".into()).is_no_access());
        assert!(!ClientError::Transport("503".into()).is_no_access());
    }
}

//! Paginated ingestion of test results for a finished build.
//!
//! A build is ingested by a chain of tasks. Each task reads one page of
//! test variants from the result source, enqueues its successor when more
//! pages remain, writes the page in batches and forwards it to downstream
//! consumers. Every step can be retried without duplicating work.
//!
//! # Usage
//!
//! ```rust,ignore
//! let handler = Arc::new(IngestionHandler::new(db.clone(), collaborators, settings));
//! let (runner, stop) = TaskRunner::new(db, handler, &config.ingestion);
//! runner.run().await?;
//! ```

pub mod analysis;
pub mod cancel;
pub mod clients;
pub mod config;
pub mod context;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod limiter;
pub mod metrics;
pub mod resolver;
pub mod runner;
pub mod sinks;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod writer;

pub use analysis::{AnalysisPolicy, DefaultAnalysisPolicy};
pub use config::{IngesterConfig, IngestionSettings, StaticConfigProvider};
pub use error::{ClientError, ConfigError, TaskError, WriteError};
pub use handler::{validate_task, Collaborators, HandlerSettings, IngestionHandler, TaskReport};
pub use limiter::TaskLimiter;
pub use metrics::{IngestionMetrics, TaskOutcome};
pub use resolver::AncestorOutcome;
pub use runner::{TaskDisposition, TaskRunner};
pub use writer::{ResultStore, WriteSummary, WriterConfig};

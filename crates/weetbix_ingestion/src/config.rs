//! Configuration for the ingester.
//!
//! Loaded from TOML; every field has a default so an empty file is valid.

use crate::clients::ConfigProvider;
use crate::error::ConfigError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use weetbix_protocol::defaults::{
    DEFAULT_BATCH_RESULT_THRESHOLD, DEFAULT_DATABASE_URL, DEFAULT_MAX_CONCURRENT_TASKS,
    DEFAULT_MAX_ROWS_PER_COMMIT, DEFAULT_MAX_TASK_RETRIES, DEFAULT_PAGE_SIZE,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_WRITER_WORKERS,
};
use weetbix_protocol::resultdb::REALM_SEPARATOR;

/// Main configuration for the ingester
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngesterConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub ingestion: IngestionSettings,

    #[serde(default)]
    pub clients: ClientSettings,

    /// Projects known to this deployment
    #[serde(default)]
    pub projects: Vec<ProjectConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `sqlite:<path>` or `sqlite::memory:`
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

fn default_database_url() -> String {
    DEFAULT_DATABASE_URL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSettings {
    /// Test variants requested per page
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Tasks running at once in this process
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    /// Commit workers per page write
    #[serde(default = "default_writer_workers")]
    pub writer_workers: usize,

    /// Result rows after which a batch is closed (soft)
    #[serde(default = "default_batch_result_threshold")]
    pub batch_result_threshold: usize,

    /// Rows a single commit may write (hard)
    #[serde(default = "default_max_rows_per_commit")]
    pub max_rows_per_commit: usize,

    #[serde(default = "default_max_task_retries")]
    pub max_task_retries: u32,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

fn default_max_concurrent_tasks() -> usize {
    DEFAULT_MAX_CONCURRENT_TASKS
}

fn default_writer_workers() -> usize {
    DEFAULT_WRITER_WORKERS
}

fn default_batch_result_threshold() -> usize {
    DEFAULT_BATCH_RESULT_THRESHOLD
}

fn default_max_rows_per_commit() -> usize {
    DEFAULT_MAX_ROWS_PER_COMMIT
}

fn default_max_task_retries() -> u32 {
    DEFAULT_MAX_TASK_RETRIES
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            writer_workers: default_writer_workers(),
            batch_result_threshold: default_batch_result_threshold(),
            max_rows_per_commit: default_max_rows_per_commit(),
            max_task_retries: default_max_task_retries(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl IngestionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Per-project configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    #[serde(default)]
    pub realms: Vec<RealmConfig>,
}

/// Per-realm configuration. `name` is the sub-realm, without the project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RealmConfig {
    pub name: String,

    /// Whether test variant analysis runs for results in this realm
    #[serde(default)]
    pub test_variant_analysis: bool,
}

impl IngesterConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: IngesterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let ingestion = &self.ingestion;
        if ingestion.page_size == 0 {
            return Err(ConfigError::Invalid("ingestion.page_size must be positive".into()));
        }
        if ingestion.max_concurrent_tasks == 0 || ingestion.writer_workers == 0 {
            return Err(ConfigError::Invalid(
                "ingestion.max_concurrent_tasks and ingestion.writer_workers must be positive"
                    .into(),
            ));
        }
        if ingestion.batch_result_threshold >= ingestion.max_rows_per_commit {
            return Err(ConfigError::Invalid(format!(
                "ingestion.batch_result_threshold ({}) must be below ingestion.max_rows_per_commit ({})",
                ingestion.batch_result_threshold, ingestion.max_rows_per_commit
            )));
        }
        for project in &self.projects {
            if project.name.is_empty() || project.name.contains(REALM_SEPARATOR) {
                return Err(ConfigError::Invalid(format!(
                    "invalid project name {:?}",
                    project.name
                )));
            }
        }
        Ok(())
    }
}

/// Serves project and realm configuration from [`IngesterConfig`].
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    projects: HashMap<String, ProjectConfig>,
}

impl StaticConfigProvider {
    pub fn new(projects: impl IntoIterator<Item = ProjectConfig>) -> Self {
        Self {
            projects: projects
                .into_iter()
                .map(|project| (project.name.clone(), project))
                .collect(),
        }
    }

    pub fn from_config(config: &IngesterConfig) -> Self {
        Self::new(config.projects.iter().cloned())
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn project_config(&self, project: &str) -> Result<ProjectConfig, ConfigError> {
        self.projects
            .get(project)
            .cloned()
            .ok_or_else(|| ConfigError::NotExists(format!("project {}", project)))
    }

    async fn realm_config(&self, realm: &str) -> Result<RealmConfig, ConfigError> {
        let (project, sub_realm) = realm
            .split_once(REALM_SEPARATOR)
            .ok_or_else(|| ConfigError::NotExists(format!("realm {}", realm)))?;
        self.projects
            .get(project)
            .and_then(|p| p.realms.iter().find(|r| r.name == sub_realm))
            .cloned()
            .ok_or_else(|| ConfigError::NotExists(format!("realm {}", realm)))
    }
}

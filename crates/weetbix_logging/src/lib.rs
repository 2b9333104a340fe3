//! Shared logging setup for Weetbix binaries.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "weetbix_ingestion=info,weetbix_db=info";

/// Logging configuration shared by Weetbix binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    /// Mirror the file filter on stderr instead of warnings only.
    pub verbose: bool,
    /// Directory for daily-rolling log files. Stderr only when unset.
    pub log_dir: Option<PathBuf>,
}

/// Keeps the background file writer alive. Drop it last, on shutdown, so
/// buffered lines are flushed.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Build the filter from `RUST_LOG`, falling back to the default.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Initialize tracing with stderr output and, optionally, a rolling file.
pub fn init_logging(config: LogConfig<'_>) -> Result<LoggingGuard> {
    let console_filter = if config.verbose {
        env_filter()
    } else {
        EnvFilter::new("warn")
    };
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let (file_layer, file_guard) = match config.log_dir {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(&dir, log_file_name(config.app_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}

/// File prefix for an app: only ASCII alphanumerics, `-` and `_` survive.
fn log_file_name(app_name: &str) -> String {
    let sanitized: String = app_name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!("{}.log", sanitized)
}

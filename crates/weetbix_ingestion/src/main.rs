//! Weetbix ingester
//!
//! - `init`: create the database schema
//! - `enqueue`: start ingestion of a build (the external trigger)
//! - `run`: poll the task queue and ingest
//! - `stats`: queue counts

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use weetbix_db::WeetbixDb;
use weetbix_ingestion::clients::{HttpBuildClient, HttpResultSourceClient, PrpcClient};
use weetbix_ingestion::{
    Collaborators, HandlerSettings, IngesterConfig, IngestionHandler, IngestionMetrics,
    StaticConfigProvider, TaskLimiter, TaskRunner,
};
use weetbix_logging::{init_logging, LogConfig};
use weetbix_protocol::{
    BuildRef, IngestionTask, PresubmitRun, PresubmitRunId, PresubmitRunMode, PresubmitRunStatus,
};

/// How long `run` waits for in-flight tasks after Ctrl-C.
const SHUTDOWN_TIMEOUT_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "weetbix-ingester", about = "Ingest test results of finished builds")]
struct Cli {
    /// Path to the TOML config. Defaults apply when the file is missing.
    #[arg(long, global = true, env = "WEETBIX_CONFIG", default_value = "weetbix.toml")]
    config: PathBuf,

    /// Database URL, overriding the config file
    #[arg(long, global = true, env = "WEETBIX_DATABASE")]
    database: Option<String>,

    /// Log at the configured level on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write daily-rolling logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema
    Init,
    /// Enqueue the first ingestion task for a build
    Enqueue(EnqueueArgs),
    /// Poll the task queue and ingest builds
    Run {
        /// Drain the queue and exit instead of polling
        #[arg(long)]
        once: bool,
        /// Talk plain HTTP to the build and result services
        #[arg(long)]
        insecure: bool,
    },
    /// Print queue counts
    Stats,
}

#[derive(Args, Debug)]
struct EnqueueArgs {
    /// Build service host
    #[arg(long)]
    host: String,
    #[arg(long)]
    build_id: i64,
    #[arg(long)]
    project: String,
    /// RFC 3339 time the results belong to. Defaults to now.
    #[arg(long)]
    partition_time: Option<DateTime<Utc>>,
    /// Presubmit run id; the other presubmit flags apply only with it
    #[arg(long)]
    presubmit_id: Option<String>,
    #[arg(long, default_value = "luci-cv")]
    presubmit_system: String,
    #[arg(long, default_value = "user")]
    presubmit_owner: String,
    /// FULL_RUN, DRY_RUN or QUICK_DRY_RUN
    #[arg(long, default_value = "FULL_RUN")]
    presubmit_mode: String,
    /// succeeded, failed or canceled
    #[arg(long, default_value = "succeeded")]
    presubmit_status: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let _guard = match init_logging(LogConfig {
        app_name: "weetbix-ingester",
        verbose: cli.verbose,
        log_dir: cli.log_dir.clone(),
    }) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("Failed to initialize logging: {:#}", err);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("Failed to start runtime: {}", err);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)?;
    if let Some(url) = cli.database {
        config.database.url = url;
    }

    let db = WeetbixDb::open_url(&config.database.url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?
        .with_max_rows_per_commit(config.ingestion.max_rows_per_commit);

    match cli.command {
        Command::Init => {
            info!(url = %config.database.url, "Schema ready");
            println!("Initialized {}", config.database.url);
            Ok(())
        }
        Command::Enqueue(args) => enqueue(&db, args).await,
        Command::Run { once, insecure } => run(db, &config, once, insecure).await,
        Command::Stats => {
            let stats = db.queue_stats().await?;
            println!(
                "total={} queued={} running={} completed={} failed={}",
                stats.total, stats.queued, stats.running, stats.completed, stats.failed
            );
            Ok(())
        }
    }
}

fn load_config(path: &std::path::Path) -> Result<IngesterConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(IngesterConfig::default());
    }
    IngesterConfig::load(path).with_context(|| format!("Failed to load {}", path.display()))
}

async fn enqueue(db: &WeetbixDb, args: EnqueueArgs) -> Result<()> {
    let presubmit_run = match args.presubmit_id {
        Some(id) => Some(PresubmitRun {
            presubmit_run_id: PresubmitRunId {
                system: args.presubmit_system,
                id,
            },
            owner: args.presubmit_owner,
            mode: PresubmitRunMode::parse(&args.presubmit_mode)
                .with_context(|| format!("Unknown presubmit mode: {}", args.presubmit_mode))?,
            status: parse_presubmit_status(&args.presubmit_status)?,
        }),
        None => None,
    };

    let task = IngestionTask {
        build: BuildRef {
            host: args.host,
            id: args.build_id,
            project: args.project,
        },
        presubmit_run,
        partition_time: args.partition_time.unwrap_or_else(Utc::now),
        page_token: String::new(),
        task_index: 0,
    };

    if db.create_ingestion(&task).await? {
        println!("Enqueued {}", task.build.key());
    } else {
        println!("Already enqueued {}", task.build.key());
    }
    Ok(())
}

fn parse_presubmit_status(raw: &str) -> Result<PresubmitRunStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "succeeded" => Ok(PresubmitRunStatus::Succeeded),
        "failed" => Ok(PresubmitRunStatus::Failed),
        "canceled" => Ok(PresubmitRunStatus::Canceled),
        other => bail!("Unknown presubmit status: {}", other),
    }
}

async fn run(db: WeetbixDb, config: &IngesterConfig, once: bool, insecure: bool) -> Result<()> {
    let mut prpc = PrpcClient::new(config.clients.request_timeout())?;
    if insecure {
        prpc = prpc.insecure();
    }
    let sink = Arc::new(db.clone());
    let collaborators = Collaborators {
        builds: Arc::new(HttpBuildClient::new(prpc.clone())),
        results: Arc::new(HttpResultSourceClient::new(prpc)),
        configs: Arc::new(StaticConfigProvider::from_config(config)),
        clustering: sink.clone(),
        collector: sink,
    };

    let metrics = Arc::new(IngestionMetrics::new());
    let handler = IngestionHandler::new(
        db.clone(),
        collaborators,
        HandlerSettings::from(&config.ingestion),
    )
    .with_limiter(TaskLimiter::new(config.ingestion.max_concurrent_tasks))
    .with_metrics(Arc::clone(&metrics));

    let (runner, stop) = TaskRunner::new(db, Arc::new(handler), &config.ingestion);

    if once {
        let attempts = runner.run_until_idle().await?;
        info!(attempts, "Queue drained");
    } else {
        let mut handle = tokio::spawn(runner.run());
        tokio::select! {
            joined = &mut handle => {
                joined.context("Task runner panicked")??;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl-C, shutting down");
                let _ = stop.send(()).await;
                match tokio::time::timeout(Duration::from_secs(SHUTDOWN_TIMEOUT_SECS), handle).await {
                    Ok(joined) => joined.context("Task runner panicked")??,
                    Err(_) => warn!("Timed out waiting for in-flight tasks"),
                }
            }
        }
    }

    print!("{}", metrics.prometheus_format());
    Ok(())
}

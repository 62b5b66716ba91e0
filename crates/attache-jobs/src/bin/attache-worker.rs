//! attache-worker: drains the deferred purge queue.
//!
//! Runs continuously until Ctrl-C by default. `--once` drains the queue and
//! exits; `--sweep` additionally purges old unattached blobs first.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use attache_core::defaults::POOL_METRICS_INTERVAL_SECS;
use attache_core::AttacheConfig;
use attache_db::{log_pool_metrics, Database, FilesystemBackend, PoolConfig};
use attache_jobs::{PurgeHandler, WorkerBuilder, WorkerConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "attache-worker")]
#[command(author, version, about = "Deferred purge worker for attache")]
struct Cli {
    /// Drain the queue once and exit instead of polling
    #[arg(long)]
    once: bool,

    /// Purge old unattached blobs before processing tasks
    #[arg(long)]
    sweep: bool,

    /// Run schema migrations on startup
    #[arg(long)]
    migrate: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Log file path (daily rotation); logs go to stdout when absent
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(
    format: LogFormat,
    log_file: Option<&Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "attache_jobs=info,attache_db=info,attache_worker=info".into());
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_file {
        Some(path) => {
            let dir = path.parent().unwrap_or(Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|f| f.to_str())
                .unwrap_or("attache-worker.log");
            let appender = tracing_appender::rolling::daily(dir, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            match format {
                LogFormat::Json => registry
                    .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
                    .init(),
                LogFormat::Text => registry
                    .with(
                        tracing_subscriber::fmt::layer()
                            .with_writer(non_blocking)
                            .with_ansi(false),
                    )
                    .init(),
            }
            Some(guard)
        }
        None => {
            match format {
                LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
                LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
            }
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.log_format, cli.log_file.as_deref());

    let config = AttacheConfig::from_env()?;
    let database_url = config
        .database_url
        .clone()
        .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;

    let db = Database::connect_with_config(&database_url, PoolConfig::from_env()?).await?;
    if cli.migrate {
        #[cfg(feature = "migrations")]
        db.migrate().await?;
        #[cfg(not(feature = "migrations"))]
        anyhow::bail!("--migrate requires the `migrations` feature");
    }

    let backend = FilesystemBackend::new(&config.storage_root);
    backend.validate().await?;
    let registry = db.registry(backend, config.signed_id_codec()?);

    if cli.sweep {
        let purged = registry
            .sweep_unattached(db.slots.as_ref(), config.sweep_min_age)
            .await?;
        info!(purged, "Sweep finished");
    }

    let worker_config = WorkerConfig::from_env();
    let worker = WorkerBuilder::new(db.tasks.clone())
        .with_config(worker_config)
        .with_handler(PurgeHandler::new(registry, db.slots.clone()))
        .build();

    if cli.once {
        let executed = worker.run_until_empty().await?;
        info!(executed, "Queue drained");
        log_pool_metrics(db.pool());
        return Ok(());
    }

    let pool = db.pool().clone();
    let metrics = tokio::spawn(async move {
        let mut ticks = tokio::time::interval(Duration::from_secs(POOL_METRICS_INTERVAL_SECS));
        loop {
            ticks.tick().await;
            log_pool_metrics(&pool);
        }
    });

    let handle = worker.start();
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    handle.shutdown().await?;
    metrics.abort();
    info!("Worker stopped");
    Ok(())
}

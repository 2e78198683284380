//! aigcpaneld – entry point.
//!
//! Startup order:
//! 1. Parse command-line arguments and configuration from environment variables.
//! 2. Initialise structured tracing (JSON when requested).
//! 3. Open the SQLite task database, run migrations, requeue interrupted tasks.
//! 4. Wire the model registry, media tool and runner factory.
//! 5. Run the task scheduler until SIGINT/SIGTERM.

mod config;
mod db;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aigcpanel_core::runner::RunnerOptions;
use aigcpanel_core::{
    CancellationRegistry, FfmpegTool, FileModelRegistry, ProcessRunnerFactory, TaskScheduler, TaskStore,
};
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteTaskStore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "aigcpaneld")]
#[command(about = "Runs queued aigcpanel tasks against local model servers")]
#[command(version)]
struct Args {
    /// Data directory (overrides AIGCPANEL_DATA_DIR)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Register a model from its config.json, then exit
    #[arg(long, value_name = "CONFIG_JSON")]
    register_model: Option<PathBuf>,

    /// Process the queue once, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let args = Args::parse();
    let cfg = Config::from_env(args.data_dir);

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: AIGCPANEL_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), data_dir = %cfg.data_dir.display(), "aigcpaneld starting");

    let registry = Arc::new(FileModelRegistry::new(&cfg.model_registry));
    if let Some(config_json) = args.register_model {
        let record = registry
            .register(&config_json)
            .with_context(|| format!("registering {}", config_json.display()))?;
        info!(key = %record.key, path = %record.local_path, "model registered");
        return Ok(());
    }

    // ── 3. Database ────────────────────────────────────────────────────────────
    tokio::fs::create_dir_all(&cfg.data_dir)
        .await
        .with_context(|| format!("creating {}", cfg.data_dir.display()))?;
    let store = Arc::new(SqliteTaskStore::connect(&cfg.database_url).await?);
    info!(database_url = %cfg.database_url, "database ready");

    let requeued = store.requeue_interrupted().await?;
    if requeued > 0 {
        warn!(requeued, "requeued tasks interrupted by the previous shutdown");
    }

    // ── 4. Collaborators ───────────────────────────────────────────────────────
    let sidecar = FfmpegTool::from_sidecar();
    let media = match (&cfg.ffmpeg, &cfg.ffprobe) {
        (None, None) => sidecar,
        (ffmpeg, ffprobe) => FfmpegTool::new(
            ffmpeg.clone().unwrap_or_else(|| sidecar.ffmpeg().to_path_buf()),
            ffprobe.clone().unwrap_or_else(|| sidecar.ffprobe().to_path_buf()),
        ),
    };
    info!(ffmpeg = %media.ffmpeg().display(), ffprobe = %media.ffprobe().display(), "media tool ready");

    let scheduler = Arc::new(TaskScheduler::new(
        store,
        registry,
        Arc::new(ProcessRunnerFactory::new(RunnerOptions::default())),
        Arc::new(CancellationRegistry::new()),
        Arc::new(media),
        cfg.scheduler.clone(),
    ));

    // ── 5. Scheduler with graceful shutdown ────────────────────────────────────
    if args.once {
        let processed = scheduler.run_once().await?;
        info!(processed, "queue drained once");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let mut worker = scheduler.spawn(shutdown.clone());
    shutdown_signal().await;
    shutdown.cancel();

    // A task still running after the grace period is killed with its model
    // process and requeued on the next start.
    match tokio::time::timeout(SHUTDOWN_GRACE, &mut worker).await {
        Ok(joined) => joined?,
        Err(_) => {
            warn!(grace_secs = SHUTDOWN_GRACE.as_secs(), "scheduler still busy; aborting in-flight task");
            worker.abort();
        }
    }

    info!("aigcpaneld stopped");
    Ok(())
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; stopping scheduler");
}

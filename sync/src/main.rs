//! Workmirror sync - one-directional workspace file sync.
//!
//! This binary watches a workspace and forwards changed files, in batches,
//! to a receiving server or to stdout.
//!
//! # Commands
//!
//! - `workmirror-sync run <WORKSPACE>`: Sync a workspace until interrupted
//! - `workmirror-sync check-ignore <WORKSPACE> <PATH>...`: Show which paths would be synced
//!
//! # Environment Variables
//!
//! See `workmirror_sync::config` for available configuration options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use workmirror_sync::config::Config;
use workmirror_sync::emitter::{Emitter, HttpEmitter, StdoutEmitter};
use workmirror_sync::ignore_rules::IgnoreMatcher;
use workmirror_sync::manager::SyncManager;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Workmirror sync - one-directional workspace file sync.
///
/// Watches a workspace and forwards changed files to a server in
/// size-bounded batches.
#[derive(Parser, Debug)]
#[command(name = "workmirror-sync")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "\
ENVIRONMENT VARIABLES:
    WORKMIRROR_SERVER_URL          Receiving server (default: write batches to stdout)
    WORKMIRROR_AUTH_TOKEN          Bearer token for the server
    WORKMIRROR_IGNORE_FILE         Ignore file name (default: .gitignore)
    WORKMIRROR_DEBOUNCE_MS         Quiet period before a flush (default: 500)
    WORKMIRROR_RETRY_DELAY_MS      Delay before retrying a failed flush (default: 2000)
    WORKMIRROR_ECHO_TTL_MS         Echo suppression window (default: 3000)
    WORKMIRROR_EMIT_TIMEOUT_SECS   Upper bound per delivery, 0 disables (default: 60)
    WORKMIRROR_STABILITY_MS        Write stabilization threshold, 0 disables (default: 300)
    RUST_LOG                       Log filter (default: info)

EXAMPLES:
    # Sync a workspace to a server
    export WORKMIRROR_SERVER_URL=https://mirror.example.com
    workmirror-sync run ./my-project --run-id build-42

    # Print batches as JSON lines instead
    workmirror-sync run ./my-project

    # Check the ignore rules
    workmirror-sync check-ignore ./my-project node_modules/x.js src/main.rs
")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Sync a workspace until interrupted.
    ///
    /// Batches go to WORKMIRROR_SERVER_URL when set, otherwise to stdout.
    Run {
        /// Workspace directory to sync.
        workspace: PathBuf,

        /// Run identifier attached to every batch (default: random UUID).
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Show whether each path would be synced or ignored.
    CheckIgnore {
        /// Workspace directory whose ignore file applies.
        workspace: PathBuf,

        /// Paths relative to the workspace. A trailing `/` marks a directory.
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    match cli.command {
        Command::CheckIgnore { workspace, paths } => run_check_ignore(&workspace, &paths),
        Command::Run { workspace, run_id } => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to create tokio runtime")?;

            runtime.block_on(run_sync(workspace, run_id))
        }
    }
}

/// Prints `ignored` or `synced` for each path.
fn run_check_ignore(workspace: &std::path::Path, paths: &[String]) -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let matcher = IgnoreMatcher::build_with_file(workspace, &config.ignore_file)
        .context("Failed to compile ignore rules")?;

    for path in paths {
        let verdict = if matcher.ignores(path) { "ignored" } else { "synced" };
        println!("{verdict}\t{path}");
    }

    Ok(())
}

async fn run_sync(workspace: PathBuf, run_id: Option<String>) -> Result<()> {
    info!("Starting workmirror sync");

    let config = Config::from_env().context("Failed to load configuration")?;
    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        server_url = config.server_url.as_deref().unwrap_or("stdout"),
        ignore_file = %config.ignore_file,
        debounce_ms = config.debounce_ms,
        "Configuration loaded"
    );

    let emitter: Arc<dyn Emitter> = match &config.server_url {
        Some(url) => Arc::new(
            HttpEmitter::new(url, config.auth_token.clone())
                .context("Failed to create HTTP emitter")?,
        ),
        None => {
            if config.auth_token.is_some() {
                warn!("WORKMIRROR_AUTH_TOKEN is set without WORKMIRROR_SERVER_URL, ignoring");
            }
            Arc::new(StdoutEmitter)
        }
    };

    let manager = SyncManager::new(emitter, config.to_sync_options());

    manager
        .start_sync(&run_id, workspace.clone())
        .await
        .with_context(|| format!("Failed to start sync for {}", workspace.display()))?;

    info!(
        run_id = %run_id,
        workspace = %workspace.display(),
        "Sync running. Press Ctrl+C to stop."
    );

    wait_for_shutdown().await;
    info!("Shutting down...");

    let shutdown = tokio::time::timeout(
        Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
        manager.dispose_all(),
    )
    .await;

    if shutdown.is_err() {
        error!(
            timeout_secs = SHUTDOWN_TIMEOUT_SECS,
            "Sessions did not stop in time"
        );
    }

    info!("Sync stopped");
    Ok(())
}

/// Initializes the logging subsystem.
///
/// Logs go to stderr so that stdout carries only batches.
fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

pub mod aggregation;
pub mod api;
pub mod business_time;
pub mod commands;
pub mod config;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod harvest;
pub mod history;
pub mod ingest;
pub mod model;
pub mod resolver;
pub mod scheduler;
pub mod storage;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "pisonet-ledger", version, about = "Daily ledger for coin-operated PC fleets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API and run the daily scheduler (default)
    Serve,
    /// Aggregate one business day and exit, for an external cron
    Aggregate {
        /// Business date `YYYY-MM-DD`; today when omitted
        #[arg(long)]
        date: Option<String>,
    },
    /// Store the harvest key in the OS keyring
    SetHarvestKey { key: String },
    /// Remove the harvest key from the OS keyring
    ClearHarvestKey,
}

/// Console plus daily rolling file under `{data_dir}/logs`.
fn init_logging(data_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pisonet_ledger_lib=debug"));

    let log_dir = diagnostics::log_dir(data_dir);
    diagnostics::prune_old_logs(&log_dir);
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, diagnostics::LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // The process logs until exit; dropping the guard would stop the writer.
    std::mem::forget(guard);
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let config = Config::from_env().context("loading configuration")?;
            init_logging(&config.data_dir);
            info!("Starting pisonet-ledger v{}", env!("CARGO_PKG_VERSION"));
            info!(?config, "Configuration loaded");

            let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
            runtime.block_on(serve(config))
        }
        Command::Aggregate { date } => {
            let config = Config::from_env_with_key(Zeroizing::new(String::new()))
                .context("loading configuration")?;
            init_logging(&config.data_dir);

            let db = db::init(&config.data_dir).context("opening ledger database")?;
            let now = Utc::now();
            let outcome = match date {
                Some(date_id) => {
                    aggregation::run_aggregation_for_date(&db, &config.clock, &date_id, now)
                }
                None => aggregation::run_daily_aggregation(&db, &config.clock, now),
            }?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Command::SetHarvestKey { key } => {
            let key = Zeroizing::new(key);
            if key.trim().is_empty() {
                anyhow::bail!("harvest key must not be empty");
            }
            storage::set_credential(storage::KEY_HARVEST_KEY, &key)
                .context("storing harvest key in the OS keyring")?;
            println!("Harvest key stored");
            Ok(())
        }
        Command::ClearHarvestKey => {
            storage::delete_credential(storage::KEY_HARVEST_KEY)
                .context("removing harvest key from the OS keyring")?;
            println!("Harvest key removed");
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let data_dir = config.data_dir.clone();
    let db = tokio::task::spawn_blocking(move || db::init(&data_dir))
        .await
        .context("database init task")?
        .context("opening ledger database")?;
    let db = Arc::new(db);

    let scheduler = if config.scheduler_enabled {
        Some(scheduler::start_daily_scheduler(
            db.clone(),
            config.clock,
            config.aggregation_time,
        ))
    } else {
        warn!("Daily aggregation scheduler disabled; runs must be triggered externally");
        None
    };

    let state = api::AppState::new(db, config.clock, config.harvest_key.clone());
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {e}");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("serving HTTP API")?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await;
    }
    info!("pisonet-ledger stopped");
    Ok(())
}

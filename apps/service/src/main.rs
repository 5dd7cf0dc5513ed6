#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shraga::config::Config;
use shraga::database::{LibsqlStore, initialize_database};
use shraga::monitoring::{ProbeRunner, Scheduler};
use shraga::pool;

#[derive(Debug, Parser)]
#[command(version, about = "Periodic HTTP uptime checks backed by a shared database")]
struct Args {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Missing .env is fine
    let _ = dotenvy::dotenv();

    let mut config = Config::from_config(args.config.as_ref()).context("loading config")?;
    config.apply_env();
    config.validate()?;

    if args.print_config {
        print!("{config}");
        return Ok(());
    }

    let format = logger::init(config.environment.is_production());
    info!(environment = %config.environment, ?format, "starting shraga");

    let pool = pool::open_local(&config.database.path, config.database.max_connections)
        .await
        .with_context(|| format!("opening database {}", config.database.path.display()))?;
    {
        let conn = pool.get().await.map_err(|e| anyhow::anyhow!("database pool: {e}"))?;
        initialize_database(&conn).await?;
    }

    let mut store = LibsqlStore::new(pool);
    if let Some(lease) = config.lock_lease() {
        store = store.with_lock_lease(lease);
    }

    let checker = ProbeRunner::new().context("building HTTP client")?;
    let scheduler = Scheduler::new(Arc::new(store), Arc::new(checker), config.scheduler_settings());

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    // Only ever returns once cancelled
    if let Err(e) = scheduler.run(cancel).await {
        info!(reason = %e, "scheduler exited");
    }

    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
                    _ = term.recv() => info!("received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }

    cancel.cancel();
}

//! hostpool scheduler entry point.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hostpool_scheduler::{Config, MaintenanceLoop};
use hostpool_store::Store;

/// Fleet maintenance loop: enroll, probe, expire, reconcile.
#[derive(Debug, Parser)]
#[command(name = "hostpool-scheduler")]
struct Args {
    /// Run a single maintenance tick and exit.
    #[arg(long)]
    once: bool,

    /// Loop interval in seconds (overrides SCHEDULER_INTERVAL).
    #[arg(long)]
    interval: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(secs) = args.interval {
        config.interval = Duration::from_secs(secs.max(1));
    }

    info!(
        interval_secs = config.interval.as_secs(),
        once = args.once,
        "Starting hostpool scheduler"
    );

    // The database routinely comes up after us; wait for it within reason.
    let store = Store::connect_with_retry(&config.store, Duration::from_secs(120)).await?;
    store.ensure_schema().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let maintenance = MaintenanceLoop::new(store, config);
    if args.once {
        maintenance.tick(&shutdown_rx).await;
        return Ok(());
    }

    maintenance.run(shutdown_rx).await;
    info!("Scheduler exiting");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

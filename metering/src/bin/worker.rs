//! Ledger background worker
//!
//! Runs the metering scheduler and the reconciliation auditor until
//! interrupted.

use anyhow::Context;
use metering::{Config, MeteringScheduler};
use std::sync::Arc;
use token_ledger::{spawn_notifier, spawn_reconciliation_task, Ledger, NotificationSink};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("Failed to load config from {}", path))?;
            config.apply_env()?;
            config
        }
        None => Config::from_env()?,
    };

    tracing::info!(
        service = %config.ledger.service_name,
        version = %config.ledger.service_version,
        data_dir = %config.ledger.data_dir.display(),
        "Starting ledger worker"
    );

    let notifier = spawn_notifier(config.ledger.ledger.notification_buffer);
    let sink: Arc<dyn NotificationSink> = Arc::new(notifier.clone());

    // Open ledger
    let ledger = Arc::new(
        Ledger::open(config.ledger.clone())
            .context("Failed to open ledger")?
            .with_sink(sink.clone()),
    );
    tracing::info!("Ledger opened successfully");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciliation = spawn_reconciliation_task(
        ledger.auditor(),
        config.ledger.reconciliation.interval(),
        shutdown_rx.clone(),
    );

    let scheduler = Arc::new(MeteringScheduler::new(
        ledger.clone(),
        config.metering.clone(),
        sink,
    )?);
    let metering = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down ledger worker");

    shutdown_tx.send(true)?;
    metering.await?;
    reconciliation.await?;
    notifier.shutdown().await?;

    Ok(())
}

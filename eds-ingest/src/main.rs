use std::sync::Arc;

use anyhow::{Context, Result};
use eds_ingest::{
    config::{AppConfig, POLL_INTERVAL},
    metrics_server,
    observability,
    scheduler::AlignedTicker,
    sinks::{PgStorage, PostgresSink},
    sources::{EdsDeviceSource, HttpFetcher},
    Supervisor,
};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;
    cfg.validate()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    // Single-slot handoff: the acquirer waits while the writer is busy.
    let (tx, rx) = mpsc::channel(1);

    let fetcher = HttpFetcher::new(&cfg.device.url, cfg.device.request_timeout())?;
    let acquirer = EdsDeviceSource::new(
        fetcher,
        cfg.device.retry_policy(),
        AlignedTicker::new(POLL_INTERVAL)?,
        tx,
    );

    let storage = PgStorage::new(
        cfg.database.uri.clone(),
        cfg.database.max_connections,
        POLL_INTERVAL,
    );
    let writer = PostgresSink::new(storage, rx, cfg.database.flush_on_stop_timeout());

    let mut supervisor = Supervisor::new("main", cfg.supervisor.restart_delay());
    supervisor.add(Arc::new(writer));
    supervisor.add(Arc::new(acquirer));
    let supervisor = Arc::new(supervisor);

    let running = tokio::spawn({
        let supervisor = Arc::clone(&supervisor);
        async move { supervisor.serve().await }
    });

    wait_for_shutdown().await?;

    supervisor.stop();
    running.await.context("joining supervisor")?;

    tracing::info!("eds-ingest stopped");
    Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("listening for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    Ok(())
}

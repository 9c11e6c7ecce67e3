use std::net::SocketAddr;

use anyhow::Context;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the Prometheus recorder and serve it on `/metrics`.
pub fn init(bind_addr: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid metrics bind address {bind_addr}"))?;

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing Prometheus metrics recorder")?;

    // Ignore error if the handle was already set; this should only be called once.
    let _ = PROM_HANDLE.set(handle);
    describe();

    tokio::spawn(async move {
        let app = Router::new().route("/metrics", get(metrics_handler));

        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(%addr, "metrics server listening");
                if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                    tracing::error!(error = %e, "metrics server error");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to bind metrics listener");
            }
        }
    });

    Ok(())
}

fn describe() {
    metrics::describe_counter!("eds_fetch_attempts_total", "HTTP requests sent to the device");
    metrics::describe_counter!("eds_fetch_failures_total", "Device requests that failed or returned non-200");
    metrics::describe_counter!("eds_datapoints_acquired_total", "Datapoints parsed from the device");
    metrics::describe_counter!("eds_datapoints_persisted_total", "Datapoints committed to the env table");
    metrics::describe_counter!("eds_persist_failures_total", "Failed persist transactions");
    metrics::describe_counter!("eds_service_restarts_total", "Supervisor restarts per service");
    metrics::describe_gauge!("eds_pending_buffer_len", "Datapoints waiting to be committed");
}

async fn metrics_handler() -> String {
    PROM_HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::pipeline::Service;

/// Keeps a fixed set of services running.
///
/// Whenever a child's `serve` returns, whether with an error, cleanly, or by
/// panicking, it is started again unless the supervisor is shutting down.
/// There is no restart limit.
pub struct Supervisor {
    name: String,
    services: Vec<Arc<dyn Service>>,
    restart_delay: Duration,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, restart_delay: Duration) -> Self {
        Self {
            name: name.into(),
            services: Vec::new(),
            restart_delay,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn add(&mut self, service: Arc<dyn Service>) {
        self.services.push(service);
    }

    /// Run every child until [`Supervisor::stop`] is called and all of them
    /// have returned.
    pub async fn serve(&self) {
        tracing::info!(supervisor = %self.name, children = self.services.len(), "supervisor starting");

        let mut children = JoinSet::new();
        for service in &self.services {
            children.spawn(supervise(
                Arc::clone(service),
                self.shutdown.clone(),
                self.restart_delay,
            ));
        }

        while let Some(res) = children.join_next().await {
            if let Err(e) = res {
                tracing::error!(supervisor = %self.name, error = %e, "supervision task failed");
            }
        }

        tracing::info!(supervisor = %self.name, "supervisor stopped");
    }

    /// Stop all children and keep them from being restarted.
    pub fn stop(&self) {
        self.shutdown.cancel();
        for service in &self.services {
            service.stop();
        }
    }
}

async fn supervise(service: Arc<dyn Service>, shutdown: CancellationToken, restart_delay: Duration) {
    let name = service.name().to_string();

    while !shutdown.is_cancelled() {
        // Separate task so a panic inside the service is caught here.
        let run = tokio::spawn({
            let service = Arc::clone(&service);
            async move { service.serve().await }
        });

        match run.await {
            Ok(Ok(())) => tracing::info!(service = %name, "service exited"),
            Ok(Err(e)) => tracing::error!(service = %name, error = %e, "service failed"),
            Err(e) => tracing::error!(service = %name, error = %e, "service panicked"),
        }

        if shutdown.is_cancelled() {
            break;
        }

        metrics::counter!("eds_service_restarts_total", "service" => name.clone()).increment(1);
        tracing::warn!(service = %name, delay_ms = restart_delay.as_millis() as u64, "restarting service");

        if !restart_delay.is_zero() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(restart_delay) => {}
            }
        }
    }
}

use std::time::Duration;

use eds_client::Datapoint;
use futures::StreamExt;
use reqwest::StatusCode;
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::pipeline::{FetchError, Lifecycle, PipelineError, Service};
use crate::scheduler::AlignedTicker;
use crate::transform::parse_device_detail;

/// One GET against the device, returning the response body.
#[async_trait::async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self) -> Result<String, FetchError>;
}

/// Fetches the device detail document over HTTP.
pub struct HttpFetcher {
    http: reqwest::Client,
    url: String,
}

impl HttpFetcher {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("building HTTP client: {e}")))?;

        Ok(Self {
            http,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self) -> Result<String, FetchError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        // Only a plain 200 counts; redirects are followed by reqwest already.
        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }
}

/// Bounded attempts with linear backoff: attempt `n` waits `(n - 1) * backoff_step`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_step: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Sleep before the 1-indexed `attempt`; zero for the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt.saturating_sub(1)
    }
}

pub async fn fetch_with_retry<F>(fetcher: &F, policy: &RetryPolicy) -> Result<String, PipelineError>
where
    F: Fetch + ?Sized,
{
    let mut attempt: u32 = 1;
    loop {
        metrics::counter!("eds_fetch_attempts_total").increment(1);

        match fetcher.fetch().await {
            Ok(body) => return Ok(body),
            Err(e) if attempt < policy.max_attempts => {
                metrics::counter!("eds_fetch_failures_total").increment(1);
                attempt += 1;
                let sleep_for = policy.delay_before(attempt);
                tracing::warn!(
                    error = %e,
                    next_attempt = attempt,
                    backoff_ms = sleep_for.as_millis() as u64,
                    "device fetch failed, retrying"
                );
                tokio::time::sleep(sleep_for).await;
            }
            Err(e) => {
                metrics::counter!("eds_fetch_failures_total").increment(1);
                tracing::error!(error = %e, attempts = attempt, "device fetch failed, giving up");
                return Err(PipelineError::Fetch {
                    attempts: attempt,
                    last: e,
                });
            }
        }
    }
}

/// One acquisition cycle: fetch with retries, then parse.
pub async fn acquire<F>(fetcher: &F, policy: &RetryPolicy) -> Result<Datapoint, PipelineError>
where
    F: Fetch + ?Sized,
{
    let body = fetch_with_retry(fetcher, policy).await?;
    let dp = parse_device_detail(&body, OffsetDateTime::now_utc())?;
    metrics::counter!("eds_datapoints_acquired_total").increment(1);
    Ok(dp)
}

/// Samples the device on every tick and hands datapoints to the writer.
///
/// A failed acquisition ends the run with an error; restarting is left to the
/// supervisor. Sending blocks while the writer is busy.
pub struct EdsDeviceSource<F> {
    fetcher: F,
    policy: RetryPolicy,
    ticker: AlignedTicker,
    out: mpsc::Sender<Datapoint>,
    lifecycle: Lifecycle,
}

impl<F: Fetch> EdsDeviceSource<F> {
    pub fn new(fetcher: F, policy: RetryPolicy, ticker: AlignedTicker, out: mpsc::Sender<Datapoint>) -> Self {
        Self {
            fetcher,
            policy,
            ticker,
            out,
            lifecycle: Lifecycle::default(),
        }
    }
}

#[async_trait::async_trait]
impl<F: Fetch + 'static> Service for EdsDeviceSource<F> {
    fn name(&self) -> &str {
        "acquirer"
    }

    async fn serve(&self) -> Result<(), PipelineError> {
        let run = self.lifecycle.begin();
        let cancel = run.token().clone();
        tracing::info!(interval_secs = self.ticker.interval().as_secs_f64(), "acquirer starting");

        let ticks = self.ticker.ticks(cancel.clone());
        tokio::pin!(ticks);

        let result = loop {
            let Some(tick) = ticks.next().await else {
                break Ok(());
            };
            tracing::debug!(%tick, "tick");

            let dp = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                res = acquire(&self.fetcher, &self.policy) => match res {
                    Ok(dp) => dp,
                    Err(e) => {
                        tracing::error!(error = %e, "acquisition failed (fatal)");
                        break Err(e);
                    }
                },
            };
            tracing::debug!(temperature = dp.temperature, watt_hours = dp.watt_hours, "acquired");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                res = self.out.send(dp) => {
                    if res.is_err() {
                        break Err(PipelineError::ChannelClosed);
                    }
                }
            }
        };

        tracing::info!("acquirer exiting");
        result
    }

    fn stop(&self) {
        self.lifecycle.stop();
    }
}

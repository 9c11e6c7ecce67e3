use anyhow::Result;
use eds_ingest::{
    config::AppConfig,
    observability,
    sources::{acquire, HttpFetcher},
};

/// Run one acquisition cycle against the configured device and print the
/// resulting datapoint. Nothing is written to the database.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    cfg.device.validate()?;

    let fetcher = HttpFetcher::new(&cfg.device.url, cfg.device.request_timeout())?;
    let dp = acquire(&fetcher, &cfg.device.retry_policy()).await?;

    println!("{}", serde_json::to_string_pretty(&dp)?);

    Ok(())
}

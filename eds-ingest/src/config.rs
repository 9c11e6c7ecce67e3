use serde::Deserialize;
use std::{env, fs, io, time::Duration};

use anyhow::Context;

use crate::pipeline::PipelineError;
use crate::sources::RetryPolicy;

/// How often the device is sampled. Ticks fall on whole minutes.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_CONFIG_PATH: &str = "eds-config.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub url: String,
    pub request_timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_step_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            request_timeout_ms: 30_000,
            max_attempts: 5,
            backoff_step_ms: 1_000,
        }
    }
}

impl DeviceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_step: Duration::from_millis(self.backoff_step_ms),
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.url.trim().is_empty() {
            return Err(PipelineError::Config(
                "device url is empty (set EDSURL or device.url)".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PipelineError::Config("device.max_attempts must be >= 1".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(PipelineError::Config("device.request_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub uri: String,
    pub max_connections: u32,
    pub flush_on_stop_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            max_connections: 2,
            flush_on_stop_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn flush_on_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_on_stop_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.uri.trim().is_empty() {
            return Err(PipelineError::Config(
                "database uri is empty (set CONNSTRING or database.uri)".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(PipelineError::Config("database.max_connections must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub restart_delay_ms: u64,
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceConfig,
    pub database: DatabaseConfig,
    pub supervisor: SupervisorConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Read `$EDS_CONFIG` (or `eds-config.toml` when present), then apply the
    /// `EDSURL` and `CONNSTRING` environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let explicit = env::var("EDS_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut cfg = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents).with_context(|| format!("parsing {path}"))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound && explicit.is_none() => Self::default(),
            Err(e) => return Err(e).with_context(|| format!("reading {path}")),
        };

        cfg.apply_overrides(env::var("EDSURL").ok(), env::var("CONNSTRING").ok());
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Non-empty values replace whatever the file said.
    pub fn apply_overrides(&mut self, url: Option<String>, connstring: Option<String>) {
        if let Some(url) = url.filter(|v| !v.is_empty()) {
            self.device.url = url;
        }
        if let Some(uri) = connstring.filter(|v| !v.is_empty()) {
            self.database.uri = uri;
        }
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        self.device.validate()?;
        self.database.validate()
    }
}

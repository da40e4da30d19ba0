//! Configuration for the scheduler and worker binaries, loaded from a single
//! shared `config.toml`.
//!
//! A flat struct with `#[serde(default = "...")]` per tunable and a
//! `validate()` method that rejects out-of-range values before the daemon
//! starts, rather than failing confusingly deep inside a control loop.

use serde::{Deserialize, Serialize};
use std::path::Path;

fn default_database_busy_timeout_seconds() -> u64 {
    5
}

fn default_http_client_timeout_seconds() -> u64 {
    20
}

fn default_parsing_worker_count() -> usize {
    4
}

fn default_graceful_shutdown_timeout_seconds() -> u64 {
    30
}

fn default_proxy_rate_limit_cooloff_seconds() -> i64 {
    300
}

fn default_bus_poll_interval_ms() -> u64 {
    500
}

fn default_scheduler_tick_interval_ms() -> u64 {
    1_000
}

fn default_wal_checkpoint_interval_seconds() -> u64 {
    60
}

fn default_bus_redelivery_sweep_interval_seconds() -> u64 {
    15
}

/// Configuration shared by the `scheduler` and `worker` binaries, loaded
/// from `config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemConfig {
    /// Path to the SQLite database file shared by every component.
    pub database_path: String,

    /// SQLite `busy_timeout` applied to every connection (default: 5).
    #[serde(default = "default_database_busy_timeout_seconds")]
    pub database_busy_timeout_seconds: u64,

    /// WAL checkpoint interval in seconds (default: 60).
    #[serde(default = "default_wal_checkpoint_interval_seconds")]
    pub wal_checkpoint_interval_seconds: u64,

    /// Directory for rolling log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    /// Optional webhook URL the result processor posts match notifications
    /// to. When absent, notifications are logged only.
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// HTTP client timeout used by the fetcher and the webhook notifier
    /// (default: 20s).
    #[serde(default = "default_http_client_timeout_seconds")]
    pub http_client_timeout_seconds: u64,

    /// Number of parsing worker loops to run concurrently (default: 4).
    #[serde(default = "default_parsing_worker_count")]
    pub parsing_worker_count: usize,

    /// Wait time for in-flight work during shutdown in seconds (default: 30).
    #[serde(default = "default_graceful_shutdown_timeout_seconds")]
    pub graceful_shutdown_timeout_seconds: u64,

    /// How long a rate-limited proxy stays blocked before it is eligible for
    /// leasing again, in seconds (default: 300 — see design notes).
    #[serde(default = "default_proxy_rate_limit_cooloff_seconds")]
    pub proxy_rate_limit_cooloff_seconds: i64,

    /// How often a worker polls the bus for new work when idle, in
    /// milliseconds (default: 500).
    #[serde(default = "default_bus_poll_interval_ms")]
    pub bus_poll_interval_ms: u64,

    /// How often the scheduler ticks to look for due tasks, in milliseconds
    /// (default: 1000).
    #[serde(default = "default_scheduler_tick_interval_ms")]
    pub scheduler_tick_interval_ms: u64,

    /// How often the bus sweeps `sending` messages whose lease has expired
    /// back to `pending` for redelivery, in seconds (default: 15).
    #[serde(default = "default_bus_redelivery_sweep_interval_seconds")]
    pub bus_redelivery_sweep_interval_seconds: u64,
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl SystemConfig {
    /// Loads configuration from a TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::MonitoringError::Config(format!(
                "failed to read config file {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let config: SystemConfig = toml::from_str(&text)
            .map_err(|e| crate::MonitoringError::Config(format!("invalid config TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration, rejecting obviously unusable values.
    pub fn validate(&self) -> crate::Result<()> {
        if self.database_path.is_empty() {
            return Err(
                crate::MonitoringError::Config("database_path cannot be empty".to_string()).into(),
            );
        }

        if self.database_busy_timeout_seconds == 0 {
            return Err(crate::MonitoringError::Config(
                "database_busy_timeout_seconds must be at least 1".to_string(),
            )
            .into());
        }

        if self.parsing_worker_count == 0 {
            return Err(crate::MonitoringError::Config(
                "parsing_worker_count must be at least 1".to_string(),
            )
            .into());
        }

        if self.proxy_rate_limit_cooloff_seconds <= 0 {
            return Err(crate::MonitoringError::Config(
                "proxy_rate_limit_cooloff_seconds must be positive".to_string(),
            )
            .into());
        }

        if let Some(url) = &self.webhook_url {
            if url::Url::parse(url).is_err() {
                return Err(
                    crate::MonitoringError::Config(format!("invalid webhook_url: {url}")).into(),
                );
            }
        }

        Ok(())
    }
}

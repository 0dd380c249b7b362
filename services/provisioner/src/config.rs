use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use pgfleet_reconcile::DEFAULT_RECONCILE_INTERVAL;

use crate::db::DbConfig;
use crate::provider::{TimewebConfig, DEFAULT_API_URL, DEFAULT_TIMEOUT};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    /// In-memory store and mock provider; nothing leaves the process.
    pub dev_mode: bool,
    pub database: DbConfig,
    /// Unset without `TIMEWEB_API_TOKEN`.
    pub provider: Option<TimewebConfig>,
    pub reconcile_interval: Duration,
    /// TOML plan catalogue replacing the built-in one.
    pub plans_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = std::env::var("PGFLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = std::env::var("PGFLEET_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let database = DbConfig::from_env();

        let provider_timeout = match std::env::var("PGFLEET_PROVIDER_TIMEOUT_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .context("PGFLEET_PROVIDER_TIMEOUT_SECS must be a number of seconds")?,
            ),
            Err(_) => DEFAULT_TIMEOUT,
        };

        let provider = std::env::var("TIMEWEB_API_TOKEN")
            .ok()
            .filter(|token| !token.is_empty())
            .map(|token| TimewebConfig {
                base_url: std::env::var("TIMEWEB_API_URL")
                    .unwrap_or_else(|_| DEFAULT_API_URL.to_string()),
                token,
                timeout: provider_timeout,
            });

        let reconcile_interval = match std::env::var("PGFLEET_RECONCILE_INTERVAL_SECS") {
            Ok(v) => Duration::from_secs(
                v.parse()
                    .context("PGFLEET_RECONCILE_INTERVAL_SECS must be a number of seconds")?,
            ),
            Err(_) => DEFAULT_RECONCILE_INTERVAL,
        };

        let plans_file = std::env::var_os("PGFLEET_PLANS_FILE").map(PathBuf::from);

        Ok(Self {
            log_level,
            dev_mode,
            database,
            provider,
            reconcile_interval,
            plans_file,
        })
    }
}

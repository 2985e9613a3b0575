//! Configuration management for the agent.

use ferry_engine::SyncConfig;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control API host address
    pub host: String,
    /// Control API port
    pub port: u16,
    /// SQLite connection URL
    pub database_url: String,
    /// Base URL of the remote API, without trailing slash
    pub remote_base_url: String,
    /// Bearer token sent to the remote API
    pub remote_token: Option<String>,
    pub remote_timeout: Duration,
    /// Period of the reachability probe
    pub probe_interval: Duration,
    /// Bearer token required by the control API, if set
    pub auth_secret: Option<String>,
    /// Engine tuning
    pub sync: SyncConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup("HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port = lookup("PORT")
            .unwrap_or_else(|| "4820".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://ferry.db?mode=rwc".to_string());

        let remote_base_url = lookup("REMOTE_BASE_URL")
            .ok_or(ConfigError::MissingRemoteBaseUrl)?
            .trim_end_matches('/')
            .to_string();

        let remote_timeout = Duration::from_millis(parse_or(&lookup, "REMOTE_TIMEOUT_MS", 10_000)?);
        let probe_interval = Duration::from_millis(parse_or(&lookup, "PROBE_INTERVAL_MS", 5_000)?);

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            sync_interval_ms: parse_or(&lookup, "SYNC_INTERVAL_MS", defaults.sync_interval_ms)?,
            max_retries: parse_or(&lookup, "MAX_RETRIES", defaults.max_retries)?,
            retry_delay_ms: parse_or(&lookup, "RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            batch_size: parse_or(&lookup, "BATCH_SIZE", defaults.batch_size)?,
            sync_enabled: parse_or(&lookup, "SYNC_ENABLED", defaults.sync_enabled)?,
            default_strategy: parse_or(&lookup, "CONFLICT_STRATEGY", defaults.default_strategy)?,
            ..defaults
        };
        sync.validate()
            .map_err(|e| ConfigError::InvalidSyncConfig(e.to_string()))?;

        Ok(Self {
            host,
            port,
            database_url,
            remote_base_url,
            remote_token: lookup("REMOTE_TOKEN").filter(|t| !t.is_empty()),
            remote_timeout,
            probe_interval,
            auth_secret: lookup("AUTH_SECRET").filter(|s| !s.is_empty()),
            sync,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("REMOTE_BASE_URL environment variable is required")]
    MissingRemoteBaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {0} value")]
    Invalid(&'static str),

    #[error("Invalid sync settings: {0}")]
    InvalidSyncConfig(String),
}

//! Configuration for the communication substrate.
//!
//! Layered the same way the rest of the stack loads config: compiled-in
//! defaults, overridden by environment variables prefixed `CVXC_`, overridden
//! again by whatever the embedding application passes in explicitly via
//! [`SubstrateConfig::builder`]. There is no config *file* layer here (no
//! profile directory, no CLI) since this crate has no binary of its own.

use std::time::Duration;

/// `CVXC_` environment variable names this crate reads at [`SubstrateConfig::from_env`] time.
pub mod env_keys {
    pub const ENV_STORAGE_URL: &str = "CVXC_STORAGE_URL";
    pub const ENV_STORAGE_USERNAME: &str = "CVXC_STORAGE_USERNAME";
    pub const ENV_STORAGE_PASSWORD: &str = "CVXC_STORAGE_PASSWORD";
    pub const ENV_STORAGE_DATABASE: &str = "CVXC_STORAGE_DATABASE";
    pub const ENV_POLL_INTERVAL_MS: &str = "CVXC_POLL_INTERVAL_MS";
    pub const ENV_MAX_RETRY_ATTEMPTS: &str = "CVXC_MAX_RETRY_ATTEMPTS";
    pub const ENV_RETRY_BASE_DELAY_MS: &str = "CVXC_RETRY_BASE_DELAY_MS";
    pub const ENV_REQUEST_TIMEOUT_SECS: &str = "CVXC_REQUEST_TIMEOUT_SECS";
}

/// Default poll interval for [`crate::poller`] background tasks.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
/// Default bound on [`crate::storage`] adapter retries, matching the
/// corpus-wide `retry_with_backoff` default.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Connection and tuning parameters for the document+edge storage backend.
///
/// Named `SubstrateConfig` rather than `DatabaseConfig` to avoid colliding
/// with configuration for unrelated backends this crate does not use.
#[derive(Debug, Clone)]
pub struct SubstrateConfig {
    /// Base URL of the storage backend, e.g. `http://localhost:8529`.
    pub url: String,
    pub username: String,
    pub password: String,
    /// Name of the database this substrate's collections live in.
    pub database: String,
    /// Interval pollers sleep between sweeps when there is no backlog.
    pub poll_interval: Duration,
    /// Bound on adapter-internal retries for idempotent operations.
    pub max_retry_attempts: u32,
    /// Base delay for the adapter's exponential backoff.
    pub retry_base_delay: Duration,
    /// Timeout applied to each HTTP request issued to the storage backend.
    pub request_timeout: Duration,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8529".to_string(),
            username: "root".to_string(),
            password: String::new(),
            database: "agency_substrate".to_string(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        }
    }
}

impl SubstrateConfig {
    /// Start from defaults, then apply any `CVXC_*` environment variables
    /// that are present. Missing variables keep the default; malformed
    /// numeric variables are ignored with a warning rather than failing
    /// startup, matching how the rest of the stack treats optional overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var(env_keys::ENV_STORAGE_URL) {
            config.url = url;
        }
        if let Ok(username) = std::env::var(env_keys::ENV_STORAGE_USERNAME) {
            config.username = username;
        }
        if let Ok(password) = std::env::var(env_keys::ENV_STORAGE_PASSWORD) {
            config.password = password;
        }
        if let Ok(database) = std::env::var(env_keys::ENV_STORAGE_DATABASE) {
            config.database = database;
        }
        if let Some(ms) = parse_env_u64(env_keys::ENV_POLL_INTERVAL_MS) {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_env_u64(env_keys::ENV_MAX_RETRY_ATTEMPTS) {
            config.max_retry_attempts = attempts as u32;
        }
        if let Some(ms) = parse_env_u64(env_keys::ENV_RETRY_BASE_DELAY_MS) {
            config.retry_base_delay = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_env_u64(env_keys::ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout = Duration::from_secs(secs);
        }

        config
    }
}

fn parse_env_u64(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, raw, "ignoring malformed numeric env override");
                None
            }
        },
        Err(_) => None,
    }
}

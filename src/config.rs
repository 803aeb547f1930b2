//! Configuration management for listsync

use std::env;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::sync::RetryPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub remote: RemoteConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub url: String,
    pub health_path: String,
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Timing and retry knobs of the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Bound on every remote call
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    /// How often an unreachable remote is re-probed
    pub probe_interval: Duration,
    pub retry: RetryPolicy,
    /// Pause between two operations of one drain
    pub inter_op_delay: Duration,
    /// Failed operations older than this are purged at startup
    pub purge_failed_after: Option<Duration>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            url: "http://localhost:8080".to_string(),
            health_path: "/health".to_string(),
            request_timeout: Duration::from_millis(5000),
            probe_timeout: Duration::from_millis(3000),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            url: "sqlite:./listsync.db".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            request_timeout: Duration::from_millis(5000),
            probe_timeout: Duration::from_millis(3000),
            probe_interval: Duration::from_millis(10000),
            retry: RetryPolicy::default(),
            inter_op_delay: Duration::from_millis(100),
            purge_failed_after: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            remote: RemoteConfig::default(),
            database: DatabaseConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Config {
    /// Read configuration from `LISTSYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        let request_timeout = millis("LISTSYNC_REQUEST_TIMEOUT_MS", 5000)?;
        let probe_timeout = millis("LISTSYNC_PROBE_TIMEOUT_MS", 3000)?;

        Ok(Config {
            remote: RemoteConfig {
                url: env::var("LISTSYNC_REMOTE_URL")
                    .map_err(|_| SyncError::Config("LISTSYNC_REMOTE_URL is not set".to_string()))?,
                health_path: env::var("LISTSYNC_HEALTH_PATH")
                    .unwrap_or_else(|_| "/health".to_string()),
                request_timeout,
                probe_timeout,
            },
            database: DatabaseConfig {
                url: env::var("LISTSYNC_DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:./listsync.db".to_string()),
            },
            sync: SyncConfig {
                request_timeout,
                probe_timeout,
                probe_interval: millis("LISTSYNC_PROBE_INTERVAL_MS", 10000)?,
                retry: RetryPolicy {
                    max_retries: number("LISTSYNC_MAX_RETRIES", 5)? as u32,
                    base: millis("LISTSYNC_BACKOFF_BASE_MS", 1000)?,
                    max: millis("LISTSYNC_BACKOFF_MAX_MS", 60000)?,
                },
                inter_op_delay: millis("LISTSYNC_INTER_OP_DELAY_MS", 100)?,
                purge_failed_after: match env::var("LISTSYNC_PURGE_FAILED_AFTER_DAYS") {
                    Ok(days) => Some(Duration::from_secs(parse(
                        "LISTSYNC_PURGE_FAILED_AFTER_DAYS",
                        &days,
                    )? * 86_400)),
                    Err(_) => None,
                },
            },
        })
    }
}

fn parse(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| SyncError::Config(format!("{} must be a non-negative integer, got '{}'", name, value)))
}

fn number(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => parse(name, &value),
        Err(_) => Ok(default),
    }
}

fn millis(name: &str, default: u64) -> Result<Duration> {
    number(name, default).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.database.url, "sqlite:./listsync.db");
        assert_eq!(config.sync.request_timeout, Duration::from_secs(5));
        assert_eq!(config.sync.retry.max_retries, 5);
        assert_eq!(config.sync.inter_op_delay, Duration::from_millis(100));
        assert!(config.sync.purge_failed_after.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse("X", " 42 ").unwrap(), 42);
        assert!(matches!(parse("X", "-1"), Err(SyncError::Config(_))));
    }
}

//! Support for runtime configuration options
//!
//! Every option can be overridden by an environment variable:
//!
//! | variable | default |
//! |---|---|
//! | `MIN_SYNC_INTERVAL` | 30 seconds |
//! | `MAX_SYNC_INTERVAL` | 3600 seconds |
//! | `SYNC_TIMEOUT` | 1800 seconds |
//! | `CLEANUP_INTERVAL` | 86400 seconds |
//! | `LOG_RETENTION_DAYS` | 30 |
//! | `STALE_MULTIPLIER` | 3 |
//! | `DEFER_FULL_RESYNC_DELETIONS` | true |

use std::time::Duration;

use crate::error::ConfigError;

const MIN_SYNC_INTERVAL: &str = "MIN_SYNC_INTERVAL";
const MAX_SYNC_INTERVAL: &str = "MAX_SYNC_INTERVAL";
const SYNC_TIMEOUT: &str = "SYNC_TIMEOUT";
const CLEANUP_INTERVAL: &str = "CLEANUP_INTERVAL";
const LOG_RETENTION_DAYS: &str = "LOG_RETENTION_DAYS";
const STALE_MULTIPLIER: &str = "STALE_MULTIPLIER";
const DEFER_FULL_RESYNC_DELETIONS: &str = "DEFER_FULL_RESYNC_DELETIONS";

/// Settings of the sync engine and its scheduler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncSettings {
    pub min_sync_interval: Duration,
    pub max_sync_interval: Duration,
    /// How long a run may last before it is cancelled
    pub sync_timeout: Duration,
    /// How often old run records are pruned
    pub cleanup_interval: Duration,
    pub log_retention_days: u32,
    /// A source is stale when it has not synced successfully for `stale_multiplier` times its interval
    pub stale_multiplier: u32,
    /// Wait for a second listing before deleting events that vanished from a full resync
    pub defer_full_resync_deletions: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            min_sync_interval: Duration::from_secs(30),
            max_sync_interval: Duration::from_secs(3600),
            sync_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(24 * 3600),
            log_retention_days: 30,
            stale_multiplier: 3,
            defer_full_resync_deletions: true,
        }
    }
}

impl SyncSettings {
    /// Read the settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read the settings from any variable lookup. Missing variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let settings = Self {
            min_sync_interval: seconds(&lookup, MIN_SYNC_INTERVAL, defaults.min_sync_interval)?,
            max_sync_interval: seconds(&lookup, MAX_SYNC_INTERVAL, defaults.max_sync_interval)?,
            sync_timeout: seconds(&lookup, SYNC_TIMEOUT, defaults.sync_timeout)?,
            cleanup_interval: seconds(&lookup, CLEANUP_INTERVAL, defaults.cleanup_interval)?,
            log_retention_days: positive(&lookup, LOG_RETENTION_DAYS, defaults.log_retention_days as u64)? as u32,
            stale_multiplier: positive(&lookup, STALE_MULTIPLIER, defaults.stale_multiplier as u64)? as u32,
            defer_full_resync_deletions: boolean(&lookup, DEFER_FULL_RESYNC_DELETIONS, defaults.defer_full_resync_deletions)?,
        };

        if settings.min_sync_interval > settings.max_sync_interval {
            return Err(ConfigError::InvertedBounds {
                min_variable: MIN_SYNC_INTERVAL,
                min: settings.min_sync_interval.as_secs(),
                max_variable: MAX_SYNC_INTERVAL,
                max: settings.max_sync_interval.as_secs(),
            });
        }
        Ok(settings)
    }

    /// Bound a source interval (in seconds) to the configured range
    pub fn clamp_interval(&self, seconds: u64) -> Duration {
        Duration::from_secs(seconds).clamp(self.min_sync_interval, self.max_sync_interval)
    }

    pub fn log_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.log_retention_days as i64)
    }
}

fn positive<F>(lookup: &F, variable: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = match lookup(variable) {
        None => return Ok(default),
        Some(raw) => raw,
    };
    let invalid = |reason: &str| ConfigError::InvalidValue {
        variable,
        value: raw.clone(),
        reason: reason.to_string(),
    };

    match raw.trim().parse::<u64>() {
        Err(_) => Err(invalid("not a positive integer")),
        Ok(0) => Err(invalid("must be greater than zero")),
        Ok(value) if value > u32::MAX as u64 => Err(invalid("too large")),
        Ok(value) => Ok(value),
    }
}

fn seconds<F>(lookup: &F, variable: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    positive(lookup, variable, default.as_secs()).map(Duration::from_secs)
}

fn boolean<F>(lookup: &F, variable: &'static str, default: bool) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(variable) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { variable, value: raw, reason: "not a boolean".to_string() }),
        },
    }
}

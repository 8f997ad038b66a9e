use std::str::FromStr;
use std::time::Duration;

use jokbo_core::quota::{QuotaPolicy, TokenRates};

use crate::queue::DEFAULT_MAX_RETRIES;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("Invalid value for {var}: {message}")]
    Invalid { var: &'static str, message: String },
}

/// Orchestrator settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub quota_policy: QuotaPolicy,
    pub token_rates: TokenRates,
    /// Idle time after which an unfinished job counts as stalled.
    pub stall_threshold: Duration,
    /// Age after which finished jobs and their results are purged.
    pub result_retention: Duration,
    pub retention_interval: Duration,
    pub watchdog_interval: Duration,
    pub max_task_retries: u32,
    /// Default page size of a user's job list.
    pub user_jobs_limit: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            quota_policy: QuotaPolicy::RequirePositive,
            token_rates: TokenRates::default(),
            stall_threshold: Duration::from_secs(10 * 60),
            result_retention: Duration::from_secs(720 * 3600),
            retention_interval: Duration::from_secs(3600),
            watchdog_interval: Duration::from_secs(300),
            max_task_retries: DEFAULT_MAX_RETRIES,
            user_jobs_limit: 50,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default            |
    /// |---------------------------------|--------------------|
    /// | `QUOTA_POLICY`                  | `require_positive` |
    /// | `FLASH_TOKENS_PER_CHUNK`        | `1`                |
    /// | `PRO_TOKENS_PER_CHUNK`          | `4`                |
    /// | `STALL_THRESHOLD_MINUTES`       | `10`               |
    /// | `RESULT_RETENTION_HOURS`        | `720`              |
    /// | `RETENTION_SWEEP_INTERVAL_SECS` | `3600`             |
    /// | `WATCHDOG_INTERVAL_SECS`        | `300`              |
    /// | `MAX_TASK_RETRIES`              | `3`                |
    /// | `USER_JOBS_LIMIT`               | `50`               |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Self::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let quota_policy = match lookup("QUOTA_POLICY") {
            Some(raw) => raw.parse::<QuotaPolicy>().map_err(|e| {
                ConfigError::Invalid {
                    var: "QUOTA_POLICY",
                    message: e.to_string(),
                }
            })?,
            None => defaults.quota_policy,
        };

        let token_rates = TokenRates {
            flash: parse_or(&lookup, "FLASH_TOKENS_PER_CHUNK", defaults.token_rates.flash)?,
            pro: parse_or(&lookup, "PRO_TOKENS_PER_CHUNK", defaults.token_rates.pro)?,
        };
        if token_rates.flash < 0 || token_rates.pro < 0 {
            return Err(ConfigError::Invalid {
                var: "FLASH_TOKENS_PER_CHUNK",
                message: "token rates must not be negative".to_string(),
            });
        }

        let stall_minutes: u64 = parse_or(&lookup, "STALL_THRESHOLD_MINUTES", 10)?;
        let retention_hours: u64 = parse_or(&lookup, "RESULT_RETENTION_HOURS", 720)?;
        let retention_secs: u64 = parse_or(&lookup, "RETENTION_SWEEP_INTERVAL_SECS", 3600)?;
        let watchdog_secs: u64 = parse_or(&lookup, "WATCHDOG_INTERVAL_SECS", 300)?;
        if retention_secs == 0 || watchdog_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "RETENTION_SWEEP_INTERVAL_SECS",
                message: "sweep intervals must be positive".to_string(),
            });
        }

        Ok(Self {
            quota_policy,
            token_rates,
            stall_threshold: Duration::from_secs(stall_minutes * 60),
            result_retention: Duration::from_secs(retention_hours * 3600),
            retention_interval: Duration::from_secs(retention_secs),
            watchdog_interval: Duration::from_secs(watchdog_secs),
            max_task_retries: parse_or(&lookup, "MAX_TASK_RETRIES", defaults.max_task_retries)?,
            user_jobs_limit: parse_or(&lookup, "USER_JOBS_LIMIT", defaults.user_jobs_limit)?,
        })
    }
}

/// Parse `var` if set, else fall back to `default`.
pub fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}

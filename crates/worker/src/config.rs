use std::time::Duration;

use jokbo_core::task::{QUEUE_ANALYSIS, QUEUE_DEFAULT};
use jokbo_orchestrator::config::{parse_or, ConfigError};

/// Worker process settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub worker_name: String,
    /// Units executed at the same time.
    pub concurrency: usize,
    /// Routing keys this worker consumes.
    pub queues: Vec<String>,
    /// Idle wait between empty claims.
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which a unit counts as lost.
    pub lease_timeout: Duration,
    /// Time a SIGTERM-revoked unit gets to stop before it is aborted.
    pub terminate_grace: Duration,
    /// Delay before the first retry of a failed unit.
    pub retry_backoff: Duration,
    pub analyzer_url: String,
    pub file_store_url: String,
    pub document_cache_capacity: usize,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default                  |
    /// |---------------------------|--------------------------|
    /// | `DATABASE_URL`            | required                 |
    /// | `WORKER_NAME`             | `$HOSTNAME` or `worker-<pid>` |
    /// | `WORKER_CONCURRENCY`      | `4`                      |
    /// | `WORKER_QUEUES`           | `analysis,default`       |
    /// | `POLL_INTERVAL_MS`        | `500`                    |
    /// | `HEARTBEAT_INTERVAL_SECS` | `10`                     |
    /// | `LEASE_TIMEOUT_SECS`      | `120`                    |
    /// | `TERMINATE_GRACE_SECS`    | `5`                      |
    /// | `RETRY_BACKOFF_SECS`      | `10`                     |
    /// | `ANALYZER_URL`            | `http://localhost:8081`  |
    /// | `FILE_STORE_URL`          | `http://localhost:8082`  |
    /// | `DOCUMENT_CACHE_CAPACITY` | `64`                     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let worker_name = lookup("WORKER_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));

        let concurrency: usize = parse_or(&lookup, "WORKER_CONCURRENCY", 4)?;
        if concurrency == 0 {
            return Err(ConfigError::Invalid {
                var: "WORKER_CONCURRENCY",
                message: "must be at least 1".to_string(),
            });
        }

        let queues: Vec<String> = match lookup("WORKER_QUEUES") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![QUEUE_ANALYSIS.to_string(), QUEUE_DEFAULT.to_string()],
        };
        if queues.is_empty() {
            return Err(ConfigError::Invalid {
                var: "WORKER_QUEUES",
                message: "at least one queue is required".to_string(),
            });
        }

        let heartbeat_secs: u64 = parse_or(&lookup, "HEARTBEAT_INTERVAL_SECS", 10)?;
        let lease_secs: u64 = parse_or(&lookup, "LEASE_TIMEOUT_SECS", 120)?;
        if heartbeat_secs == 0 || lease_secs <= heartbeat_secs {
            return Err(ConfigError::Invalid {
                var: "LEASE_TIMEOUT_SECS",
                message: format!(
                    "lease ({lease_secs}s) must exceed a positive heartbeat interval ({heartbeat_secs}s)"
                ),
            });
        }

        let poll_ms: u64 = parse_or(&lookup, "POLL_INTERVAL_MS", 500)?;

        Ok(Self {
            database_url,
            worker_name,
            concurrency,
            queues,
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            lease_timeout: Duration::from_secs(lease_secs),
            terminate_grace: Duration::from_secs(parse_or(&lookup, "TERMINATE_GRACE_SECS", 5)?),
            retry_backoff: Duration::from_secs(parse_or(&lookup, "RETRY_BACKOFF_SECS", 10)?),
            analyzer_url: lookup("ANALYZER_URL")
                .unwrap_or_else(|| "http://localhost:8081".to_string()),
            file_store_url: lookup("FILE_STORE_URL")
                .unwrap_or_else(|| "http://localhost:8082".to_string()),
            document_cache_capacity: parse_or(&lookup, "DOCUMENT_CACHE_CAPACITY", 64)?,
        })
    }
}

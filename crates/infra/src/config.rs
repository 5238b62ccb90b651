//! Environment-driven pipeline configuration.

use std::time::Duration;

use crate::jobs::{DEFAULT_CHUNK_SIZE, RetryPolicy, WorkerPoolConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be a positive integer, got {value:?}")]
    InvalidNumber { key: &'static str, value: String },
    #[error("{0} is required")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub chunk_size: usize,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub poll_interval: Duration,
    pub database_url: Option<String>,
    pub redis_url: String,
    /// Where the worker relays events to.
    pub api_url: String,
    /// Shared secret guarding the internal routes, if any.
    pub internal_token: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            worker_concurrency: 5,
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(250),
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            api_url: "http://localhost:3001".to_string(),
            internal_token: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys take defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        let number = |key: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(key) {
                None => Ok(default),
                Some(raw) => match raw.parse::<u64>() {
                    Ok(n) if n > 0 => Ok(n),
                    _ => Err(ConfigError::InvalidNumber { key, value: raw }),
                },
            }
        };

        Ok(Self {
            chunk_size: number("CHUNK_SIZE", defaults.chunk_size as u64)? as usize,
            worker_concurrency: number("WORKER_CONCURRENCY", defaults.worker_concurrency as u64)? as usize,
            max_attempts: u32::try_from(number("JOB_MAX_ATTEMPTS", u64::from(defaults.max_attempts))?)
                .unwrap_or(u32::MAX),
            backoff_base: Duration::from_millis(number("JOB_BACKOFF_MS", defaults.backoff_base.as_millis() as u64)?),
            poll_interval: Duration::from_millis(number("QUEUE_POLL_MS", defaults.poll_interval.as_millis() as u64)?),
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            api_url: get("API_URL").unwrap_or(defaults.api_url),
            internal_token: get("INTERNAL_TOKEN"),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_attempts, self.backoff_base, Duration::from_secs(60))
    }

    pub fn worker_pool(&self, name: &str) -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_name(name)
            .with_workers(self.worker_concurrency)
            .with_poll_interval(self.poll_interval)
            .with_retry(self.retry_policy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.chunk_size, 5);
        assert_eq!(config.retry_policy().delay_for_attempt(1), Duration::from_secs(2));
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn values_are_read_and_trimmed() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("CHUNK_SIZE", " 50 "),
            ("WORKER_CONCURRENCY", "2"),
            ("DATABASE_URL", "postgres://localhost/bulk"),
            ("INTERNAL_TOKEN", ""),
        ]))
        .unwrap();

        assert_eq!(config.chunk_size, 50);
        assert_eq!(config.worker_pool("w").workers, 2);
        assert_eq!(config.require_database_url().unwrap(), "postgres://localhost/bulk");
        assert_eq!(config.internal_token, None);
    }

    #[test]
    fn zero_or_garbage_is_rejected() {
        for raw in ["0", "-1", "five"] {
            let err = PipelineConfig::from_lookup(lookup(&[("CHUNK_SIZE", raw)])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidNumber { key: "CHUNK_SIZE", .. }));
        }
    }
}

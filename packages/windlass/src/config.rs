//! Configuration loaded from environment variables.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::backoff::BackoffCalculator;
use crate::circuit::CircuitConfig;
use crate::executor::ExecutorConfig;
use crate::job::Dependency;
use crate::limits::GateConfig;
use crate::worker::WorkerConfig;

/// Reliability-core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,

    pub worker_pollers: usize,
    pub worker_batch_size: i64,
    pub visibility_timeout: Duration,

    pub max_attempts: u32,
    pub call_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,

    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,

    pub cache_ttl: Duration,

    /// Per-dependency rate/quota limits. Absent means unlimited.
    pub limits: HashMap<String, GateConfig>,
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key} must parse as {}", std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}

fn parse_opt_var<T: FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .with_context(|| format!("{key} must parse as {}", std::any::type_name::<T>())),
        Err(_) => Ok(None),
    }
}

/// Env suffix for a dependency: `messaging` → `MESSAGING`,
/// `object-store` → `OBJECT_STORE`.
fn env_suffix(dependency: Dependency) -> String {
    dependency.as_str().to_uppercase().replace('-', "_")
}

impl Config {
    /// Load configuration from environment variables. A `.env` file is
    /// honored in development.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        let mut limits = HashMap::new();
        for dependency in Dependency::ALL {
            let suffix = env_suffix(dependency);
            let per_minute = parse_opt_var(&format!("RATE_LIMIT_{suffix}"))?;
            let per_day = parse_opt_var(&format!("DAILY_QUOTA_{suffix}"))?;
            let config = GateConfig {
                per_minute,
                per_day,
            };
            if config.is_limited() {
                limits.insert(dependency.as_str().to_string(), config);
            }
        }

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_pollers: parse_var("WORKER_POLLERS", 2)?,
            worker_batch_size: parse_var("WORKER_BATCH_SIZE", 10)?,
            visibility_timeout: Duration::from_secs(parse_var("VISIBILITY_TIMEOUT_SECS", 300)?),
            max_attempts: parse_var("MAX_ATTEMPTS", 3)?,
            call_timeout: Duration::from_secs(parse_var("CALL_TIMEOUT_SECS", 30)?),
            backoff_base: Duration::from_millis(parse_var("BACKOFF_BASE_MS", 1_000)?),
            backoff_max: Duration::from_secs(parse_var("BACKOFF_MAX_SECS", 3_600)?),
            circuit_failure_threshold: parse_var("CIRCUIT_FAILURE_THRESHOLD", 5)?,
            circuit_cooldown: Duration::from_secs(parse_var("CIRCUIT_COOLDOWN_SECS", 30)?),
            cache_ttl: Duration::from_secs(parse_var("CACHE_TTL_SECS", 300)?),
            limits,
        })
    }

    pub fn circuit(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: self.circuit_cooldown,
        }
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_attempts: self.max_attempts,
            call_timeout: self.call_timeout,
        }
    }

    pub fn backoff(&self) -> BackoffCalculator {
        BackoffCalculator::new(self.backoff_base, self.backoff_max)
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            pollers: self.worker_pollers,
            batch_size: self.worker_batch_size,
            ..WorkerConfig::default()
        }
    }
}

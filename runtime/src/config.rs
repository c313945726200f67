//! Operational configuration.
//!
//! Retry budgets, backoff curves, concurrency and visibility timeouts are all
//! configuration, never constants baked into the pipeline. Every struct has a
//! `Default` suitable for development and `with_*` setters; [`SyncConfig::from_env`]
//! overlays `SYNCFLOW_*` environment variables on top of the defaults.
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `SYNCFLOW_WORKER_CONCURRENCY` | `worker.concurrency` | 8 |
//! | `SYNCFLOW_WORKER_BATCH_SIZE` | `worker.batch_size` | 10 |
//! | `SYNCFLOW_WORKER_POLL_INTERVAL_MS` | `worker.poll_interval` | 500 |
//! | `SYNCFLOW_VISIBILITY_TIMEOUT_MS` | `worker.visibility_timeout` | 30000 |
//! | `SYNCFLOW_MAX_ATTEMPTS` | `worker.max_attempts` | 5 |
//! | `SYNCFLOW_REQUEUE_INITIAL_DELAY_MS` | `worker.requeue_backoff.initial_delay` | 1000 |
//! | `SYNCFLOW_REQUEUE_MAX_DELAY_MS` | `worker.requeue_backoff.max_delay` | 300000 |
//! | `SYNCFLOW_REQUEUE_MULTIPLIER` | `worker.requeue_backoff.multiplier` | 2.0 |
//! | `SYNCFLOW_MAX_WRITE_CONFLICTS` | `orchestrator.max_write_conflicts` | 3 |
//! | `SYNCFLOW_PUBLISH_MAX_RETRIES` | `publisher.retry.max_retries` | 3 |
//! | `SYNCFLOW_PUBLISH_INITIAL_DELAY_MS` | `publisher.retry.initial_delay` | 100 |
//! | `SYNCFLOW_PUBLISH_MAX_DELAY_MS` | `publisher.retry.max_delay` | 5000 |
//! | `SYNCFLOW_PUBLISH_RELAY_BATCH_SIZE` | `publisher.relay_batch_size` | 100 |

use crate::retry::RetryPolicy;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors from loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but does not parse
    #[error("Invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        /// Variable name
        key: String,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// A value parses but is out of range
    #[error("{key} must be {requirement}")]
    OutOfRange {
        /// Variable name
        key: &'static str,
        /// What the value must satisfy
        requirement: &'static str,
    },
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Jobs processed concurrently by one worker instance
    pub concurrency: usize,
    /// Jobs requested per receive
    pub batch_size: usize,
    /// Sleep between polls when the queue is empty
    pub poll_interval: Duration,
    /// How long a delivered job stays hidden from other workers
    pub visibility_timeout: Duration,
    /// Deliveries before a retryable job is dead-lettered
    pub max_attempts: u32,
    /// Delay curve for requeued jobs, indexed by attempt
    pub requeue_backoff: RetryPolicy,
}

impl WorkerConfig {
    /// Set concurrency.
    #[must_use]
    pub const fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Set batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set visibility timeout.
    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the delivery budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the requeue backoff curve.
    #[must_use]
    pub fn with_requeue_backoff(mut self, policy: RetryPolicy) -> Self {
        self.requeue_backoff = policy;
        self
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            batch_size: 10,
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(30),
            max_attempts: 5,
            requeue_backoff: RetryPolicy::builder()
                .initial_delay(Duration::from_secs(1))
                .max_delay(Duration::from_secs(300))
                .multiplier(2.0)
                .jitter(true)
                .build(),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Local re-resolutions after lost write races before the job is requeued
    pub max_write_conflicts: u32,
}

impl OrchestratorConfig {
    /// Set the local conflict budget.
    #[must_use]
    pub const fn with_max_write_conflicts(mut self, max: u32) -> Self {
        self.max_write_conflicts = max;
        self
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_write_conflicts: 3,
        }
    }
}

/// Event publisher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherConfig {
    /// In-process retries for one publish
    pub retry: RetryPolicy,
    /// Outbox events read per relay pass
    pub relay_batch_size: usize,
}

impl PublisherConfig {
    /// Set the publish retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the relay batch size.
    #[must_use]
    pub const fn with_relay_batch_size(mut self, relay_batch_size: usize) -> Self {
        self.relay_batch_size = relay_batch_size;
        self
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::builder()
                .max_retries(3)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(5))
                .build(),
            relay_batch_size: 100,
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SyncConfig {
    /// Worker pool
    pub worker: WorkerConfig,
    /// Orchestrator
    pub orchestrator: OrchestratorConfig,
    /// Event publisher
    pub publisher: PublisherConfig,
}

impl SyncConfig {
    /// Set worker settings.
    #[must_use]
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Set orchestrator settings.
    #[must_use]
    pub const fn with_orchestrator(mut self, orchestrator: OrchestratorConfig) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Set publisher settings.
    #[must_use]
    pub fn with_publisher(mut self, publisher: PublisherConfig) -> Self {
        self.publisher = publisher;
        self
    }

    /// Load configuration from `SYNCFLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparsable or
    /// out-of-range value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is set to an unparsable or
    /// out-of-range value.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Lookup(lookup);
        let defaults = Self::default();

        let worker = WorkerConfig {
            concurrency: env.parse("SYNCFLOW_WORKER_CONCURRENCY", defaults.worker.concurrency)?,
            batch_size: env.parse("SYNCFLOW_WORKER_BATCH_SIZE", defaults.worker.batch_size)?,
            poll_interval: env.millis(
                "SYNCFLOW_WORKER_POLL_INTERVAL_MS",
                defaults.worker.poll_interval,
            )?,
            visibility_timeout: env.millis(
                "SYNCFLOW_VISIBILITY_TIMEOUT_MS",
                defaults.worker.visibility_timeout,
            )?,
            max_attempts: env.parse("SYNCFLOW_MAX_ATTEMPTS", defaults.worker.max_attempts)?,
            requeue_backoff: RetryPolicy {
                initial_delay: env.millis(
                    "SYNCFLOW_REQUEUE_INITIAL_DELAY_MS",
                    defaults.worker.requeue_backoff.initial_delay,
                )?,
                max_delay: env.millis(
                    "SYNCFLOW_REQUEUE_MAX_DELAY_MS",
                    defaults.worker.requeue_backoff.max_delay,
                )?,
                multiplier: env.parse(
                    "SYNCFLOW_REQUEUE_MULTIPLIER",
                    defaults.worker.requeue_backoff.multiplier,
                )?,
                ..defaults.worker.requeue_backoff
            },
        };

        let orchestrator = OrchestratorConfig {
            max_write_conflicts: env.parse(
                "SYNCFLOW_MAX_WRITE_CONFLICTS",
                defaults.orchestrator.max_write_conflicts,
            )?,
        };

        let publisher = PublisherConfig {
            retry: RetryPolicy {
                max_retries: env.parse(
                    "SYNCFLOW_PUBLISH_MAX_RETRIES",
                    defaults.publisher.retry.max_retries,
                )?,
                initial_delay: env.millis(
                    "SYNCFLOW_PUBLISH_INITIAL_DELAY_MS",
                    defaults.publisher.retry.initial_delay,
                )?,
                max_delay: env.millis(
                    "SYNCFLOW_PUBLISH_MAX_DELAY_MS",
                    defaults.publisher.retry.max_delay,
                )?,
                ..defaults.publisher.retry
            },
            relay_batch_size: env.parse(
                "SYNCFLOW_PUBLISH_RELAY_BATCH_SIZE",
                defaults.publisher.relay_batch_size,
            )?,
        };

        let config = Self {
            worker,
            orchestrator,
            publisher,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check ranges that would stall the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::OutOfRange`] for the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.concurrency == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SYNCFLOW_WORKER_CONCURRENCY",
                requirement: "at least 1",
            });
        }
        if self.worker.batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SYNCFLOW_WORKER_BATCH_SIZE",
                requirement: "at least 1",
            });
        }
        if self.worker.max_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SYNCFLOW_MAX_ATTEMPTS",
                requirement: "at least 1",
            });
        }
        if self.worker.requeue_backoff.multiplier < 1.0 {
            return Err(ConfigError::OutOfRange {
                key: "SYNCFLOW_REQUEUE_MULTIPLIER",
                requirement: "at least 1.0",
            });
        }
        if self.publisher.relay_batch_size == 0 {
            return Err(ConfigError::OutOfRange {
                key: "SYNCFLOW_PUBLISH_RELAY_BATCH_SIZE",
                requirement: "at least 1",
            });
        }
        Ok(())
    }
}

struct Lookup<L>(L);

impl<L> Lookup<L>
where
    L: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.0)(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn millis(&self, key: &str, default: Duration) -> Result<Duration, ConfigError> {
        #[allow(clippy::cast_possible_truncation)] // configured delays fit in u64 millis
        let default_ms = default.as_millis() as u64;
        self.parse(key, default_ms).map(Duration::from_millis)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn variables_override_defaults() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("SYNCFLOW_WORKER_CONCURRENCY", "32"),
            ("SYNCFLOW_VISIBILITY_TIMEOUT_MS", "1500"),
            ("SYNCFLOW_MAX_ATTEMPTS", " 7 "),
            ("SYNCFLOW_REQUEUE_MULTIPLIER", "3.5"),
            ("SYNCFLOW_MAX_WRITE_CONFLICTS", "1"),
        ]))
        .unwrap();

        assert_eq!(config.worker.concurrency, 32);
        assert_eq!(config.worker.visibility_timeout, Duration::from_millis(1500));
        assert_eq!(config.worker.max_attempts, 7);
        assert!((config.worker.requeue_backoff.multiplier - 3.5).abs() < f64::EPSILON);
        assert!(config.worker.requeue_backoff.jitter);
        assert_eq!(config.orchestrator.max_write_conflicts, 1);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = SyncConfig::from_lookup(lookup(&[("SYNCFLOW_WORKER_BATCH_SIZE", "lots")]))
            .unwrap_err();

        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "SYNCFLOW_WORKER_BATCH_SIZE"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[("SYNCFLOW_WORKER_CONCURRENCY", "0")]))
            .unwrap_err();

        assert_eq!(
            err,
            ConfigError::OutOfRange {
                key: "SYNCFLOW_WORKER_CONCURRENCY",
                requirement: "at least 1",
            }
        );
    }

    #[test]
    fn relay_batch_size_is_configurable_but_never_zero() {
        let config =
            SyncConfig::from_lookup(lookup(&[("SYNCFLOW_PUBLISH_RELAY_BATCH_SIZE", "250")]))
                .unwrap();
        assert_eq!(config.publisher.relay_batch_size, 250);

        let err = SyncConfig::from_lookup(lookup(&[("SYNCFLOW_PUBLISH_RELAY_BATCH_SIZE", "0")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::OutOfRange { key: "SYNCFLOW_PUBLISH_RELAY_BATCH_SIZE", .. }
        ));
    }

    #[test]
    fn builders_chain() {
        let worker = WorkerConfig::default()
            .with_concurrency(2)
            .with_batch_size(5)
            .with_max_attempts(3);
        let config = SyncConfig::default()
            .with_worker(worker)
            .with_orchestrator(OrchestratorConfig::default().with_max_write_conflicts(0));

        assert_eq!(config.worker.batch_size, 5);
        assert_eq!(config.orchestrator.max_write_conflicts, 0);
        assert!(config.validate().is_ok());
    }
}

//! Configuration loading for the repository lifecycle service.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `REPO_LIFECYCLE_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "REPO_LIFECYCLE_";

/// Queue and store calls a worker makes while holding a lease: read state,
/// claim, record the outcome, settle the job.
const LEASED_OPERATIONS: u64 = 4;

/// Application configuration derived from `REPO_LIFECYCLE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Root directory under which repository mirrors are kept.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry_policy: RetryPolicyConfig,
}

/// Durable queue parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct QueueConfig {
    /// Namespace shared by all job topics of this deployment.
    #[serde(default = "default_queue_namespace")]
    pub namespace: String,
    /// How long a leased job stays invisible to other workers.
    #[serde(default = "default_queue_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
}

/// Update scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SchedulerConfig {
    /// Tick period and staleness threshold, in milliseconds.
    #[serde(default = "default_update_frequency_ms")]
    pub update_frequency_ms: u64,
}

/// Worker loop parameters, shared by the clone, update and delete pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    /// Number of concurrent loops per job kind
    #[serde(default = "default_worker_concurrency")]
    pub concurrency: usize,
    /// Idle wait after an empty lease
    #[serde(default = "default_worker_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Failed attempts after which a job is dead-lettered
    #[serde(default = "default_worker_max_attempts")]
    pub max_attempts: i32,
    /// Delay before a contended job becomes visible again
    #[serde(default = "default_worker_contention_backoff_ms")]
    pub contention_backoff_ms: u64,
    /// Upper bound on a single clone, update or delete
    #[serde(default = "default_worker_mutation_timeout_ms")]
    pub mutation_timeout_ms: u64,
    /// Tries for a queue or store operation before the loop gives up on it
    #[serde(default = "default_operation_retry_limit")]
    pub operation_retry_limit: u32,
    /// First delay of the operation retry backoff
    #[serde(default = "default_operation_retry_base_ms")]
    pub operation_retry_base_ms: u64,
}

/// Backoff applied when a mutation fails and the job is requeued.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Base retry interval in seconds (default: 5)
    ///
    /// Subsequent retries use exponential backoff: base_seconds * 2^attempt.
    ///
    /// Environment variable: `REPO_LIFECYCLE_RETRY_BASE_SECONDS`
    #[serde(default = "default_retry_base_seconds")]
    pub base_seconds: u64,

    /// Maximum retry interval in seconds (default: 900)
    ///
    /// Environment variable: `REPO_LIFECYCLE_RETRY_MAX_SECONDS`
    #[serde(default = "default_retry_max_seconds")]
    pub max_seconds: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Environment variable: `REPO_LIFECYCLE_RETRY_JITTER_FACTOR`
    #[serde(default = "default_retry_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            enabled: default_enabled(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            data_path: default_data_path(),
            queue: QueueConfig::default(),
            scheduler: SchedulerConfig::default(),
            worker: WorkerConfig::default(),
            retry_policy: RetryPolicyConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: default_queue_namespace(),
            visibility_timeout_ms: default_queue_visibility_timeout_ms(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            update_frequency_ms: default_update_frequency_ms(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_worker_concurrency(),
            poll_interval_ms: default_worker_poll_interval_ms(),
            max_attempts: default_worker_max_attempts(),
            contention_backoff_ms: default_worker_contention_backoff_ms(),
            mutation_timeout_ms: default_worker_mutation_timeout_ms(),
            operation_retry_limit: default_operation_retry_limit(),
            operation_retry_base_ms: default_operation_retry_base_ms(),
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base_seconds(),
            max_seconds: default_retry_max_seconds(),
            jitter_factor: default_retry_jitter_factor(),
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::EmptyQueueNamespace);
        }

        if self.visibility_timeout_ms == 0 {
            return Err(ConfigError::InvalidVisibilityTimeout {
                value: self.visibility_timeout_ms,
            });
        }

        Ok(())
    }
}

impl SchedulerConfig {
    pub fn update_frequency(&self) -> Duration {
        Duration::from_millis(self.update_frequency_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.update_frequency_ms == 0 {
            return Err(ConfigError::InvalidUpdateFrequency {
                value: self.update_frequency_ms,
            });
        }

        Ok(())
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn contention_backoff(&self) -> Duration {
        Duration::from_millis(self.contention_backoff_ms)
    }

    pub fn mutation_timeout(&self) -> Duration {
        Duration::from_millis(self.mutation_timeout_ms)
    }

    /// Longest a worker can hold one lease: the mutation timeout plus the
    /// queue and store calls around it, each with its full retry backoff.
    pub fn lease_budget_ms(&self) -> u64 {
        let per_operation: u64 = (0..self.operation_retry_limit.max(1) - 1)
            .map(|retry| {
                let delay = self
                    .operation_retry_base_ms
                    .saturating_mul(2_u64.saturating_pow(retry.min(16)));
                // operation backoff adds up to a tenth on top
                delay.saturating_add(delay / 10)
            })
            .fold(0, u64::saturating_add);

        self.mutation_timeout_ms
            .saturating_add(per_operation.saturating_mul(LEASED_OPERATIONS))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 || self.concurrency > 16 {
            return Err(ConfigError::InvalidWorkerConcurrency {
                value: self.concurrency,
            });
        }

        if !(0..=100).contains(&self.max_attempts) {
            return Err(ConfigError::InvalidMaxAttempts {
                value: self.max_attempts,
            });
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidPollInterval {
                value: self.poll_interval_ms,
            });
        }

        if self.mutation_timeout_ms == 0 {
            return Err(ConfigError::InvalidMutationTimeout {
                value: self.mutation_timeout_ms,
            });
        }

        if self.operation_retry_limit == 0 {
            return Err(ConfigError::InvalidOperationRetryLimit {
                value: self.operation_retry_limit,
            });
        }

        Ok(())
    }
}

impl RetryPolicyConfig {
    /// Validate retry policy bounds
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }

        Ok(())
    }
}

impl AppConfig {
    /// Validate every section; the first violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.database_url.trim().is_empty() {
            return Err(ConfigError::EmptyDatabaseUrl);
        }

        if self.db_max_connections == 0 {
            return Err(ConfigError::InvalidDbMaxConnections {
                value: self.db_max_connections,
            });
        }

        self.queue.validate()?;
        self.scheduler.validate()?;
        self.worker.validate()?;
        self.retry_policy.validate()?;

        // a lease that lapses mid-mutation hands the job to a second worker
        let required_ms = self.worker.lease_budget_ms();
        if required_ms >= self.queue.visibility_timeout_ms {
            return Err(ConfigError::VisibilityTimeoutTooShort {
                visibility_timeout_ms: self.queue.visibility_timeout_ms,
                required_ms,
            });
        }

        Ok(())
    }

    /// Serialize the configuration with credentials in the database url masked.
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut redacted = self.clone();
        redacted.database_url = redact_url_password(&self.database_url);
        serde_json::to_string(&redacted)
    }
}

fn redact_url_password(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) if parsed.password().is_some() => {
            if parsed.set_password(Some("***")).is_ok() {
                parsed.to_string()
            } else {
                raw.to_string()
            }
        }
        _ => raw.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://repo-lifecycle.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_queue_namespace() -> String {
    "repo-lifecycle".to_string()
}

fn default_queue_visibility_timeout_ms() -> u64 {
    15 * 60 * 1000 // 15 minutes
}

fn default_update_frequency_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_worker_poll_interval_ms() -> u64 {
    1000
}

fn default_worker_max_attempts() -> i32 {
    3
}

fn default_worker_contention_backoff_ms() -> u64 {
    5000
}

fn default_worker_mutation_timeout_ms() -> u64 {
    10 * 60 * 1000 // 10 minutes
}

fn default_operation_retry_limit() -> u32 {
    5
}

fn default_operation_retry_base_ms() -> u64 {
    100
}

fn default_retry_base_seconds() -> u64 {
    5
}

fn default_retry_max_seconds() -> u64 {
    900 // 15 minutes
}

fn default_retry_jitter_factor() -> f64 {
    0.1
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("database url cannot be empty")]
    EmptyDatabaseUrl,
    #[error("database max connections must be positive, got {value}")]
    InvalidDbMaxConnections { value: u32 },
    #[error("queue namespace cannot be empty")]
    EmptyQueueNamespace,
    #[error("queue visibility timeout must be positive, got {value}ms")]
    InvalidVisibilityTimeout { value: u64 },
    #[error("update frequency must be positive, got {value}ms")]
    InvalidUpdateFrequency { value: u64 },
    #[error("worker concurrency must be between 1 and 16, got {value}")]
    InvalidWorkerConcurrency { value: usize },
    #[error("worker max attempts must be between 0 and 100, got {value}")]
    InvalidMaxAttempts { value: i32 },
    #[error("worker poll interval must be positive, got {value}ms")]
    InvalidPollInterval { value: u64 },
    #[error("mutation timeout must be positive, got {value}ms")]
    InvalidMutationTimeout { value: u64 },
    #[error("operation retry limit must be positive, got {value}")]
    InvalidOperationRetryLimit { value: u32 },
    #[error("retry base seconds ({base}) must not exceed max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error(
        "queue visibility timeout ({visibility_timeout_ms}ms) must exceed the mutation timeout plus operation retries ({required_ms}ms)"
    )]
    VisibilityTimeoutTooShort {
        visibility_timeout_ms: u64,
        required_ms: u64,
    },
}

/// Loads configuration using layered `.env` files and `REPO_LIFECYCLE_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads and validates configuration. Process environment wins over every
    /// dotenv layer.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let defaults = AppConfig::default();

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let enabled = take_parsed(&mut layered, "ENABLED")?.unwrap_or(defaults.enabled);
        let log_level = take_string(&mut layered, "LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_format = take_string(&mut layered, "LOG_FORMAT").unwrap_or(defaults.log_format);
        let database_url =
            take_string(&mut layered, "DATABASE_URL").unwrap_or(defaults.database_url);
        let db_max_connections = take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
            .unwrap_or(defaults.db_max_connections);
        let db_acquire_timeout_ms = take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
            .unwrap_or(defaults.db_acquire_timeout_ms);
        let data_path = take_string(&mut layered, "DATA_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_path);

        let queue = QueueConfig {
            namespace: take_string(&mut layered, "QUEUE_NAMESPACE")
                .unwrap_or(defaults.queue.namespace),
            visibility_timeout_ms: take_parsed(&mut layered, "QUEUE_VISIBILITY_TIMEOUT_MS")?
                .unwrap_or(defaults.queue.visibility_timeout_ms),
        };

        let scheduler = SchedulerConfig {
            update_frequency_ms: take_parsed(&mut layered, "UPDATE_FREQUENCY_MS")?
                .unwrap_or(defaults.scheduler.update_frequency_ms),
        };

        let worker = WorkerConfig {
            concurrency: take_parsed(&mut layered, "WORKER_CONCURRENCY")?
                .unwrap_or(defaults.worker.concurrency),
            poll_interval_ms: take_parsed(&mut layered, "WORKER_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.worker.poll_interval_ms),
            max_attempts: take_parsed(&mut layered, "WORKER_MAX_ATTEMPTS")?
                .unwrap_or(defaults.worker.max_attempts),
            contention_backoff_ms: take_parsed(&mut layered, "WORKER_CONTENTION_BACKOFF_MS")?
                .unwrap_or(defaults.worker.contention_backoff_ms),
            mutation_timeout_ms: take_parsed(&mut layered, "WORKER_MUTATION_TIMEOUT_MS")?
                .unwrap_or(defaults.worker.mutation_timeout_ms),
            operation_retry_limit: take_parsed(&mut layered, "OPERATION_RETRY_LIMIT")?
                .unwrap_or(defaults.worker.operation_retry_limit),
            operation_retry_base_ms: take_parsed(&mut layered, "OPERATION_RETRY_BASE_MS")?
                .unwrap_or(defaults.worker.operation_retry_base_ms),
        };

        let retry_policy = RetryPolicyConfig {
            base_seconds: take_parsed(&mut layered, "RETRY_BASE_SECONDS")?
                .unwrap_or(defaults.retry_policy.base_seconds),
            max_seconds: take_parsed(&mut layered, "RETRY_MAX_SECONDS")?
                .unwrap_or(defaults.retry_policy.max_seconds),
            jitter_factor: take_parsed(&mut layered, "RETRY_JITTER_FACTOR")?
                .unwrap_or(defaults.retry_policy.jitter_factor),
        };

        let config = AppConfig {
            profile,
            enabled,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            data_path,
            queue,
            scheduler,
            worker,
            retry_policy,
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{}PROFILE", ENV_PREFIX))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn take_string(layered: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    layered
        .remove(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    layered: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match take_string(layered, key) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: format!("{}{}", ENV_PREFIX, key),
                value: raw,
            }),
        None => Ok(None),
    }
}

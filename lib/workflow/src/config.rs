//! Engine configuration.
//!
//! Loaded via the `config` crate from environment variables prefixed with
//! `ERP_FLOW`, nested with `__`: `ERP_FLOW__DEFAULT_RETRY__MAX_ATTEMPTS=3`.

use crate::error::WorkflowError;
use crate::node::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "ERP_FLOW";

/// Configuration of a [`crate::WorkflowEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default run timeout, in seconds, for workflows without their own.
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// Per-attempt timeout, in seconds, for nodes without their own.
    #[serde(default = "default_node_timeout_secs")]
    pub node_timeout_secs: u64,

    /// Runs allowed to execute at the same time.
    #[serde(default = "default_max_concurrent_executions")]
    pub max_concurrent_executions: usize,

    /// Retry policy for nodes without their own.
    #[serde(default)]
    pub default_retry: RetryConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Collect per node type metrics.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Open a tracing span around every node call.
    #[serde(default)]
    pub enable_tracing: bool,

    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_execution_timeout_secs() -> u64 {
    300
}

fn default_node_timeout_secs() -> u64 {
    60
}

fn default_max_concurrent_executions() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_timeout_secs: default_execution_timeout_secs(),
            node_timeout_secs: default_node_timeout_secs(),
            max_concurrent_executions: default_max_concurrent_executions(),
            default_retry: RetryConfig::default(),
            persistence: PersistenceConfig::default(),
            enable_metrics: true,
            enable_tracing: false,
            retention: RetentionConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::load(None)
    }

    /// Loads configuration from the given variables instead of the process
    /// environment. Keys use the same `ERP_FLOW__` form.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed into its field.
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, config::ConfigError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?
            .try_deserialize()
    }

    /// Checks values the types cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Configuration` describing the first invalid value.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        let invalid = |reason: &str| {
            Err(WorkflowError::Configuration {
                reason: reason.to_string(),
            })
        };

        if self.max_concurrent_executions == 0 {
            return invalid("max_concurrent_executions must be at least 1");
        }
        if self.execution_timeout_secs == 0 {
            return invalid("execution_timeout_secs must be at least 1");
        }
        if self.node_timeout_secs == 0 {
            return invalid("node_timeout_secs must be at least 1");
        }
        if !self.default_retry.backoff_multiplier.is_finite()
            || self.default_retry.backoff_multiplier < 0.0
        {
            return invalid("default_retry.backoff_multiplier must be a non-negative number");
        }
        if self.persistence.enabled
            && self.persistence.backend == PersistenceBackend::Postgres
            && self.persistence.database_url.is_none()
        {
            return invalid("persistence.database_url is required for the postgres backend");
        }
        Ok(())
    }

    #[must_use]
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    #[must_use]
    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

/// Default retry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            delay_ms: self.delay_ms,
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// Which store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    None,
    Memory,
    Postgres,
}

/// Persistence settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend: PersistenceBackend,
    /// Connection URL for the postgres backend.
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: PersistenceBackend::None,
            database_url: None,
            max_connections: default_max_connections(),
        }
    }
}

impl PersistenceConfig {
    /// The backend to use, `None` when persistence is disabled.
    #[must_use]
    pub fn effective_backend(&self) -> PersistenceBackend {
        if self.enabled {
            self.backend
        } else {
            PersistenceBackend::None
        }
    }
}

/// How long finished runs stay in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_execution_retention_secs")]
    pub execution_retention_secs: u64,
    /// Interval between cleanup sweeps, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_execution_retention_secs() -> u64 {
    3600
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            execution_retention_secs: default_execution_retention_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.execution_retention_secs)
    }

    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn engine_config_has_correct_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.execution_timeout_secs, 300);
        assert_eq!(config.node_timeout_secs, 60);
        assert_eq!(config.max_concurrent_executions, 10);
        assert_eq!(config.default_retry.max_attempts, 1);
        assert_eq!(config.default_retry.delay_ms, 1000);
        assert!(config.enable_metrics);
        assert!(!config.enable_tracing);
        assert_eq!(config.persistence.effective_backend(), PersistenceBackend::None);
        assert_eq!(config.retention.retention(), Duration::from_secs(3600));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = EngineConfig::from_vars(HashMap::new()).expect("load");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn nested_variables_override_defaults() {
        let config = EngineConfig::from_vars(vars(&[
            ("ERP_FLOW__NODE_TIMEOUT_SECS", "5"),
            ("ERP_FLOW__DEFAULT_RETRY__MAX_ATTEMPTS", "3"),
            ("ERP_FLOW__PERSISTENCE__ENABLED", "true"),
            ("ERP_FLOW__PERSISTENCE__BACKEND", "memory"),
            ("ERP_FLOW__RETENTION__CLEANUP_INTERVAL_SECS", "10"),
            ("OTHER_APP__NODE_TIMEOUT_SECS", "99"),
        ]))
        .expect("load");

        assert_eq!(config.node_timeout(), Duration::from_secs(5));
        assert_eq!(config.default_retry.max_attempts, 3);
        assert_eq!(config.default_retry.delay_ms, 1000);
        assert_eq!(config.persistence.effective_backend(), PersistenceBackend::Memory);
        assert_eq!(config.retention.cleanup_interval(), Duration::from_secs(10));
    }

    #[test]
    fn validate_rejects_postgres_without_url() {
        let mut config = EngineConfig::default();
        config.persistence.enabled = true;
        config.persistence.backend = PersistenceBackend::Postgres;
        assert!(matches!(
            config.validate(),
            Err(WorkflowError::Configuration { .. })
        ));

        config.persistence.database_url = Some("postgres://localhost/erp".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let config = EngineConfig {
            max_concurrent_executions: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

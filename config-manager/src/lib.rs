//! Typed configuration, loaded at startup from a well-known config object
//! (a file path, if given) layered with environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
    Batch,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::High, Priority::Medium, Priority::Low, Priority::Batch];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Batch => "BATCH",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub concurrency: u32,
    pub rate_limit_per_second: u32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfigSet {
    pub high: QueueConfig,
    pub medium: QueueConfig,
    pub low: QueueConfig,
    pub batch: QueueConfig,
}

impl QueueConfigSet {
    pub fn for_priority(&self, priority: Priority) -> &QueueConfig {
        match priority {
            Priority::High => &self.high,
            Priority::Medium => &self.medium,
            Priority::Low => &self.low,
            Priority::Batch => &self.batch,
        }
    }
}

impl Default for QueueConfigSet {
    fn default() -> Self {
        Self {
            high: QueueConfig {
                concurrency: 50,
                rate_limit_per_second: 100,
                max_retries: 3,
                retry_backoff_ms: 1_000,
            },
            medium: QueueConfig {
                concurrency: 30,
                rate_limit_per_second: 50,
                max_retries: 3,
                retry_backoff_ms: 2_000,
            },
            low: QueueConfig {
                concurrency: 20,
                rate_limit_per_second: 25,
                max_retries: 2,
                retry_backoff_ms: 5_000,
            },
            batch: QueueConfig {
                concurrency: 10,
                rate_limit_per_second: 10,
                max_retries: 1,
                retry_backoff_ms: 10_000,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub default_ttl_seconds: u64,
    pub reservation_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 24 * 3600,
            reservation_ttl_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub terminal_task_retention_days: i64,
    pub max_events_per_service: usize,
    pub max_events_global: usize,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            terminal_task_retention_days: 7,
            max_events_per_service: 100,
            max_events_global: 1000,
        }
    }
}

/// Group/version/kind of the orchestrator's workflow custom resource.
/// Configurable rather than hard-coded since the external interface
/// contract only commits to the Argo-Workflows-shaped spec, not to Argo
/// itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGvkConfig {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Default for WorkflowGvkConfig {
    fn default() -> Self {
        Self {
            group: "argoproj.io".to_string(),
            version: "v1alpha1".to_string(),
            kind: "Workflow".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub store_url: String,
    pub namespace: String,
    pub log_level: String,
    #[serde(default)]
    pub queues: QueueConfigSet,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub workflow_gvk: WorkflowGvkConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "default".to_string(),
            log_level: "info".to_string(),
            queues: QueueConfigSet::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            cleanup: CleanupConfig::default(),
            workflow_gvk: WorkflowGvkConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Load defaults, optionally layer a TOML file, then layer environment
    /// variables. `STORE_URL`, `NAMESPACE`, and `LOG_LEVEL` are read
    /// directly per the external interface contract; every other field can
    /// be overridden with a `COORDINATOR__`-prefixed, double-underscore
    /// separated variable, e.g. `COORDINATOR__QUEUES__HIGH__CONCURRENCY=80`.
    pub fn load(file_path: Option<&str>) -> Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder().add_source(
            config::Config::try_from(&defaults).context("serialize config defaults")?,
        );

        if let Some(path) = file_path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("COORDINATOR")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: CoordinatorConfig = builder
            .build()
            .context("build configuration")?
            .try_deserialize()
            .context("deserialize configuration")?;

        if let Ok(store_url) = std::env::var("STORE_URL") {
            config.store_url = store_url;
        }
        if let Ok(namespace) = std::env::var("NAMESPACE") {
            config.namespace = namespace;
        }
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            config.log_level = log_level;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.queues.high.concurrency, 50);
        assert_eq!(cfg.queues.high.rate_limit_per_second, 100);
        assert_eq!(cfg.queues.batch.retry_backoff_ms, 10_000);
        assert_eq!(cfg.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.circuit_breaker.reset_timeout_seconds, 60);
        assert_eq!(cfg.cache.default_ttl_seconds, 86_400);
        assert_eq!(cfg.workflow_gvk.kind, "Workflow");
    }

    #[test]
    fn env_vars_override_store_namespace_and_log_level() {
        std::env::set_var("STORE_URL", "redis://test:6379");
        std::env::set_var("NAMESPACE", "testing");
        std::env::set_var("LOG_LEVEL", "debug");
        let cfg = CoordinatorConfig::load(None).unwrap();
        assert_eq!(cfg.store_url, "redis://test:6379");
        assert_eq!(cfg.namespace, "testing");
        assert_eq!(cfg.log_level, "debug");
        std::env::remove_var("STORE_URL");
        std::env::remove_var("NAMESPACE");
        std::env::remove_var("LOG_LEVEL");
    }
}

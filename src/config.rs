//! # Configuration Management
//!
//! Typed configuration for the dispatch core: global dispatcher settings plus
//! one [`DatabaseConfig`] entry per registered database. Values come from
//! defaults, may be overridden from the environment, and are validated before
//! the queue manager starts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::query::WorkloadClass;
use crate::error::{DispatchError, Result};
use crate::migration::DEFAULT_MIGRATION_THRESHOLD;

/// Global dispatcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of databases the manager will register. Fixed at startup.
    pub max_databases: usize,
    /// Bound of each queue's FIFO.
    pub queue_capacity: usize,
    /// Timeout recorded on each pending result at submission.
    pub default_timeout_seconds: u64,
    /// Idle interval between connection health checks.
    pub heartbeat_interval_seconds: u64,
    /// Bounded wait on the queue FIFO, so heartbeat and shutdown checks are
    /// never starved even with no traffic.
    pub poll_interval_ms: u64,
    /// Interval between pending-result registry sweeps.
    pub cleanup_interval_seconds: u64,
    /// Capacity of each Cache-class queue's result cache.
    pub cache_capacity: u64,
    /// Time-to-live of cached results.
    pub cache_ttl_seconds: u64,
    /// Databases registered at startup.
    pub databases: Vec<DatabaseConfig>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_databases: 10,
            queue_capacity: 256,
            default_timeout_seconds: 30,
            heartbeat_interval_seconds: 30,
            poll_interval_ms: 250,
            cleanup_interval_seconds: 10,
            cache_capacity: 1024,
            cache_ttl_seconds: 300,
            databases: Vec::new(),
        }
    }
}

impl DispatchConfig {
    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(value) = std::env::var("DISPATCH_MAX_DATABASES") {
            config.max_databases = value.parse().map_err(|e| {
                DispatchError::Configuration(format!("invalid DISPATCH_MAX_DATABASES: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("DISPATCH_QUEUE_CAPACITY") {
            config.queue_capacity = value.parse().map_err(|e| {
                DispatchError::Configuration(format!("invalid DISPATCH_QUEUE_CAPACITY: {e}"))
            })?;
        }

        if let Ok(value) = std::env::var("DISPATCH_DEFAULT_TIMEOUT_SECONDS") {
            config.default_timeout_seconds = value.parse().map_err(|e| {
                DispatchError::Configuration(format!(
                    "invalid DISPATCH_DEFAULT_TIMEOUT_SECONDS: {e}"
                ))
            })?;
        }

        if let Ok(value) = std::env::var("DISPATCH_HEARTBEAT_INTERVAL_SECONDS") {
            config.heartbeat_interval_seconds = value.parse().map_err(|e| {
                DispatchError::Configuration(format!(
                    "invalid DISPATCH_HEARTBEAT_INTERVAL_SECONDS: {e}"
                ))
            })?;
        }

        if let Ok(value) = std::env::var("DISPATCH_POLL_INTERVAL_MS") {
            config.poll_interval_ms = value.parse().map_err(|e| {
                DispatchError::Configuration(format!("invalid DISPATCH_POLL_INTERVAL_MS: {e}"))
            })?;
        }

        Ok(config)
    }

    /// Validate invariants that would otherwise surface as runtime surprises.
    pub fn validate(&self) -> Result<()> {
        if self.max_databases == 0 {
            return Err(DispatchError::Configuration(
                "max_databases must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::Configuration(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(DispatchError::Configuration(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        for database in &self.databases {
            database.validate()?;
        }
        Ok(())
    }

    /// Per-queue settings derived from the global configuration.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            capacity: self.queue_capacity,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_seconds),
            cache_capacity: self.cache_capacity,
            cache_ttl: Duration::from_secs(self.cache_ttl_seconds),
        }
    }
}

/// Settings shared by every queue of one manager.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub capacity: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub cache_capacity: u64,
    pub cache_ttl: Duration,
}

/// Configuration for one registered database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database identifier used by callers at submission.
    pub name: String,
    /// Key of the engine registered with the queue manager.
    pub engine: String,
    /// Engine-specific connection URL.
    pub url: String,
    /// Whether the Lead queue may execute migration actions it computes.
    pub auto_migrate: bool,
    /// Minimum migration version below which the database counts as
    /// uninitialized.
    pub migration_threshold: i64,
    /// Worker queue topology for this database.
    pub workers: WorkerTopology,
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, engine: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            engine: engine.into(),
            url: url.into(),
            auto_migrate: false,
            migration_threshold: DEFAULT_MIGRATION_THRESHOLD,
            workers: WorkerTopology::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DispatchError::Configuration(
                "database name must not be empty".to_string(),
            ));
        }
        if self.url.is_empty() {
            return Err(DispatchError::Configuration(format!(
                "database {} has an empty connection url",
                self.name
            )));
        }
        if self.migration_threshold < 0 {
            return Err(DispatchError::Configuration(format!(
                "database {} has a negative migration threshold",
                self.name
            )));
        }
        Ok(())
    }
}

/// Per-workload-class worker settings under one Lead.
///
/// `enabled` classes get a worker spawned whenever none exists. A class with
/// `retire_after_idle_seconds = None` is never retired once spawned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerClassConfig {
    pub enabled: bool,
    pub retire_after_idle_seconds: Option<u64>,
}

/// One slot per workload class. A Lead never carries two workers of the same
/// class.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerTopology {
    pub slow: WorkerClassConfig,
    pub medium: WorkerClassConfig,
    pub fast: WorkerClassConfig,
    pub cache: WorkerClassConfig,
}

impl WorkerTopology {
    pub fn get(&self, class: WorkloadClass) -> &WorkerClassConfig {
        match class {
            WorkloadClass::Slow => &self.slow,
            WorkloadClass::Medium => &self.medium,
            WorkloadClass::Fast => &self.fast,
            WorkloadClass::Cache => &self.cache,
        }
    }

    pub fn get_mut(&mut self, class: WorkloadClass) -> &mut WorkerClassConfig {
        match class {
            WorkloadClass::Slow => &mut self.slow,
            WorkloadClass::Medium => &mut self.medium,
            WorkloadClass::Fast => &mut self.fast,
            WorkloadClass::Cache => &mut self.cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; serialize the tests that touch them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn default_config_is_valid() {
        let config = DispatchConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacity_rejected() {
        let config = DispatchConfig {
            queue_capacity: 0,
            ..DispatchConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DispatchError::Configuration(_))
        ));
    }

    #[test]
    fn database_config_requires_url() {
        let mut database = DatabaseConfig::new("orders", "postgres", "postgres://localhost/orders");
        assert!(database.validate().is_ok());

        database.url.clear();
        assert!(database.validate().is_err());
    }

    #[test]
    fn env_override_parses() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DISPATCH_QUEUE_CAPACITY", "64");
        let config = DispatchConfig::from_env().unwrap();
        assert_eq!(config.queue_capacity, 64);
        std::env::remove_var("DISPATCH_QUEUE_CAPACITY");
    }

    #[test]
    fn env_override_rejects_garbage() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DISPATCH_MAX_DATABASES", "lots");
        let result = DispatchConfig::from_env();
        assert!(matches!(result, Err(DispatchError::Configuration(_))));
        std::env::remove_var("DISPATCH_MAX_DATABASES");
    }

    #[test]
    fn topology_slots_are_class_keyed() {
        let mut topology = WorkerTopology::default();
        topology.get_mut(WorkloadClass::Fast).enabled = true;
        assert!(topology.get(WorkloadClass::Fast).enabled);
        assert!(!topology.get(WorkloadClass::Slow).enabled);
    }
}

//! # Queue Manager
//!
//! Process-wide registry mapping database names to their Lead queues, plus
//! the submission, wait, and status APIs. Created once at startup; an
//! explicit [`shutdown`](QueueManager::shutdown) drains and joins every
//! worker task before the registries drop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{DatabaseConfig, DispatchConfig};
use crate::engine::{QueryEngine, QueryResult};
use crate::error::{DispatchError, Result};
use crate::migration::{MigrationMarkers, MigrationSource};
use crate::pending::PendingResultRegistry;

use super::query::SubmitRequest;
use super::queue::{DispatchQueue, QueueContext, QueueStatus};
use super::router;
use super::stats::{DispatchStats, StatsSnapshot};

struct DatabaseEntry {
    lead: Arc<DispatchQueue>,
    join: JoinHandle<()>,
}

/// Read-only snapshot of one database's queues.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatus {
    pub name: String,
    pub connected: bool,
    pub consecutive_failures: u32,
    pub lead: QueueStatus,
    pub workers: Vec<QueueStatus>,
    pub migration: MigrationMarkers,
}

/// Read-only snapshot of the whole dispatch subsystem.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatus {
    pub generated_at: DateTime<Utc>,
    pub uptime_seconds: i64,
    pub stats: StatsSnapshot,
    pub databases: Vec<DatabaseStatus>,
}

pub struct QueueManager {
    config: DispatchConfig,
    engines: RwLock<HashMap<String, Arc<dyn QueryEngine>>>,
    migration_source: Arc<dyn MigrationSource>,
    databases: DashMap<String, DatabaseEntry>,
    registry: Arc<PendingResultRegistry>,
    stats: Arc<DispatchStats>,
    janitor: Mutex<Option<JoinHandle<()>>>,
    started_at: DateTime<Utc>,
}

impl QueueManager {
    /// Create the manager and start its registry janitor.
    pub fn new(config: DispatchConfig, migration_source: Arc<dyn MigrationSource>) -> Result<Arc<Self>> {
        config.validate()?;

        let registry = Arc::new(PendingResultRegistry::new());
        let stats = Arc::new(DispatchStats::new());

        let janitor = {
            let registry = registry.clone();
            let stats = stats.clone();
            let interval = Duration::from_secs(config.cleanup_interval_seconds.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let reaped = registry.cleanup_expired();
                    if reaped > 0 {
                        stats.record_timed_out(reaped as u64);
                        debug!(reaped, "reaped expired pending results");
                    }
                }
            })
        };

        info!(
            max_databases = config.max_databases,
            queue_capacity = config.queue_capacity,
            "queue manager created"
        );

        Ok(Arc::new(Self {
            config,
            engines: RwLock::new(HashMap::new()),
            migration_source,
            databases: DashMap::new(),
            registry,
            stats,
            janitor: Mutex::new(Some(janitor)),
            started_at: Utc::now(),
        }))
    }

    /// Register an engine implementation under its name.
    pub fn register_engine(&self, engine: Arc<dyn QueryEngine>) {
        let name = engine.name().to_string();
        self.engines.write().insert(name.clone(), engine);
        info!(engine = %name, "registered engine");
    }

    /// Register a database: creates its Lead queue and starts the worker
    /// loop. The Lead connects, orchestrates migrations, and spawns its
    /// configured workers from inside that loop.
    #[instrument(skip(self, config), fields(database = %config.name))]
    pub async fn register_database(&self, config: DatabaseConfig) -> Result<()> {
        config.validate()?;

        if self.databases.len() >= self.config.max_databases {
            return Err(DispatchError::Configuration(format!(
                "database capacity {} reached, cannot register {}",
                self.config.max_databases, config.name
            )));
        }
        if self.databases.contains_key(&config.name) {
            return Err(DispatchError::Configuration(format!(
                "database {} already registered",
                config.name
            )));
        }

        let engine = self
            .engines
            .read()
            .get(&config.engine)
            .cloned()
            .ok_or_else(|| {
                DispatchError::Configuration(format!(
                    "unknown engine {} for database {}",
                    config.engine, config.name
                ))
            })?;

        let ctx = QueueContext {
            engine,
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            settings: self.config.queue_settings(),
        };

        let lead = DispatchQueue::new_lead(&config, ctx, self.migration_source.clone());
        let join = tokio::spawn(lead.clone().run());
        self.databases
            .insert(config.name.clone(), DatabaseEntry { lead, join });

        info!("registered database");
        Ok(())
    }

    /// Shut a database's queue hierarchy down and free its slot.
    pub async fn remove_database(&self, name: &str) -> Result<()> {
        let (_, entry) = self
            .databases
            .remove(name)
            .ok_or_else(|| DispatchError::UnknownDatabase(name.to_string()))?;

        entry.lead.request_shutdown();
        if tokio::time::timeout(Duration::from_secs(10), entry.join)
            .await
            .is_err()
        {
            warn!(database = %name, "lead queue did not stop within timeout");
        }
        info!(database = %name, "removed database");
        Ok(())
    }

    /// The Lead queue of a registered database.
    pub fn database_queue(&self, name: &str) -> Option<Arc<DispatchQueue>> {
        self.databases.get(name).map(|entry| entry.lead.clone())
    }

    /// Submit a query for asynchronous execution.
    ///
    /// Registers a pending result, routes by workload hint, and enqueues.
    /// Returns the query id the caller can later wait on.
    pub async fn submit(
        &self,
        database: &str,
        hint: Option<&str>,
        request: SubmitRequest,
    ) -> Result<String> {
        let lead = self
            .databases
            .get(database)
            .map(|entry| entry.lead.clone())
            .ok_or_else(|| DispatchError::UnknownDatabase(database.to_string()))?;

        let query = router::build_query(request, hint);
        let class = query.workload;
        let query_id = query.query_id.clone();

        // The pending entry must exist before the worker can possibly
        // deliver; registration therefore precedes the enqueue.
        self.registry.register(
            &query_id,
            Duration::from_secs(self.config.default_timeout_seconds),
        )?;

        let target = router::route(&lead, class).await;
        if let Err(err) = target.enqueue(query) {
            self.registry.discard(&query_id);
            return Err(err);
        }

        self.stats.record_submitted(class);
        debug!(
            database,
            query_id = %query_id,
            class = %class,
            target = %target.label(),
            "query submitted"
        );
        Ok(query_id)
    }

    /// Block until the query completes or `timeout_seconds` past its
    /// registration. Timing out never cancels the underlying execution.
    pub async fn await_result(&self, query_id: &str, timeout_seconds: u64) -> Result<QueryResult> {
        match self
            .registry
            .wait(query_id, Duration::from_secs(timeout_seconds))
            .await
        {
            Err(err @ DispatchError::Timeout(_)) => {
                self.stats.record_timed_out(1);
                Err(err)
            }
            other => other,
        }
    }

    /// Point-in-time snapshot of counters, queue depths, and connection
    /// state. Reads only its own locks; dispatch is never disturbed.
    pub async fn status(&self) -> DispatchStatus {
        let mut databases = Vec::with_capacity(self.databases.len());
        let leads: Vec<Arc<DispatchQueue>> = self
            .databases
            .iter()
            .map(|entry| entry.lead.clone())
            .collect();

        for lead in leads {
            let workers = lead.worker_statuses().await;
            let migration = lead
                .lead
                .as_ref()
                .map(|state| state.migration.markers())
                .unwrap_or(MigrationMarkers {
                    available: 0,
                    loaded: 0,
                    applied: 0,
                });
            databases.push(DatabaseStatus {
                name: lead.database().to_string(),
                connected: lead.is_connected(),
                consecutive_failures: lead.consecutive_failures(),
                lead: lead.status(),
                workers,
                migration,
            });
        }

        DispatchStatus {
            generated_at: Utc::now(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            stats: self.stats.snapshot(),
            databases,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.registry.len()
    }

    /// Drain and join the entire hierarchy. Leads signal their children from
    /// inside their own loops; the manager joins every Lead task.
    pub async fn shutdown(&self) {
        if let Some(janitor) = self.janitor.lock().take() {
            janitor.abort();
        }

        let names: Vec<String> = self
            .databases
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut joins = Vec::new();
        for name in names {
            if let Some((_, entry)) = self.databases.remove(&name) {
                entry.lead.request_shutdown();
                joins.push(entry.join);
            }
        }

        if tokio::time::timeout(Duration::from_secs(10), join_all(joins))
            .await
            .is_err()
        {
            warn!("some queues did not stop within the shutdown timeout");
        }

        info!("queue manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_dispatch_config, MockEngine, StaticMigrationSource};

    async fn manager_with_mock(engine: &MockEngine) -> Arc<QueueManager> {
        let manager = QueueManager::new(
            test_dispatch_config(),
            Arc::new(StaticMigrationSource::empty()),
        )
        .unwrap();
        manager.register_engine(Arc::new(engine.clone()));
        manager
    }

    #[tokio::test]
    async fn submit_to_unknown_database_is_rejected() {
        let engine = MockEngine::new();
        let manager = manager_with_mock(&engine).await;

        let outcome = manager
            .submit("ghost", None, SubmitRequest::new("SELECT 1"))
            .await;
        assert!(matches!(outcome, Err(DispatchError::UnknownDatabase(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_database_registration_rejected() {
        let engine = MockEngine::new();
        let manager = manager_with_mock(&engine).await;

        manager
            .register_database(DatabaseConfig::new("orders", "mock", "mock://orders"))
            .await
            .unwrap();
        let outcome = manager
            .register_database(DatabaseConfig::new("orders", "mock", "mock://orders"))
            .await;
        assert!(matches!(outcome, Err(DispatchError::Configuration(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn capacity_is_fixed_at_startup() {
        let engine = MockEngine::new();
        let mut config = test_dispatch_config();
        config.max_databases = 1;
        let manager =
            QueueManager::new(config, Arc::new(StaticMigrationSource::empty())).unwrap();
        manager.register_engine(Arc::new(engine.clone()));

        manager
            .register_database(DatabaseConfig::new("a", "mock", "mock://a"))
            .await
            .unwrap();
        let outcome = manager
            .register_database(DatabaseConfig::new("b", "mock", "mock://b"))
            .await;
        assert!(matches!(outcome, Err(DispatchError::Configuration(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_engine_rejected_at_registration() {
        let engine = MockEngine::new();
        let manager = manager_with_mock(&engine).await;

        let outcome = manager
            .register_database(DatabaseConfig::new("orders", "oracle", "oracle://x"))
            .await;
        assert!(matches!(outcome, Err(DispatchError::Configuration(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn remove_database_frees_the_slot() {
        let engine = MockEngine::new();
        let manager = manager_with_mock(&engine).await;

        manager
            .register_database(DatabaseConfig::new("orders", "mock", "mock://orders"))
            .await
            .unwrap();
        manager.remove_database("orders").await.unwrap();
        assert!(manager.database_queue("orders").is_none());

        // Slot is reusable.
        manager
            .register_database(DatabaseConfig::new("orders", "mock", "mock://orders"))
            .await
            .unwrap();
        manager.shutdown().await;
    }
}

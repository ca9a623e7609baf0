//! # Test Support
//!
//! Scriptable in-memory doubles for the engine and migration capabilities,
//! shared by unit and integration tests. Not intended for production use.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::DispatchConfig;
use crate::dispatch::queue::QueueContext;
use crate::dispatch::stats::DispatchStats;
use crate::engine::{
    ConnectionParams, EngineConnection, EngineError, EngineResult, QueryEngine, QueryRequest,
    QueryResult,
};
use crate::error::Result;
use crate::migration::{MigrationScript, MigrationSource};
use crate::pending::PendingResultRegistry;

#[derive(Default)]
struct MockState {
    connect_failures: AtomicU32,
    ping_failures: AtomicU32,
    batch_failures: AtomicU32,
    connects: AtomicU32,
    pings: AtomicU32,
    executed: Mutex<Vec<String>>,
    errors: Mutex<Vec<(String, EngineError)>>,
    execute_delay: Mutex<Option<Duration>>,
    applied_batches: Mutex<Vec<Vec<String>>>,
}

/// Scriptable engine double. Cloning shares the underlying state, so tests
/// can keep a handle while the manager owns another.
#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` connection attempts with a connectivity error.
    pub fn fail_next_connects(&self, count: u32) {
        self.state.connect_failures.store(count, Ordering::Release);
    }

    /// Fail the next `count` liveness probes.
    pub fn fail_next_pings(&self, count: u32) {
        self.state.ping_failures.store(count, Ordering::Release);
    }

    /// Fail the next `count` migration batches.
    pub fn fail_next_batches(&self, count: u32) {
        self.state.batch_failures.store(count, Ordering::Release);
    }

    /// Make any query whose SQL matches `sql` fail with `error`.
    pub fn set_error_for(&self, sql: &str, error: EngineError) {
        self.state.errors.lock().push((sql.to_string(), error));
    }

    /// Delay every execution, to keep workers observably busy.
    pub fn set_execute_delay(&self, delay: Duration) {
        *self.state.execute_delay.lock() = Some(delay);
    }

    /// Query ids in the order connections executed them.
    pub fn executed_ids(&self) -> Vec<String> {
        self.state.executed.lock().clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.state.connects.load(Ordering::Acquire)
    }

    pub fn ping_count(&self) -> u32 {
        self.state.pings.load(Ordering::Acquire)
    }

    /// Statement batches applied through `execute_batch`.
    pub fn applied_batches(&self) -> Vec<Vec<String>> {
        self.state.applied_batches.lock().clone()
    }
}

#[async_trait]
impl QueryEngine for MockEngine {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self, _params: &ConnectionParams) -> EngineResult<Box<dyn EngineConnection>> {
        if take_one(&self.state.connect_failures) {
            return Err(EngineError::Connectivity("mock connect refused".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

struct MockConnection {
    state: Arc<MockState>,
}

#[async_trait]
impl EngineConnection for MockConnection {
    async fn execute(&mut self, request: &QueryRequest) -> EngineResult<QueryResult> {
        let delay = *self.state.execute_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.state.executed.lock().push(request.query_id.clone());

        let scripted = self
            .state
            .errors
            .lock()
            .iter()
            .find(|(sql, _)| sql == &request.sql)
            .map(|(_, error)| error.clone());
        if let Some(error) = scripted {
            return Err(error);
        }

        Ok(QueryResult {
            columns: vec!["value".to_string()],
            rows: vec![serde_json::json!({ "value": 42 })],
            affected_rows: 0,
            execution_time_ms: 1,
        })
    }

    async fn ping(&mut self) -> EngineResult<()> {
        if take_one(&self.state.ping_failures) {
            return Err(EngineError::Connectivity("mock ping refused".to_string()));
        }
        self.state.pings.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn execute_batch(&mut self, statements: &[String]) -> EngineResult<()> {
        if take_one(&self.state.batch_failures) {
            return Err(EngineError::Execution("mock batch refused".to_string()));
        }
        self.state.applied_batches.lock().push(statements.to_vec());
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (current > 0).then(|| current.saturating_sub(1))
        })
        .is_ok()
}

/// In-memory migration source with a fixed script set.
pub struct StaticMigrationSource {
    available: AtomicI64,
    scripts: Mutex<Vec<MigrationScript>>,
}

impl StaticMigrationSource {
    pub fn empty() -> Self {
        Self {
            available: AtomicI64::new(0),
            scripts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_scripts(scripts: Vec<MigrationScript>) -> Self {
        let available = scripts.iter().map(|s| s.version).max().unwrap_or(0);
        Self {
            available: AtomicI64::new(available),
            scripts: Mutex::new(scripts),
        }
    }

    /// Publish another script, as if a newer migration appeared on disk.
    pub fn add_script(&self, script: MigrationScript) {
        let mut scripts = self.scripts.lock();
        let available = self.available.load(Ordering::Acquire).max(script.version);
        scripts.push(script);
        self.available.store(available, Ordering::Release);
    }
}

#[async_trait]
impl MigrationSource for StaticMigrationSource {
    async fn latest_available(&self, _database: &str) -> Result<i64> {
        Ok(self.available.load(Ordering::Acquire))
    }

    async fn scripts_between(
        &self,
        _database: &str,
        after: i64,
        up_to: i64,
    ) -> Result<Vec<MigrationScript>> {
        let mut scripts: Vec<MigrationScript> = self
            .scripts
            .lock()
            .iter()
            .filter(|s| s.version > after && s.version <= up_to)
            .cloned()
            .collect();
        scripts.sort_by_key(|s| s.version);
        Ok(scripts)
    }
}

/// Queue context with short intervals, wired to a shared registry and stats.
pub fn test_queue_context(engine: &MockEngine) -> QueueContext {
    QueueContext {
        engine: Arc::new(engine.clone()),
        registry: Arc::new(PendingResultRegistry::new()),
        stats: Arc::new(DispatchStats::new()),
        settings: test_dispatch_config().queue_settings(),
    }
}

/// Dispatcher configuration with intervals tightened for tests.
pub fn test_dispatch_config() -> DispatchConfig {
    DispatchConfig {
        max_databases: 4,
        queue_capacity: 64,
        default_timeout_seconds: 5,
        heartbeat_interval_seconds: 0,
        poll_interval_ms: 25,
        cleanup_interval_seconds: 1,
        cache_capacity: 64,
        cache_ttl_seconds: 60,
        databases: Vec::new(),
    }
}

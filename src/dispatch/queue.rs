//! # Dispatch Queue
//!
//! One FIFO of submitted queries plus the dedicated worker task that drains
//! it. A queue exists in two roles: Lead (one per database, also responsible
//! for topology and migration decisions) and Worker (zero or one per workload
//! class under a Lead). Each queue owns at most one persistent connection,
//! replaced only while holding the connection guard.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, QueueSettings, WorkerTopology};
use crate::engine::{ConnectionParams, EngineConnection, EngineError, QueryEngine, QueryRequest, QueryResult};
use crate::error::{DispatchError, Result};
use crate::logging::queue_label;
use crate::migration::{MigrationOrchestrator, MigrationSource};
use crate::pending::PendingResultRegistry;

use super::cache::QueryResultCache;
use super::query::{DispatchQuery, QueueKind, WorkloadClass};
use super::stats::DispatchStats;

/// Shared collaborators handed to every queue of one manager.
#[derive(Clone)]
pub struct QueueContext {
    pub engine: Arc<dyn QueryEngine>,
    pub registry: Arc<PendingResultRegistry>,
    pub stats: Arc<DispatchStats>,
    pub settings: QueueSettings,
}

/// A spawned Worker queue plus the handle needed to join it on retirement.
pub struct WorkerHandle {
    pub queue: Arc<DispatchQueue>,
    pub join: JoinHandle<()>,
}

/// Lead-only state: child slots, topology settings, migration orchestration.
pub struct LeadState {
    /// One slot per workload class; never two children of the same class.
    pub(crate) children: AsyncMutex<HashMap<WorkloadClass, WorkerHandle>>,
    pub(crate) topology: WorkerTopology,
    pub(crate) migration: MigrationOrchestrator,
}

/// Read-only view of one queue for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub kind: String,
    pub depth: usize,
    pub busy: bool,
    pub connected: bool,
    pub consecutive_failures: u32,
}

pub struct DispatchQueue {
    database: String,
    kind: QueueKind,
    label: String,
    params: ConnectionParams,
    ctx: QueueContext,

    tx: mpsc::Sender<DispatchQuery>,
    rx: AsyncMutex<Option<mpsc::Receiver<DispatchQuery>>>,

    /// The persistent connection slot. The mutex itself is the connection
    /// guard shared by query execution, the health monitor, and migrations.
    connection: AsyncMutex<Option<Box<dyn EngineConnection>>>,
    is_connected: AtomicBool,
    consecutive_failures: AtomicU32,
    pub(crate) last_heartbeat: Mutex<Instant>,
    pub(crate) last_connection_attempt: Mutex<Option<Instant>>,

    busy: AtomicBool,
    last_active: Mutex<Instant>,

    shutdown: AtomicBool,
    shutdown_notify: Notify,

    /// Present only on Cache-class workers.
    result_cache: Option<QueryResultCache>,
    pub(crate) lead: Option<LeadState>,
}

impl DispatchQueue {
    /// Create the Lead queue for a registered database.
    pub fn new_lead(
        config: &DatabaseConfig,
        ctx: QueueContext,
        migration_source: Arc<dyn MigrationSource>,
    ) -> Arc<Self> {
        let migration = MigrationOrchestrator::new(
            migration_source,
            config.migration_threshold,
            config.auto_migrate,
        );
        let lead = LeadState {
            children: AsyncMutex::new(HashMap::new()),
            topology: config.workers.clone(),
            migration,
        };
        Self::new_inner(
            config.name.clone(),
            config.url.clone(),
            QueueKind::Lead,
            ctx,
            Some(lead),
        )
    }

    /// Create a Worker queue under a Lead.
    pub(crate) fn new_worker(
        database: &str,
        params: ConnectionParams,
        class: WorkloadClass,
        ctx: QueueContext,
    ) -> Arc<Self> {
        Self::new_inner(
            database.to_string(),
            params.url,
            QueueKind::Worker(class),
            ctx,
            None,
        )
    }

    fn new_inner(
        database: String,
        url: String,
        kind: QueueKind,
        ctx: QueueContext,
        lead: Option<LeadState>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(ctx.settings.capacity);
        let label = queue_label(&database, kind.label());
        let result_cache = matches!(kind, QueueKind::Worker(WorkloadClass::Cache)).then(|| {
            QueryResultCache::new(ctx.settings.cache_capacity, ctx.settings.cache_ttl)
        });

        // Backdate the first heartbeat so a fresh queue connects on its first
        // idle tick instead of waiting a full interval.
        let now = Instant::now();
        let heartbeat_start = now
            .checked_sub(ctx.settings.heartbeat_interval)
            .unwrap_or(now);

        Arc::new(Self {
            params: ConnectionParams {
                database: database.clone(),
                url,
            },
            database,
            kind,
            label,
            ctx,
            tx,
            rx: AsyncMutex::new(Some(rx)),
            connection: AsyncMutex::new(None),
            is_connected: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            last_heartbeat: Mutex::new(heartbeat_start),
            last_connection_attempt: Mutex::new(None),
            busy: AtomicBool::new(false),
            last_active: Mutex::new(now),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            result_cache,
            lead,
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn kind(&self) -> QueueKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn connection_params(&self) -> &ConnectionParams {
        &self.params
    }

    pub(crate) fn context(&self) -> &QueueContext {
        &self.ctx
    }

    /// Current FIFO depth, mirrored from the channel's outstanding slots.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Time since the queue last accepted or finished work.
    pub fn idle_for(&self) -> std::time::Duration {
        self.last_active.lock().elapsed()
    }

    /// Request cooperative shutdown. The worker loop observes the flag on its
    /// next iteration; nothing is forced.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.shutdown_notify.notify_waiters();
    }

    /// Enqueue a query on this queue's FIFO.
    pub fn enqueue(&self, query: DispatchQuery) -> Result<()> {
        if self.is_shutdown() {
            return Err(DispatchError::InvalidState(format!(
                "queue {} is shutting down",
                self.label
            )));
        }
        match self.tx.try_send(query) {
            Ok(()) => {
                *self.last_active.lock() = Instant::now();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(query)) => Err(DispatchError::QueueFull(format!(
                "queue {} rejected query {}",
                self.label, query.query_id
            ))),
            Err(mpsc::error::TrySendError::Closed(query)) => {
                Err(DispatchError::InvalidState(format!(
                    "queue {} is no longer accepting work (query {})",
                    self.label, query.query_id
                )))
            }
        }
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            kind: self.kind.label().to_string(),
            depth: self.depth(),
            busy: self.is_busy(),
            connected: self.is_connected(),
            consecutive_failures: self.consecutive_failures(),
        }
    }

    /// The worker loop. Runs until shutdown is requested; alternates between
    /// draining the FIFO and idle maintenance (heartbeat, and for Leads,
    /// topology and migration work).
    ///
    /// Returns a boxed future: the loop transitively spawns `run` again (a Lead
    /// spawns its workers' loops), and a recursive `async fn` has an opaque
    /// return type whose `Send`-ness cannot be inferred within its own call
    /// graph. Boxing gives `run` a concrete `Send` type, breaking the cycle.
    pub fn run(self: Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut rx = match self.rx.lock().await.take() {
                Some(rx) => rx,
                None => {
                    warn!(queue = %self.label, "worker loop already running");
                    return;
                }
            };

            info!(queue = %self.label, "worker loop started");

            if self.lead.is_some() {
                self.run_lead_startup().await;
            }

            loop {
                if self.is_shutdown() {
                    break;
                }

                tokio::select! {
                    _ = self.shutdown_notify.notified() => {}
                    received = tokio::time::timeout(self.ctx.settings.poll_interval, rx.recv()) => {
                        match received {
                            Ok(Some(query)) => self.execute_one(query).await,
                            Ok(None) => break,
                            Err(_) => {
                                // Idle tick. Heartbeat and Lead maintenance run
                                // here so traffic is never delayed by them.
                                if self.heartbeat_due() {
                                    self.run_heartbeat().await;
                                    if self.lead.is_some() {
                                        self.run_topology_cycle().await;
                                    }
                                }
                            }
                        }
                    }
                }
            }

            // Drain no further queries; release the connection before exiting.
            if self.connection.lock().await.take().is_some() {
                debug!(queue = %self.label, "released connection on shutdown");
            }
            self.is_connected.store(false, Ordering::Release);

            if let Some(lead) = &self.lead {
                self.shutdown_children(lead).await;
            }

            info!(queue = %self.label, "worker loop stopped");
        })
    }

    /// Execute one dequeued query and deliver its outcome. Outcomes are never
    /// silently dropped: success and failure both reach the registry.
    async fn execute_one(&self, mut query: DispatchQuery) {
        self.busy.store(true, Ordering::Release);
        let query_id = query.query_id.clone();

        // Cache-class lookup happens before the connection is touched.
        if let (Some(cache), Some(key)) = (&self.result_cache, query.cache_key.as_deref()) {
            if let Some(hit) = cache.get(key) {
                debug!(queue = %self.label, query_id = %query_id, "served from result cache");
                self.ctx.stats.record_completed(query.workload, 0.0);
                self.ctx.registry.signal_ready(&query_id, Ok(hit));
                self.finish_execution();
                return;
            }
        }

        let request = QueryRequest {
            query_id: query_id.clone(),
            sql: query.sql_template.clone(),
            parameters: query.parameters.clone(),
        };

        let started = Instant::now();
        let outcome = self.execute_on_connection(&request).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(result) => {
                if let (Some(cache), Some(key)) = (&self.result_cache, query.cache_key.as_deref())
                {
                    cache.insert(key.to_string(), result.clone());
                }
                self.ctx.stats.record_completed(query.workload, elapsed_ms);
                self.ctx.registry.signal_ready(&query_id, Ok(result));
            }
            Err(err) => {
                query.record_failure(&err);
                warn!(
                    queue = %self.label,
                    query_id = %query_id,
                    retry_count = query.retry_count,
                    error = %err,
                    "query execution failed"
                );
                self.ctx.stats.record_failed(query.workload);
                self.ctx.registry.signal_ready(&query_id, Err(err));
            }
        }

        self.finish_execution();
    }

    fn finish_execution(&self) {
        self.busy.store(false, Ordering::Release);
        *self.last_active.lock() = Instant::now();
    }

    /// Run one query while holding the connection guard, attempting a single
    /// reconnect if no connection exists. Acquisition failure is a query
    /// failure, not a crash.
    async fn execute_on_connection(&self, request: &QueryRequest) -> Result<QueryResult> {
        let mut guard = self.connection.lock().await;

        if guard.is_none() {
            *self.last_connection_attempt.lock() = Some(Instant::now());
            match self.ctx.engine.connect(&self.params).await {
                Ok(conn) => {
                    *guard = Some(conn);
                    self.is_connected.store(true, Ordering::Release);
                    self.consecutive_failures.store(0, Ordering::Release);
                    info!(queue = %self.label, "connection established");
                }
                Err(err) => {
                    self.is_connected.store(false, Ordering::Release);
                    return Err(DispatchError::Connectivity(format!(
                        "no connection for {}: {err}",
                        self.label
                    )));
                }
            }
        }

        let Some(conn) = guard.as_mut() else {
            return Err(DispatchError::Connectivity(format!(
                "no connection for {}",
                self.label
            )));
        };

        match conn.execute(request).await {
            Ok(result) => Ok(result),
            Err(EngineError::Connectivity(msg)) => {
                // Stale handle: drop it so the health monitor reconnects.
                *guard = None;
                self.is_connected.store(false, Ordering::Release);
                Err(DispatchError::Connectivity(msg))
            }
            Err(other) => Err(other.into()),
        }
    }

    /// Execute migration statements as one transaction on this queue's
    /// connection, under the same guard as query execution.
    pub(crate) async fn apply_statements(&self, statements: &[String]) -> Result<()> {
        let mut guard = self.connection.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Err(DispatchError::Connectivity(format!(
                "no connection on {} for migration",
                self.label
            )));
        };
        match conn.execute_batch(statements).await {
            Ok(()) => Ok(()),
            Err(EngineError::Connectivity(msg)) => {
                *guard = None;
                self.is_connected.store(false, Ordering::Release);
                Err(DispatchError::Migration(format!(
                    "connection lost during migration: {msg}"
                )))
            }
            Err(other) => Err(DispatchError::Migration(other.to_string())),
        }
    }

    pub(crate) fn connection_slot(&self) -> &AsyncMutex<Option<Box<dyn EngineConnection>>> {
        &self.connection
    }

    pub(crate) fn mark_connected(&self, connected: bool) {
        self.is_connected.store(connected, Ordering::Release);
    }

    pub(crate) fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }

    pub(crate) fn record_failure_tick(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }
}

//! # Queue Topology Management
//!
//! Lead-only logic deciding, each idle cycle, whether to spawn or retire
//! typed Worker queues and whether migrations must run. Structural changes
//! happen under the Lead's children lock; a retired worker is signaled and
//! joined before its slot can be reused.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::dispatch::query::WorkloadClass;
use crate::error::{DispatchError, Result};

use super::queue::{DispatchQueue, LeadState, WorkerHandle};

/// Upper bound on waiting for a retired worker's task to finish.
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

impl DispatchQueue {
    /// One-time Lead startup: establish the connection, refresh migration
    /// state, run migration cycles, then launch the configured workers.
    pub(crate) async fn run_lead_startup(&self) {
        let Some(lead) = &self.lead else { return };

        self.run_heartbeat().await;

        if let Err(err) = lead.migration.refresh_available(self.database()).await {
            warn!(queue = %self.label(), error = %err, "could not discover available migrations");
        }
        if let Err(err) = lead.migration.run_cycles(self).await {
            error!(queue = %self.label(), error = %err, "migration orchestration failed");
        }

        self.ensure_workers().await;
        info!(queue = %self.label(), "lead startup sequence complete");
    }

    /// Steady-state topology work, run on the Lead's idle heartbeat cycles.
    pub(crate) async fn run_topology_cycle(&self) {
        let Some(lead) = &self.lead else { return };

        self.ensure_workers().await;
        self.retire_idle_workers().await;

        if let Err(err) = lead.migration.refresh_available(self.database()).await {
            debug!(queue = %self.label(), error = %err, "migration discovery failed");
        }
        if let Err(err) = lead.migration.run_cycles(self).await {
            error!(queue = %self.label(), error = %err, "migration orchestration failed");
        }
    }

    /// Spawn a Worker of `class` under this Lead.
    ///
    /// Idempotent: returns `Ok(false)` when a live child of that class
    /// already occupies the slot.
    pub async fn spawn_worker(&self, class: WorkloadClass) -> Result<bool> {
        let Some(lead) = &self.lead else {
            return Err(DispatchError::InvalidState(
                "only lead queues spawn workers".to_string(),
            ));
        };

        let mut children = lead.children.lock().await;
        if children.contains_key(&class) {
            return Ok(false);
        }

        let queue = DispatchQueue::new_worker(
            self.database(),
            self.connection_params().clone(),
            class,
            self.context().clone(),
        );
        let join = tokio::spawn(queue.clone().run());
        children.insert(class, WorkerHandle { queue, join });

        info!(queue = %self.label(), class = %class, "spawned worker queue");
        Ok(true)
    }

    /// Retire the Worker of `class`, if present.
    ///
    /// Refused while the worker still has queued or executing work. The
    /// worker is signaled and joined before its slot frees up.
    pub async fn retire_worker(&self, class: WorkloadClass) -> Result<bool> {
        let Some(lead) = &self.lead else {
            return Err(DispatchError::InvalidState(
                "only lead queues retire workers".to_string(),
            ));
        };

        let mut children = lead.children.lock().await;
        match children.remove(&class) {
            None => Ok(false),
            Some(handle) if handle.queue.depth() > 0 || handle.queue.is_busy() => {
                // Put it back; retirement is refused while work remains.
                children.insert(class, handle);
                Err(DispatchError::InvalidState(format!(
                    "{class} worker for {} still has work",
                    self.database()
                )))
            }
            Some(handle) => {
                handle.queue.request_shutdown();
                if tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle.join)
                    .await
                    .is_err()
                {
                    warn!(queue = %self.label(), class = %class, "worker did not stop within timeout");
                }
                info!(queue = %self.label(), class = %class, "retired worker queue");
                Ok(true)
            }
        }
    }

    /// The live Worker for `class`, when one exists.
    pub async fn worker_queue(&self, class: WorkloadClass) -> Option<Arc<DispatchQueue>> {
        let lead = self.lead.as_ref()?;
        let children = lead.children.lock().await;
        children
            .get(&class)
            .filter(|handle| !handle.queue.is_shutdown())
            .map(|handle| handle.queue.clone())
    }

    /// Status of every live worker, keyed by class label.
    pub async fn worker_statuses(&self) -> Vec<super::queue::QueueStatus> {
        let Some(lead) = &self.lead else {
            return Vec::new();
        };
        let children = lead.children.lock().await;
        children
            .values()
            .map(|handle| handle.queue.status())
            .collect()
    }

    /// Spawn a worker for every class the configuration enables that has no
    /// live child yet.
    async fn ensure_workers(&self) {
        let Some(lead) = &self.lead else { return };
        for class in WorkloadClass::all() {
            if lead.topology.get(class).enabled {
                if let Err(err) = self.spawn_worker(class).await {
                    error!(queue = %self.label(), class = %class, error = %err, "failed to spawn worker");
                }
            }
        }
    }

    /// Retire workers whose class is no longer enabled, once they have been
    /// idle past the configured grace period. A class without a grace period
    /// is never retired.
    async fn retire_idle_workers(&self) {
        let Some(lead) = &self.lead else { return };

        let mut candidates = Vec::new();
        {
            let children = lead.children.lock().await;
            for (class, handle) in children.iter() {
                let settings = lead.topology.get(*class);
                if settings.enabled {
                    continue;
                }
                let Some(grace) = settings.retire_after_idle_seconds else {
                    continue;
                };
                let queue = &handle.queue;
                if queue.depth() == 0
                    && !queue.is_busy()
                    && queue.idle_for() >= Duration::from_secs(grace)
                {
                    candidates.push(*class);
                }
            }
        }

        for class in candidates {
            // Re-checked under the lock inside retire_worker; work may have
            // arrived since the scan.
            match self.retire_worker(class).await {
                Ok(true) => {}
                Ok(false) => {}
                Err(err) => debug!(queue = %self.label(), class = %class, error = %err, "retire deferred"),
            }
        }
    }

    /// Shut down and join every child. Used when the Lead itself stops.
    pub(crate) async fn shutdown_children(&self, lead: &LeadState) {
        let mut children = lead.children.lock().await;
        for handle in children.values() {
            handle.queue.request_shutdown();
        }
        for (class, handle) in children.drain() {
            if tokio::time::timeout(WORKER_JOIN_TIMEOUT, handle.join)
                .await
                .is_err()
            {
                warn!(queue = %self.label(), class = %class, "child did not stop within timeout");
            } else {
                debug!(queue = %self.label(), class = %class, "child stopped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::DatabaseConfig;
    use crate::dispatch::query::{DispatchQuery, SubmitRequest, WorkloadClass};
    use crate::dispatch::queue::DispatchQueue;
    use crate::test_support::{test_queue_context, MockEngine, StaticMigrationSource};

    fn lead_queue(engine: &MockEngine, config: DatabaseConfig) -> Arc<DispatchQueue> {
        let ctx = test_queue_context(engine);
        DispatchQueue::new_lead(&config, ctx, Arc::new(StaticMigrationSource::empty()))
    }

    #[tokio::test]
    async fn spawn_is_idempotent_per_class() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine, DatabaseConfig::new("orders", "mock", "mock://orders"));

        assert!(queue.spawn_worker(WorkloadClass::Fast).await.unwrap());
        assert!(!queue.spawn_worker(WorkloadClass::Fast).await.unwrap());

        let worker = queue.worker_queue(WorkloadClass::Fast).await.unwrap();
        assert_eq!(worker.kind().label(), "fast");

        queue.retire_worker(WorkloadClass::Fast).await.unwrap();
    }

    #[tokio::test]
    async fn retire_refused_while_fifo_nonempty() {
        let engine = MockEngine::new();
        engine.set_execute_delay(Duration::from_millis(1500));
        let queue = lead_queue(&engine, DatabaseConfig::new("orders", "mock", "mock://orders"));

        queue.spawn_worker(WorkloadClass::Slow).await.unwrap();
        let worker = queue.worker_queue(WorkloadClass::Slow).await.unwrap();

        // First query occupies the worker, second sits in the FIFO.
        for id in ["first", "second"] {
            worker
                .enqueue(DispatchQuery::new(
                    SubmitRequest::new("SELECT 1").with_id(id),
                    WorkloadClass::Slow,
                ))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = queue.retire_worker(WorkloadClass::Slow).await;
        assert!(outcome.is_err());

        // The refused worker is still routable.
        assert!(queue.worker_queue(WorkloadClass::Slow).await.is_some());
    }

    #[tokio::test]
    async fn retire_missing_worker_is_noop() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine, DatabaseConfig::new("orders", "mock", "mock://orders"));
        assert!(!queue.retire_worker(WorkloadClass::Cache).await.unwrap());
    }

    #[tokio::test]
    async fn retired_worker_is_joined_and_slot_freed() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine, DatabaseConfig::new("orders", "mock", "mock://orders"));

        queue.spawn_worker(WorkloadClass::Medium).await.unwrap();
        assert!(queue.retire_worker(WorkloadClass::Medium).await.unwrap());
        assert!(queue.worker_queue(WorkloadClass::Medium).await.is_none());

        // Slot reusable after the join.
        assert!(queue.spawn_worker(WorkloadClass::Medium).await.unwrap());
        queue.retire_worker(WorkloadClass::Medium).await.unwrap();
    }

    #[tokio::test]
    async fn workers_only_spawn_from_leads() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine, DatabaseConfig::new("orders", "mock", "mock://orders"));
        queue.spawn_worker(WorkloadClass::Fast).await.unwrap();
        let worker = queue.worker_queue(WorkloadClass::Fast).await.unwrap();

        let outcome = worker.spawn_worker(WorkloadClass::Slow).await;
        assert!(outcome.is_err());

        queue.retire_worker(WorkloadClass::Fast).await.unwrap();
    }

    #[tokio::test]
    async fn idle_disabled_workers_are_retired_after_grace() {
        let engine = MockEngine::new();
        let mut config = DatabaseConfig::new("orders", "mock", "mock://orders");
        // Not enabled, retirable immediately once idle.
        config.workers.get_mut(WorkloadClass::Fast).retire_after_idle_seconds = Some(0);
        let queue = lead_queue(&engine, config);

        queue.spawn_worker(WorkloadClass::Fast).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        queue.run_topology_cycle().await;
        assert!(queue.worker_queue(WorkloadClass::Fast).await.is_none());
    }

    #[tokio::test]
    async fn enabled_classes_are_spawned_by_cycle() {
        let engine = MockEngine::new();
        let mut config = DatabaseConfig::new("orders", "mock", "mock://orders");
        config.workers.get_mut(WorkloadClass::Fast).enabled = true;
        config.workers.get_mut(WorkloadClass::Cache).enabled = true;
        let queue = lead_queue(&engine, config);

        queue.run_topology_cycle().await;
        assert!(queue.worker_queue(WorkloadClass::Fast).await.is_some());
        assert!(queue.worker_queue(WorkloadClass::Cache).await.is_some());
        assert!(queue.worker_queue(WorkloadClass::Slow).await.is_none());

        // Second cycle leaves the topology unchanged.
        queue.run_topology_cycle().await;
        assert_eq!(queue.worker_statuses().await.len(), 2);

        if let Some(lead) = &queue.lead {
            queue.shutdown_children(lead).await;
        }
    }
}

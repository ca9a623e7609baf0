//! # Migration Orchestration
//!
//! Owned by each Lead queue. Every idle cycle the orchestrator evaluates the
//! action table against the database's version markers and, when
//! auto-migration is enabled, executes LOAD and APPLY phases until the
//! markers converge. APPLY runs under the same connection guard as ordinary
//! query execution, so the Lead's connection is never shared between a
//! migration and a regular query.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::dispatch::queue::DispatchQueue;
use crate::error::{DispatchError, Result};

use super::action::{determine_action, MigrationAction, MigrationMarkers};
use super::source::{MigrationScript, MigrationSource};

/// Bound on LOAD/APPLY phases per evaluation, so a source that never
/// converges cannot wedge the Lead's worker loop.
const MAX_MIGRATION_CYCLES: usize = 10;

pub struct MigrationOrchestrator {
    source: Arc<dyn MigrationSource>,
    threshold: i64,
    auto_migrate: bool,
    available: AtomicI64,
    loaded: AtomicI64,
    applied: AtomicI64,
    /// Scripts produced by LOAD, awaiting APPLY.
    staged: Mutex<Vec<MigrationScript>>,
}

impl MigrationOrchestrator {
    pub fn new(source: Arc<dyn MigrationSource>, threshold: i64, auto_migrate: bool) -> Self {
        Self {
            source,
            threshold,
            auto_migrate,
            available: AtomicI64::new(0),
            loaded: AtomicI64::new(0),
            applied: AtomicI64::new(0),
            staged: Mutex::new(Vec::new()),
        }
    }

    pub fn markers(&self) -> MigrationMarkers {
        MigrationMarkers {
            available: self.available.load(Ordering::Acquire),
            loaded: self.loaded.load(Ordering::Acquire),
            applied: self.applied.load(Ordering::Acquire),
        }
    }

    /// Seed the installed markers, e.g. from a bootstrap probe of an
    /// existing database.
    pub fn set_installed(&self, loaded: i64, applied: i64) {
        self.loaded.store(loaded, Ordering::Release);
        self.applied.store(applied, Ordering::Release);
    }

    /// Refresh the `available` marker from the migration source.
    pub async fn refresh_available(&self, database: &str) -> Result<()> {
        let latest = self.source.latest_available(database).await?;
        self.available.store(latest, Ordering::Release);
        Ok(())
    }

    /// Run LOAD/APPLY phases until the action table reports NONE.
    ///
    /// With auto-migration disabled the action is computed and logged but
    /// never executed. A phase failure leaves the markers unchanged and is
    /// surfaced; the next cycle recomputes the same action and retries.
    pub async fn run_cycles(&self, queue: &DispatchQueue) -> Result<()> {
        let database = queue.database().to_string();

        if !self.auto_migrate {
            let markers = self.markers();
            let action = determine_action(markers, self.threshold);
            if action != MigrationAction::None {
                info!(
                    database = %database,
                    available = markers.available,
                    loaded = markers.loaded,
                    applied = markers.applied,
                    ?action,
                    "auto-migration disabled, computed action not executed"
                );
            }
            return Ok(());
        }

        for _cycle in 0..MAX_MIGRATION_CYCLES {
            let markers = self.markers();
            match determine_action(markers, self.threshold) {
                MigrationAction::None => {
                    debug!(
                        database = %database,
                        available = markers.available,
                        loaded = markers.loaded,
                        applied = markers.applied,
                        "migrations current"
                    );
                    return Ok(());
                }
                MigrationAction::Load => {
                    if let Err(err) = self.run_load(&database).await {
                        error!(database = %database, error = %err, "migration load phase failed");
                        return Err(err);
                    }
                }
                MigrationAction::Apply => {
                    if let Err(err) = self.run_apply(queue).await {
                        error!(database = %database, error = %err, "migration apply phase failed");
                        return Err(err);
                    }
                }
            }
        }

        Err(DispatchError::Migration(format!(
            "migration for {database} exceeded {MAX_MIGRATION_CYCLES} cycles without converging"
        )))
    }

    /// LOAD: discover scripts past the `loaded` marker, stage their
    /// statements, and advance `loaded`.
    async fn run_load(&self, database: &str) -> Result<()> {
        let markers = self.markers();
        let scripts = self
            .source
            .scripts_between(database, markers.loaded, markers.available)
            .await?;

        let Some(top) = scripts.iter().map(|s| s.version).max() else {
            return Err(DispatchError::Migration(format!(
                "source reports version {} available for {database} but produced no scripts past {}",
                markers.available, markers.loaded
            )));
        };

        info!(
            database = %database,
            count = scripts.len(),
            through = top,
            "staged migration scripts"
        );

        *self.staged.lock().await = scripts;
        self.loaded.store(top, Ordering::Release);
        Ok(())
    }

    /// APPLY: execute the staged statements as one transaction on the Lead's
    /// connection and advance `applied` only on success.
    async fn run_apply(&self, queue: &DispatchQueue) -> Result<()> {
        let markers = self.markers();
        let mut staged = self.staged.lock().await;

        // Staging can be empty when the installed markers were seeded from an
        // existing database; re-discover the gap on demand.
        if staged.is_empty() {
            *staged = self
                .source
                .scripts_between(queue.database(), markers.applied, markers.loaded)
                .await?;
        }

        let pending: Vec<&MigrationScript> = staged
            .iter()
            .filter(|script| script.version > markers.applied)
            .collect();
        let Some(top) = pending.iter().map(|s| s.version).max() else {
            return Err(DispatchError::Migration(format!(
                "no staged scripts to apply for {} past version {}",
                queue.database(),
                markers.applied
            )));
        };

        let statements: Vec<String> = pending
            .iter()
            .flat_map(|script| script.statements.iter().cloned())
            .collect();

        queue.apply_statements(&statements).await.map_err(|err| {
            warn!(
                database = %queue.database(),
                through = top,
                error = %err,
                "migration transaction failed, markers unchanged"
            );
            err
        })?;

        self.applied.store(top, Ordering::Release);
        staged.clear();
        info!(database = %queue.database(), through = top, "applied migrations");
        Ok(())
    }
}

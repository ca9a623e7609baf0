//! # Dispatch Statistics
//!
//! Aggregate counters shared by every queue of one manager. Updated under the
//! manager's own locks, distinct from any queue's internal locking, so
//! reporting never contends with dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::query::WorkloadClass;

/// Per-workload-class counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ClassStats {
    /// Queries routed to this class.
    pub selected: u64,
    /// Successfully completed executions.
    pub completed: u64,
    /// Running average execution time, maintained incrementally rather than
    /// as a stored sum so it cannot overflow over long uptimes.
    pub avg_execution_ms: f64,
}

/// Manager-wide dispatch statistics.
#[derive(Debug, Default)]
pub struct DispatchStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    per_class: Mutex<HashMap<WorkloadClass, ClassStats>>,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub per_class: HashMap<WorkloadClass, ClassStats>,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submitted(&self, class: WorkloadClass) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        self.per_class.lock().entry(class).or_default().selected += 1;
    }

    pub fn record_completed(&self, class: WorkloadClass, execution_ms: f64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        let mut per_class = self.per_class.lock();
        let entry = per_class.entry(class).or_default();
        entry.completed += 1;
        let count = entry.completed as f64;
        entry.avg_execution_ms += (execution_ms - entry.avg_execution_ms) / count;
    }

    pub fn record_failed(&self, _class: WorkloadClass) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timed_out(&self, count: u64) {
        self.timed_out.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            per_class: self.per_class.lock().clone(),
        }
    }
}

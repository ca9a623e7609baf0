//! # Pending Result Registry
//!
//! The synchronous/asynchronous bridge of the dispatch core. A caller that
//! submits a query registers an entry here and blocks on it with a deadline;
//! the worker that eventually executes the query signals the entry from its
//! own task. Exactly one delivery (or one timeout) is observed per registered
//! id. A signal that arrives after the caller timed out is a documented
//! no-op, not an error.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::engine::QueryResult;
use crate::error::{DispatchError, Result};

/// Lifecycle of one pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PendingState {
    Waiting,
    Completed,
    TimedOut,
}

/// What a worker delivers for one query: the engine's result, or the
/// structured failure that terminated it.
pub type ExecutionOutcome = Result<QueryResult>;

struct PendingEntry {
    state: PendingState,
    registered_at: Instant,
    timeout: Duration,
    tx: Option<oneshot::Sender<ExecutionOutcome>>,
    rx: Option<oneshot::Receiver<ExecutionOutcome>>,
}

/// Process-wide table correlating query ids with in-flight results.
///
/// The registry lock is the arbiter for every race: `signal_ready` against
/// `wait` timing out, and `signal_ready` against `cleanup_expired`. Whichever
/// acquires the lock first wins; the loser's action degrades to a no-op.
pub struct PendingResultRegistry {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingResultRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register a new pending entry for `query_id`.
    ///
    /// `timeout` is the deadline used by the periodic sweep; the waiting
    /// caller supplies its own deadline to [`wait`](Self::wait).
    pub fn register(&self, query_id: &str, timeout: Duration) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(query_id) {
            return Err(DispatchError::DuplicateId(query_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            query_id.to_string(),
            PendingEntry {
                state: PendingState::Waiting,
                registered_at: Instant::now(),
                timeout,
                tx: Some(tx),
                rx: Some(rx),
            },
        );
        Ok(())
    }

    /// Deliver the outcome for `query_id`, waking the waiter if one exists.
    ///
    /// Returns `false` when the entry is gone or no longer waiting; the
    /// outcome is discarded in that case, which is the expected fate of a
    /// result whose caller already timed out.
    pub fn signal_ready(&self, query_id: &str, outcome: ExecutionOutcome) -> bool {
        let mut entries = self.entries.lock();
        let tx = match entries.get_mut(query_id) {
            Some(entry) if entry.state == PendingState::Waiting => match entry.tx.take() {
                Some(tx) => {
                    entry.state = PendingState::Completed;
                    Some(tx)
                }
                None => None,
            },
            _ => {
                debug!(query_id, "discarding result for unknown or finished entry");
                None
            }
        };

        let Some(tx) = tx else { return false };
        if tx.send(outcome).is_err() {
            // The waiter vanished between taking its receiver and this send;
            // nothing left to keep.
            entries.remove(query_id);
            return false;
        }
        true
    }

    /// Block until the entry completes or `registered_at + timeout` passes.
    ///
    /// A zero timeout returns `Timeout` unless the result was already
    /// delivered. Timing out never cancels the underlying query.
    pub async fn wait(&self, query_id: &str, timeout: Duration) -> Result<QueryResult> {
        let (rx, deadline) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(query_id)
                .ok_or_else(|| DispatchError::UnknownQuery(query_id.to_string()))?;
            let rx = entry.rx.take().ok_or_else(|| {
                DispatchError::InvalidState(format!("result for {query_id} already awaited"))
            })?;
            (rx, entry.registered_at + timeout)
        };

        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await {
            Ok(Ok(outcome)) => {
                self.entries.lock().remove(query_id);
                outcome
            }
            // Sender dropped without delivering: the sweep reaped the entry.
            Ok(Err(_)) => {
                self.entries.lock().remove(query_id);
                Err(DispatchError::Timeout(format!(
                    "query {query_id} was reaped before completion"
                )))
            }
            Err(_) => {
                let mut entries = self.entries.lock();
                if let Some(entry) = entries.get_mut(query_id) {
                    if entry.state == PendingState::Waiting {
                        entry.state = PendingState::TimedOut;
                        entry.tx = None;
                    }
                }
                entries.remove(query_id);
                Err(DispatchError::Timeout(format!(
                    "no result for query {query_id} within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Drop an entry that will never be executed (e.g. enqueue failed).
    pub fn discard(&self, query_id: &str) {
        self.entries.lock().remove(query_id);
    }

    /// Sweep entries whose deadline has passed. Idempotent.
    ///
    /// Returns how many entries were still waiting when reaped, so the caller
    /// can account them as timeouts.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut timed_out = 0;
        let mut entries = self.entries.lock();
        entries.retain(|query_id, entry| {
            if now < entry.registered_at + entry.timeout {
                return true;
            }
            if entry.state == PendingState::Waiting {
                entry.state = PendingState::TimedOut;
                entry.tx = None;
                timed_out += 1;
                debug!(query_id, "pending result expired");
            }
            false
        });
        timed_out
    }

    /// Current state of an entry, if it still exists.
    pub fn state_of(&self, query_id: &str) -> Option<PendingState> {
        self.entries.lock().get(query_id).map(|e| e.state)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for PendingResultRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn sample_result(value: i64) -> QueryResult {
        QueryResult {
            columns: vec!["value".to_string()],
            rows: vec![serde_json::json!({ "value": value })],
            affected_rows: 0,
            execution_time_ms: 1,
        }
    }

    #[tokio::test]
    async fn register_then_signal_delivers_exactly_once() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_secs(5)).unwrap();

        assert!(registry.signal_ready("q1", Ok(sample_result(7))));

        let result = registry.wait("q1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.rows[0]["value"], 7);

        // Consumed: a second signal for the same id is a no-op.
        assert!(!registry.signal_ready("q1", Ok(sample_result(8))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_secs(5)).unwrap();
        assert_eq!(
            registry.register("q1", Duration::from_secs(5)),
            Err(DispatchError::DuplicateId("q1".to_string()))
        );
    }

    #[tokio::test]
    async fn zero_timeout_returns_timeout_without_result() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_secs(5)).unwrap();

        let outcome = registry.wait("q1", Duration::ZERO).await;
        assert!(matches!(outcome, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn zero_timeout_still_sees_already_delivered_result() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_secs(5)).unwrap();
        registry.signal_ready("q1", Ok(sample_result(1)));

        let result = registry.wait("q1", Duration::ZERO).await.unwrap();
        assert_eq!(result.rows[0]["value"], 1);
    }

    #[tokio::test]
    async fn wait_for_unknown_query_fails() {
        let registry = PendingResultRegistry::new();
        let outcome = registry.wait("ghost", Duration::from_secs(1)).await;
        assert!(matches!(outcome, Err(DispatchError::UnknownQuery(_))));
    }

    #[tokio::test]
    async fn signal_after_timeout_is_discarded() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_millis(10)).unwrap();

        let outcome = registry.wait("q1", Duration::from_millis(10)).await;
        assert!(matches!(outcome, Err(DispatchError::Timeout(_))));

        assert!(!registry.signal_ready("q1", Ok(sample_result(1))));
    }

    #[tokio::test]
    async fn cleanup_reaps_only_expired_entries() {
        let registry = PendingResultRegistry::new();
        registry.register("fresh", Duration::from_secs(60)).unwrap();
        registry.register("stale", Duration::ZERO).unwrap();

        let reaped = registry.cleanup_expired();
        assert_eq!(reaped, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state_of("fresh"), Some(PendingState::Waiting));
        assert_eq!(registry.state_of("stale"), None);

        // Idempotent.
        assert_eq!(registry.cleanup_expired(), 0);
    }

    #[tokio::test]
    async fn cleanup_racing_signal_resolves_to_exactly_one_winner() {
        // Both sides target the same expired entry from different tasks. The
        // registry lock decides the winner; the loser must be a no-op.
        for _ in 0..50 {
            let registry = Arc::new(PendingResultRegistry::new());
            registry.register("q", Duration::ZERO).unwrap();

            let sweeper = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.cleanup_expired() })
            };
            let signaler = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.signal_ready("q", Ok(sample_result(1))) })
            };

            let reaped = sweeper.await.unwrap();
            let delivered = signaler.await.unwrap();

            // Exactly one of the two observed the Waiting entry.
            assert!(
                (reaped == 1) ^ delivered,
                "reaped={reaped} delivered={delivered}"
            );
        }
    }

    #[tokio::test]
    async fn waiter_blocked_while_sweep_reaps_sees_timeout() {
        let registry = Arc::new(PendingResultRegistry::new());
        registry.register("q", Duration::from_millis(20)).unwrap();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait("q", Duration::from_secs(30)).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        registry.cleanup_expired();

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(DispatchError::Timeout(_))));
    }

    #[tokio::test]
    async fn failure_outcomes_are_delivered_not_swallowed() {
        let registry = PendingResultRegistry::new();
        registry.register("q1", Duration::from_secs(5)).unwrap();
        registry.signal_ready(
            "q1",
            Err(DispatchError::Execution("syntax error near FROM".to_string())),
        );

        let outcome = registry.wait("q1", Duration::from_secs(5)).await;
        assert_eq!(
            outcome,
            Err(DispatchError::Execution("syntax error near FROM".to_string()))
        );
    }
}

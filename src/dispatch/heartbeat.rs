//! # Connection Health Monitor
//!
//! Keeps each queue's persistent connection valid with minimal overhead. The
//! fixed heartbeat interval is the only throttle; `consecutive_failures` is
//! exposed for observability but never changes scheduling here.

use std::time::Instant;

use tracing::{debug, info, warn};

use super::queue::DispatchQueue;

impl DispatchQueue {
    /// Whether the heartbeat interval has elapsed since the last tick.
    pub(crate) fn heartbeat_due(&self) -> bool {
        self.last_heartbeat.lock().elapsed() >= self.context().settings.heartbeat_interval
    }

    /// One heartbeat tick: reconnect when no connection exists, probe
    /// liveness when one does.
    ///
    /// The timestamp is stamped at tick start, so failures are throttled to
    /// the heartbeat interval exactly like successes.
    pub(crate) async fn run_heartbeat(&self) {
        *self.last_heartbeat.lock() = Instant::now();
        let was_connected = self.is_connected();

        let mut guard = self.connection_slot().lock().await;

        // Probe first; the borrow of the slot must end before the slot can
        // be emptied or refilled below.
        let probe = if let Some(conn) = guard.as_mut() {
            Some(conn.ping().await)
        } else {
            None
        };

        let now_connected = match probe {
            Some(Ok(())) => {
                self.reset_failures();
                true
            }
            Some(Err(err)) => {
                let failures = self.record_failure_tick();
                warn!(
                    queue = %self.label(),
                    consecutive_failures = failures,
                    error = %err,
                    "liveness probe failed, releasing stale connection"
                );
                *guard = None;
                false
            }
            None => {
                *self.last_connection_attempt.lock() = Some(Instant::now());
                match self.context().engine.connect(self.connection_params()).await {
                    Ok(conn) => {
                        *guard = Some(conn);
                        self.reset_failures();
                        true
                    }
                    Err(err) => {
                        let failures = self.record_failure_tick();
                        debug!(
                            queue = %self.label(),
                            consecutive_failures = failures,
                            error = %err,
                            "reconnect attempt failed"
                        );
                        false
                    }
                }
            }
        };
        drop(guard);

        self.mark_connected(now_connected);

        if was_connected != now_connected {
            if now_connected {
                info!(queue = %self.label(), "database connection established");
            } else {
                warn!(queue = %self.label(), "database connection lost, will retry on next heartbeat");
            }
        }

        debug!(
            queue = %self.label(),
            connected = now_connected,
            depth = self.depth(),
            "heartbeat"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::config::DatabaseConfig;
    use crate::dispatch::queue::DispatchQueue;
    use crate::test_support::{test_queue_context, MockEngine, StaticMigrationSource};

    fn lead_queue(engine: &MockEngine) -> Arc<DispatchQueue> {
        let ctx = test_queue_context(engine);
        let config = DatabaseConfig::new("orders", "mock", "mock://orders");
        DispatchQueue::new_lead(&config, ctx, Arc::new(StaticMigrationSource::empty()))
    }

    #[tokio::test]
    async fn first_tick_establishes_connection() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine);

        assert!(!queue.is_connected());
        queue.run_heartbeat().await;
        assert!(queue.is_connected());
        assert_eq!(queue.consecutive_failures(), 0);
        assert_eq!(engine.connect_count(), 1);
    }

    #[tokio::test]
    async fn three_failures_then_recovery_resets_counter() {
        let engine = MockEngine::new();
        engine.fail_next_connects(3);
        let queue = lead_queue(&engine);

        for expected in 1..=3u32 {
            queue.run_heartbeat().await;
            assert!(!queue.is_connected());
            assert_eq!(queue.consecutive_failures(), expected);
        }

        // Engine healed: one successful tick resets everything.
        queue.run_heartbeat().await;
        assert!(queue.is_connected());
        assert_eq!(queue.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn failed_probe_releases_stale_handle() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine);

        queue.run_heartbeat().await;
        assert!(queue.is_connected());

        engine.fail_next_pings(1);
        queue.run_heartbeat().await;
        assert!(!queue.is_connected());
        assert_eq!(queue.consecutive_failures(), 1);

        // The stale handle was dropped, so the next tick reconnects.
        queue.run_heartbeat().await;
        assert!(queue.is_connected());
        assert_eq!(queue.consecutive_failures(), 0);
        assert_eq!(engine.connect_count(), 2);
    }

    #[tokio::test]
    async fn successful_probe_keeps_existing_connection() {
        let engine = MockEngine::new();
        let queue = lead_queue(&engine);

        queue.run_heartbeat().await;
        queue.run_heartbeat().await;
        queue.run_heartbeat().await;

        // Probes reuse the handle; only the first tick connected.
        assert_eq!(engine.connect_count(), 1);
        assert_eq!(engine.ping_count(), 2);
    }
}

//! # Cache-Class Result Cache
//!
//! Bounded, TTL-evicting cache of query results keyed by the stable cache
//! key, owned by each Cache-class queue. Repeated identical submissions are
//! served without touching the persistent connection.

use std::time::Duration;

use moka::sync::Cache;

use crate::engine::QueryResult;

pub struct QueryResultCache {
    inner: Cache<String, QueryResult>,
}

impl QueryResultCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn get(&self, key: &str) -> Option<QueryResult> {
        self.inner.get(key)
    }

    pub fn insert(&self, key: String, result: QueryResult) {
        self.inner.insert(key, result);
    }

    pub fn entry_count(&self) -> u64 {
        // Pending internal maintenance can make the raw count lag; sync first.
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

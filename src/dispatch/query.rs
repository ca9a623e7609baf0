//! # Dispatch Query Model
//!
//! One submitted unit of work plus the workload classification used to route
//! it. A [`DispatchQuery`] is owned by exactly one queue from enqueue until a
//! worker delivers its outcome; it moves, it is never shared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::DispatchError;

/// Caller-supplied workload classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadClass {
    Slow,
    Medium,
    Fast,
    Cache,
}

impl WorkloadClass {
    pub const fn all() -> [WorkloadClass; 4] {
        [
            WorkloadClass::Slow,
            WorkloadClass::Medium,
            WorkloadClass::Fast,
            WorkloadClass::Cache,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadClass::Slow => "slow",
            WorkloadClass::Medium => "medium",
            WorkloadClass::Fast => "fast",
            WorkloadClass::Cache => "cache",
        }
    }

    /// Map an optional caller hint onto a class. Absent or unrecognized
    /// hints default to `Medium`.
    pub fn from_hint(hint: Option<&str>) -> Self {
        match hint.map(str::to_ascii_lowercase).as_deref() {
            Some("slow") => WorkloadClass::Slow,
            Some("medium") => WorkloadClass::Medium,
            Some("fast") => WorkloadClass::Fast,
            Some("cache") => WorkloadClass::Cache,
            _ => WorkloadClass::Medium,
        }
    }
}

impl std::fmt::Display for WorkloadClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a queue within one database's hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Always-present queue owned directly by the database registration.
    Lead,
    /// Dynamically spawned, typed queue sharing the Lead's database.
    Worker(WorkloadClass),
}

impl QueueKind {
    pub fn label(&self) -> &'static str {
        match self {
            QueueKind::Lead => "lead",
            QueueKind::Worker(class) => class.as_str(),
        }
    }

    pub fn is_lead(&self) -> bool {
        matches!(self, QueueKind::Lead)
    }
}

/// What a caller hands to the submission API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Caller-chosen id; generated when absent.
    pub query_id: Option<String>,
    pub sql_template: String,
    /// Engine-neutral parameters, opaque to the dispatch layer.
    pub parameters: Value,
}

impl SubmitRequest {
    pub fn new(sql_template: impl Into<String>) -> Self {
        Self {
            query_id: None,
            sql_template: sql_template.into(),
            parameters: Value::Null,
        }
    }

    pub fn with_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }
}

/// One submitted unit of work.
#[derive(Debug, Clone)]
pub struct DispatchQuery {
    pub query_id: String,
    pub sql_template: String,
    pub parameters: Value,
    pub workload: WorkloadClass,
    /// Stable key for Cache-class queries; `None` for every other class.
    pub cache_key: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl DispatchQuery {
    pub fn new(request: SubmitRequest, workload: WorkloadClass) -> Self {
        let query_id = request
            .query_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let cache_key = (workload == WorkloadClass::Cache)
            .then(|| cache_key(&request.sql_template, &request.parameters));
        Self {
            query_id,
            sql_template: request.sql_template,
            parameters: request.parameters,
            workload,
            cache_key,
            submitted_at: Utc::now(),
            retry_count: 0,
            last_error: None,
        }
    }

    /// Record a terminal failure on the query before it is surfaced. Retry
    /// policy belongs to the caller; the dispatcher never re-executes.
    pub fn record_failure(&mut self, error: &DispatchError) {
        self.retry_count += 1;
        self.last_error = Some(error.to_string());
    }
}

/// Stable hash of the normalized query plus canonical parameters.
///
/// SHA-256 over the whitespace-collapsed SQL template and the serialized
/// parameter value, so identical Cache-class submissions map to one key.
pub fn cache_key(sql_template: &str, parameters: &Value) -> String {
    let normalized = sql_template.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0x1f]);
    hasher.update(parameters.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hint_mapping_defaults_to_medium() {
        assert_eq!(WorkloadClass::from_hint(Some("slow")), WorkloadClass::Slow);
        assert_eq!(WorkloadClass::from_hint(Some("FAST")), WorkloadClass::Fast);
        assert_eq!(WorkloadClass::from_hint(Some("cache")), WorkloadClass::Cache);
        assert_eq!(
            WorkloadClass::from_hint(Some("interactive")),
            WorkloadClass::Medium
        );
        assert_eq!(WorkloadClass::from_hint(None), WorkloadClass::Medium);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = DispatchQuery::new(SubmitRequest::new("SELECT 1"), WorkloadClass::Medium);
        let b = DispatchQuery::new(SubmitRequest::new("SELECT 1"), WorkloadClass::Medium);
        assert_ne!(a.query_id, b.query_id);
    }

    #[test]
    fn caller_supplied_id_is_kept() {
        let query = DispatchQuery::new(
            SubmitRequest::new("SELECT 1").with_id("my-query"),
            WorkloadClass::Fast,
        );
        assert_eq!(query.query_id, "my-query");
        assert!(query.cache_key.is_none());
    }

    #[test]
    fn cache_class_gets_a_key() {
        let query = DispatchQuery::new(
            SubmitRequest::new("SELECT * FROM users").with_parameters(json!({"limit": 10})),
            WorkloadClass::Cache,
        );
        assert!(query.cache_key.is_some());
    }

    #[test]
    fn cache_key_is_whitespace_insensitive() {
        let params = json!({"limit": 10});
        let a = cache_key("SELECT *\n  FROM users", &params);
        let b = cache_key("SELECT * FROM users", &params);
        assert_eq!(a, b);
    }

    #[test]
    fn cache_key_distinguishes_parameters() {
        let a = cache_key("SELECT * FROM users", &json!({"limit": 10}));
        let b = cache_key("SELECT * FROM users", &json!({"limit": 20}));
        assert_ne!(a, b);
    }

    #[test]
    fn record_failure_tracks_retry_and_error() {
        let mut query = DispatchQuery::new(SubmitRequest::new("SELECT 1"), WorkloadClass::Medium);
        query.record_failure(&DispatchError::Execution("boom".to_string()));
        assert_eq!(query.retry_count, 1);
        assert!(query.last_error.as_deref().unwrap().contains("boom"));
    }
}

//! # Engine Boundary Contracts
//!
//! The dispatch core never speaks a backend's wire protocol itself. It
//! consumes two capabilities: acquiring a connection for a database
//! ([`QueryEngine`]) and executing work on that connection
//! ([`EngineConnection`]). Implementations live behind these traits; the core
//! only requires that a stale connection produce a connectivity failure
//! rather than a crash.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::DispatchError;

#[cfg(feature = "postgres")]
pub mod postgres;

/// Typed failure reported by an engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Connection absent, broken, or gone stale since the last health check.
    #[error("connectivity: {0}")]
    Connectivity(String),
    #[error("syntax: {0}")]
    Syntax(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("statement timeout: {0}")]
    Timeout(String),
    /// Engine-reported failure that fits no narrower category.
    #[error("execution failed: {0}")]
    Execution(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for DispatchError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Connectivity(msg) => DispatchError::Connectivity(msg),
            other => DispatchError::Execution(other.to_string()),
        }
    }
}

/// Per-database connection parameters handed to an engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub database: String,
    pub url: String,
}

/// One query as seen by an engine: engine-neutral SQL template plus opaque
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query_id: String,
    pub sql: String,
    pub parameters: Value,
}

/// Successful execution outcome: rows for reads, affected count for writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    /// One JSON object per row.
    pub rows: Vec<Value>,
    pub affected_rows: u64,
    pub execution_time_ms: u64,
}

impl QueryResult {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Connection acquisition capability for one backend kind.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    /// Engine identifier used as the registry key, e.g. `"postgres"`.
    fn name(&self) -> &str;

    /// Open a new connection. Used by the health monitor and by query
    /// execution's lazy reconnect.
    async fn connect(&self, params: &ConnectionParams) -> EngineResult<Box<dyn EngineConnection>>;
}

/// A live connection owned by exactly one queue.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// Execute one query. Must return [`EngineError::Connectivity`] rather
    /// than panicking if the connection went stale since the last probe.
    async fn execute(&mut self, request: &QueryRequest) -> EngineResult<QueryResult>;

    /// Lightweight liveness probe.
    async fn ping(&mut self) -> EngineResult<()>;

    /// Execute statements as a single transaction. Used only by migration
    /// apply; partial failure must roll the whole batch back.
    async fn execute_batch(&mut self, statements: &[String]) -> EngineResult<()>;
}

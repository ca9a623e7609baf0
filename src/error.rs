use thiserror::Error;

/// Crate-wide error taxonomy.
///
/// A failing query affects only its own pending result and queue statistics;
/// none of these variants is ever allowed to take the process down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    /// Connection absent or broken. Recovered by the health monitor on its
    /// next tick, never retried by the dispatcher itself.
    #[error("connectivity error: {0}")]
    Connectivity(String),

    /// Engine-reported failure for a specific query. Terminal for that query
    /// and always surfaced to the original caller.
    #[error("execution error: {0}")]
    Execution(String),

    /// The caller gave up waiting. The underlying query keeps running and its
    /// eventual result is discarded.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    /// Migration load or apply failure. Version markers are left unchanged so
    /// the next evaluation cycle retries the same action.
    #[error("migration error: {0}")]
    Migration(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("unknown query id: {0}")]
    UnknownQuery(String),

    #[error("duplicate query id: {0}")]
    DuplicateId(String),

    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

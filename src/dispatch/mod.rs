//! # Query Dispatch Subsystem
//!
//! The hierarchy of per-database dispatch queues: a Lead queue per database,
//! typed Worker queues spawned under it, routing by workload hint, and the
//! manager that ties the registry, statistics, and lifecycle together.

pub mod cache;
mod heartbeat;
pub mod manager;
pub mod query;
pub mod queue;
pub mod router;
pub mod stats;
mod topology;

pub use manager::{DatabaseStatus, DispatchStatus, QueueManager};
pub use query::{DispatchQuery, QueueKind, SubmitRequest, WorkloadClass};
pub use queue::{DispatchQueue, QueueContext, QueueStatus};
pub use stats::{ClassStats, DispatchStats, StatsSnapshot};

#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Dispatch Core
//!
//! Query dispatch and lifecycle core for a server that accepts database
//! queries over a network API and executes them against pluggable relational
//! backends.
//!
//! ## Overview
//!
//! Each registered database owns a hierarchy of dispatch queues: one Lead
//! queue, always present, plus zero or more typed Worker queues
//! (slow/medium/fast/cache) spawned under it. Every queue runs a dedicated
//! worker task that drains a FIFO of submitted queries, maintains exactly one
//! persistent backend connection with heartbeat health checks, and delivers
//! outcomes to a process-wide pending-result registry that blocking callers
//! wait on with a deadline. Lead queues additionally manage worker topology
//! and orchestrate schema migrations on the same connection discipline as
//! ordinary queries.
//!
//! The wire protocol, authentication, and the per-engine execution of queries
//! are out of scope; backends plug in behind the [`engine`] traits and
//! migration scripting behind [`migration::MigrationSource`].
//!
//! ## Module Organization
//!
//! - [`config`] - Configuration management
//! - [`dispatch`] - Queues, worker loops, routing, topology, statistics
//! - [`engine`] - Boundary contracts and the reference PostgreSQL engine
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging initialization
//! - [`migration`] - Migration state machine, discovery, and orchestration
//! - [`pending`] - Pending-result registry bridging workers and callers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dispatch_core::config::{DatabaseConfig, DispatchConfig};
//! use dispatch_core::dispatch::{QueueManager, SubmitRequest};
//! use dispatch_core::engine::postgres::PostgresEngine;
//! use dispatch_core::migration::FileMigrationSource;
//!
//! # async fn example() -> dispatch_core::Result<()> {
//! let config = DispatchConfig::from_env()?;
//! let source = Arc::new(FileMigrationSource::new("migrations"));
//! let manager = QueueManager::new(config, source)?;
//!
//! manager.register_engine(Arc::new(PostgresEngine::new()));
//! manager
//!     .register_database(DatabaseConfig::new(
//!         "orders",
//!         "postgres",
//!         "postgres://localhost/orders",
//!     ))
//!     .await?;
//!
//! let query_id = manager
//!     .submit("orders", Some("fast"), SubmitRequest::new("SELECT 1"))
//!     .await?;
//! let result = manager.await_result(&query_id, 30).await?;
//! println!("{} rows", result.row_count());
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod migration;
pub mod pending;
pub mod test_support;

pub use config::{DatabaseConfig, DispatchConfig, WorkerClassConfig, WorkerTopology};
pub use dispatch::{
    DispatchQuery, DispatchStatus, QueueKind, QueueManager, SubmitRequest, WorkloadClass,
};
pub use engine::{
    ConnectionParams, EngineConnection, EngineError, QueryEngine, QueryRequest, QueryResult,
};
pub use error::{DispatchError, Result};
pub use migration::{
    determine_action, FileMigrationSource, MigrationAction, MigrationMarkers, MigrationSource,
};
pub use pending::{PendingResultRegistry, PendingState};

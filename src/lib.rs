//! # GridMesh
//!
//! Core middleware for a distributed grid: configuration replication and
//! request task execution.
//!
//! ## Architecture
//!
//! Two independent subsystems share one crate because they share the same
//! deployment unit (a grid service host) and the same ambient stack:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              gridmesh                                │
//! │                                                                      │
//! │  ┌──────────────────┐     ┌────────────┐     ┌───────────────────┐   │
//! │  │ ConfigReplicator │────►│ BackupStore│     │ sweep loop        │   │
//! │  │ (master/slave)   │     │ (zip files)│     │ (slave liveness)  │   │
//! │  └──────────────────┘     └────────────┘     └───────────────────┘   │
//! │                                                                      │
//! │  ┌──────────────────┐     ┌────────────┐     ┌───────────────────┐   │
//! │  │ RequestTaskEngine│────►│ handlers   │────►│ ReplicaManager    │   │
//! │  │ (dispatch loop)  │     │ (closed)   │     │ (external seam)   │   │
//! │  └──────────────────┘     └────────────┘     └───────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration replication
//!
//! A master [`replicator::ConfigReplicator`] owns the authoritative
//! configuration tree, versions every change, keeps a durable zipped
//! history, and tracks slave replicas through heartbeats with a
//! grace-timed sweep. Slaves pull through a [`replicator::Refresher`]
//! collaborator and reject all mutations.
//!
//! ## Request task execution
//!
//! A [`engine::RequestTaskEngine`] executes one serialized request at a
//! time: it walks the sub-requests in order, dispatches each to a
//! registered [`engine::OperationHandler`] under an impersonated
//! identity, tracks per-file success and failure, and reports whether
//! the request may be finalized.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use gridmesh::{ConfigReplicator, ReplicatorConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicatorConfig::for_testing("Production", "/var/lib/gridmesh/csbackup");
//!     let replicator = Arc::new(ConfigReplicator::new(config).expect("backup dir"));
//!     replicator.initialize().await.expect("Failed to start");
//!
//!     // Replicator runs until shutdown signal
//!     replicator.shutdown().await;
//! }
//! ```

pub mod backup;
pub mod config;
pub mod diff;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod replicator;
pub mod request;
pub mod snapshot;

/// Boxed future used at every collaborator seam.
pub type BoxFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = error::Result<T>> + Send + 'a>>;

// Re-exports for convenience
pub use backup::{BackupStore, HistoryEntry};
pub use config::{EngineConfig, ReplicatorConfig, Role};
pub use engine::{
    CredentialProvider, CredentialScope, EngineBuilder, MemoryRequestStore, OperationContext,
    OperationHandler, RequestStore, RequestTaskEngine, TaskOutcome,
};
pub use error::{GridError, Result};
pub use handlers::{NoOpReplicaManager, ReplicaManager, ReplicaManagerRef};
pub use replicator::{ConfigReplicator, NoOpRefresher, PingInfo, Refresher, ServicePing, StaticPing};
pub use request::{FileRecord, Request, Status, SubRequest};
pub use snapshot::{ConfigSnapshot, ConfigTree, TreeNode};

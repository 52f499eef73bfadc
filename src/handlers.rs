//! Built-in operation handlers: register, replicate, remove.
//!
//! Each handler walks the sub-request's Waiting files and drives one
//! replica-management operation per file per target endpoint through the
//! [`ReplicaManager`] seam. A failure on one endpoint for one file never
//! blocks other files or other endpoints; per-file reasons accumulate on
//! the file record and the handler returns an aggregate error naming the
//! failed logical names. Files already Done are left untouched, so a
//! retried sub-request only redoes the failed work.

use crate::engine::{OperationContext, OperationHandler};
use crate::error::GridError;
use crate::metrics;
use crate::request::{FileRecord, Status, SubRequest};
use crate::BoxFuture;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Replica-management seam the handlers drive.
///
/// The daemon implements this over its data-management clients; the
/// no-op implementation stands in for deployments without one.
pub trait ReplicaManager: Send + Sync + 'static {
    /// Register a file's physical replica at `endpoint` in `catalog`.
    fn register_file<'a>(
        &'a self,
        file: &'a FileRecord,
        endpoint: &'a str,
        catalog: &'a str,
    ) -> BoxFuture<'a, ()>;

    /// Replicate an already-registered file to `endpoint` and register
    /// the new copy.
    fn replicate_file<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()>;

    /// Remove the replica of `lfn` held at `endpoint`.
    fn remove_replica<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()>;
}

/// Shared handle to a replica manager.
pub type ReplicaManagerRef = Arc<dyn ReplicaManager>;

/// Replica manager that accepts everything without side effects.
#[derive(Debug, Default)]
pub struct NoOpReplicaManager;

impl ReplicaManager for NoOpReplicaManager {
    fn register_file<'a>(
        &'a self,
        file: &'a FileRecord,
        endpoint: &'a str,
        catalog: &'a str,
    ) -> BoxFuture<'a, ()> {
        debug!(lfn = %file.lfn, endpoint, catalog, "NoOpReplicaManager: register_file");
        Box::pin(async { Ok(()) })
    }

    fn replicate_file<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()> {
        debug!(lfn, endpoint, "NoOpReplicaManager: replicate_file");
        Box::pin(async { Ok(()) })
    }

    fn remove_replica<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()> {
        debug!(lfn, endpoint, "NoOpReplicaManager: remove_replica");
        Box::pin(async { Ok(()) })
    }
}

/// Register the engine's built-in handlers on a builder.
pub fn register_builtin_handlers(
    builder: crate::engine::EngineBuilder,
    replicas: ReplicaManagerRef,
) -> crate::engine::EngineBuilder {
    builder
        .handler("register", Box::new(RegisterFileHandler::new(replicas.clone())))
        .handler("replicate", Box::new(ReplicateFileHandler::new(replicas.clone())))
        .handler("remove", Box::new(RemoveReplicaHandler::new(replicas)))
}

/// Summarize failed logical names into the aggregate handler error.
fn aggregate_failure(operation: &str, index: usize, failed: &[String]) -> GridError {
    GridError::Handler {
        index,
        message: format!("failed to {} files: {}", operation, failed.join(", ")),
    }
}

/// Registers file records in the catalog at every target endpoint.
pub struct RegisterFileHandler {
    replicas: ReplicaManagerRef,
}

impl RegisterFileHandler {
    pub fn new(replicas: ReplicaManagerRef) -> Self {
        Self { replicas }
    }
}

impl OperationHandler for RegisterFileHandler {
    fn handle<'a>(
        &'a self,
        index: usize,
        sub: &'a mut SubRequest,
        ctx: &'a OperationContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let targets = sub.resolved_targets(&ctx.default_target_endpoint);
            let catalog = sub.catalog.clone();
            let mut failed: Vec<String> = Vec::new();

            for file in &mut sub.files {
                if file.status != Status::Waiting {
                    continue;
                }
                metrics::record_operation_attempted("register", 1);
                let mut reasons: Vec<String> = Vec::new();
                for endpoint in &targets {
                    info!(lfn = %file.lfn, endpoint = %endpoint, "Registering file");
                    if let Err(e) = self.replicas.register_file(file, endpoint, &catalog).await
                    {
                        warn!(lfn = %file.lfn, endpoint = %endpoint, error = %e, "Registration failed");
                        reasons.push(format!("{endpoint}: {e}"));
                    }
                }
                if reasons.is_empty() {
                    file.status = Status::Done;
                    metrics::record_operation_ok("register", 1);
                } else {
                    file.error = Some(reasons.join("; "));
                    failed.push(file.lfn.clone());
                    metrics::record_operation_failed("register", 1);
                }
            }

            if failed.is_empty() {
                sub.status = Status::Done;
                Ok(())
            } else {
                Err(aggregate_failure("register", index, &failed))
            }
        })
    }
}

/// Replicates each file to every target endpoint and registers the copies.
pub struct ReplicateFileHandler {
    replicas: ReplicaManagerRef,
}

impl ReplicateFileHandler {
    pub fn new(replicas: ReplicaManagerRef) -> Self {
        Self { replicas }
    }
}

impl OperationHandler for ReplicateFileHandler {
    fn handle<'a>(
        &'a self,
        index: usize,
        sub: &'a mut SubRequest,
        ctx: &'a OperationContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let targets = sub.resolved_targets(&ctx.default_target_endpoint);
            let mut failed: Vec<String> = Vec::new();

            for file in &mut sub.files {
                if file.status != Status::Waiting {
                    continue;
                }
                metrics::record_operation_attempted("replicate", 1);
                let mut reasons: Vec<String> = Vec::new();
                for endpoint in &targets {
                    info!(lfn = %file.lfn, endpoint = %endpoint, "Replicating file");
                    if let Err(e) = self.replicas.replicate_file(&file.lfn, endpoint).await {
                        warn!(lfn = %file.lfn, endpoint = %endpoint, error = %e, "Replication failed");
                        reasons.push(format!("{endpoint}: {e}"));
                    }
                }
                if reasons.is_empty() {
                    file.status = Status::Done;
                    metrics::record_operation_ok("replicate", 1);
                } else {
                    file.error = Some(reasons.join("; "));
                    failed.push(file.lfn.clone());
                    metrics::record_operation_failed("replicate", 1);
                }
            }

            if failed.is_empty() {
                sub.status = Status::Done;
                Ok(())
            } else {
                Err(aggregate_failure("replicate", index, &failed))
            }
        })
    }
}

/// Removes each file's replica from every target endpoint.
pub struct RemoveReplicaHandler {
    replicas: ReplicaManagerRef,
}

impl RemoveReplicaHandler {
    pub fn new(replicas: ReplicaManagerRef) -> Self {
        Self { replicas }
    }
}

impl OperationHandler for RemoveReplicaHandler {
    fn handle<'a>(
        &'a self,
        index: usize,
        sub: &'a mut SubRequest,
        ctx: &'a OperationContext,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let targets = sub.resolved_targets(&ctx.default_target_endpoint);
            let mut failed: Vec<String> = Vec::new();

            for file in &mut sub.files {
                if file.status != Status::Waiting {
                    continue;
                }
                metrics::record_operation_attempted("remove", 1);
                let mut reasons: Vec<String> = Vec::new();
                for endpoint in &targets {
                    info!(lfn = %file.lfn, endpoint = %endpoint, "Removing replica");
                    if let Err(e) = self.replicas.remove_replica(&file.lfn, endpoint).await {
                        warn!(lfn = %file.lfn, endpoint = %endpoint, error = %e, "Removal failed");
                        reasons.push(format!("{endpoint}: {e}"));
                    }
                }
                if reasons.is_empty() {
                    file.status = Status::Done;
                    metrics::record_operation_ok("remove", 1);
                } else {
                    file.error = Some(reasons.join("; "));
                    failed.push(file.lfn.clone());
                    metrics::record_operation_failed("remove", 1);
                }
            }

            if failed.is_empty() {
                sub.status = Status::Done;
                Ok(())
            } else {
                Err(aggregate_failure("remove", index, &failed))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Replica manager that fails for configured logical names and logs
    /// every call it receives.
    #[derive(Default)]
    struct MockReplicaManager {
        fail_lfns: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl MockReplicaManager {
        fn failing(lfns: &[&str]) -> Self {
            Self {
                fail_lfns: lfns.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        fn record_and_check(&self, call: String, lfn: &str) -> Result<()> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
            if self.fail_lfns.contains(lfn) {
                Err(GridError::Handler {
                    index: 0,
                    message: format!("storage refused {lfn}"),
                })
            } else {
                Ok(())
            }
        }
    }

    impl ReplicaManager for MockReplicaManager {
        fn register_file<'a>(
            &'a self,
            file: &'a FileRecord,
            endpoint: &'a str,
            _catalog: &'a str,
        ) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.record_and_check(format!("register {} {}", file.lfn, endpoint), &file.lfn)
            })
        }

        fn replicate_file<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(
                async move { self.record_and_check(format!("replicate {lfn} {endpoint}"), lfn) },
            )
        }

        fn remove_replica<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async move { self.record_and_check(format!("remove {lfn} {endpoint}"), lfn) })
        }
    }

    fn ctx() -> OperationContext {
        OperationContext {
            request_id: 7,
            request_name: "req-007".into(),
            job_id: Some(99),
            owner_dn: "/DC=org/CN=alice".into(),
            owner_group: "prod".into(),
            default_target_endpoint: "failover".into(),
        }
    }

    fn sub_with_files(operation: &str, lfns: &[&str], targets: &[&str]) -> SubRequest {
        let mut sub = SubRequest::new(operation);
        sub.target_endpoints = targets.iter().map(|s| s.to_string()).collect();
        for lfn in lfns {
            sub.files.push(FileRecord::new(*lfn));
        }
        sub
    }

    #[tokio::test]
    async fn test_register_all_success_marks_sub_done() {
        let replicas = Arc::new(MockReplicaManager::default());
        let handler = RegisterFileHandler::new(replicas.clone());
        let mut sub = sub_with_files("register", &["/g/a", "/g/b"], &["CERN-disk"]);

        handler.handle(0, &mut sub, &ctx()).await.unwrap();
        assert_eq!(sub.status, Status::Done);
        assert!(sub.files.iter().all(|f| f.status == Status::Done));
        assert_eq!(replicas.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_names_failed_lfns() {
        let replicas = Arc::new(MockReplicaManager::failing(&["/g/b"]));
        let handler = ReplicateFileHandler::new(replicas.clone());
        let mut sub = sub_with_files("replicate", &["/g/a", "/g/b", "/g/c"], &["CERN-disk"]);

        let err = handler.handle(1, &mut sub, &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("/g/b"), "{err}");
        assert!(!err.to_string().contains("/g/a"));

        assert_ne!(sub.status, Status::Done);
        assert_eq!(sub.files[0].status, Status::Done);
        assert_eq!(sub.files[1].status, Status::Waiting);
        assert!(sub.files[1].error.as_deref().unwrap().contains("storage refused"));
        assert_eq!(sub.files[2].status, Status::Done);
    }

    #[tokio::test]
    async fn test_failure_on_one_endpoint_still_tries_the_other() {
        let replicas = Arc::new(MockReplicaManager::failing(&["/g/a"]));
        let handler = RemoveReplicaHandler::new(replicas.clone());
        let mut sub = sub_with_files("remove", &["/g/a"], &["CERN-disk", "PIC-tape"]);

        handler.handle(0, &mut sub, &ctx()).await.unwrap_err();
        // Both endpoints were attempted despite the first failing.
        assert_eq!(
            replicas.calls(),
            vec!["remove /g/a CERN-disk", "remove /g/a PIC-tape"]
        );
        assert!(sub.files[0].error.as_deref().unwrap().contains("CERN-disk"));
    }

    #[tokio::test]
    async fn test_done_files_are_not_reprocessed() {
        let replicas = Arc::new(MockReplicaManager::default());
        let handler = RegisterFileHandler::new(replicas.clone());
        let mut sub = sub_with_files("register", &["/g/a", "/g/b"], &["CERN-disk"]);
        sub.files[0].status = Status::Done;

        handler.handle(0, &mut sub, &ctx()).await.unwrap();
        assert_eq!(replicas.calls(), vec!["register /g/b CERN-disk"]);
    }

    #[tokio::test]
    async fn test_missing_targets_fall_back_to_default_endpoint() {
        let replicas = Arc::new(MockReplicaManager::default());
        let handler = RegisterFileHandler::new(replicas.clone());
        let mut sub = sub_with_files("register", &["/g/a"], &[]);

        handler.handle(0, &mut sub, &ctx()).await.unwrap();
        assert_eq!(replicas.calls(), vec!["register /g/a failover"]);
    }

    #[tokio::test]
    async fn test_builtin_registration_covers_all_operations() {
        let replicas: ReplicaManagerRef = Arc::new(NoOpReplicaManager);
        let builder = crate::engine::RequestTaskEngine::builder(Default::default());
        let engine = register_builtin_handlers(builder, replicas).build();
        let mut operations = engine.operations();
        operations.sort();
        assert_eq!(operations, vec!["register", "remove", "replicate"]);
    }
}

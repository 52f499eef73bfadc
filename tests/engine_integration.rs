// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Integration tests for the request task engine.
//!
//! Requests travel the full wire path: serialized to JSON, parsed back,
//! executed through the built-in handlers against a mock replica
//! manager, and written back through the request store.

use gridmesh::handlers::{register_builtin_handlers, ReplicaManagerRef};
use gridmesh::{
    BoxFuture, EngineConfig, FileRecord, GridError, MemoryRequestStore, ReplicaManager, Request,
    RequestStore, RequestTaskEngine, Status, SubRequest,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Replica manager failing for configured logical names.
#[derive(Default)]
struct FlakyReplicaManager {
    fail_lfns: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl FlakyReplicaManager {
    fn failing(lfns: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            fail_lfns: lfns.iter().map(|s| s.to_string()).collect(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn attempt(&self, call: String, lfn: &str) -> gridmesh::Result<()> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).push(call);
        if self.fail_lfns.contains(lfn) {
            Err(GridError::Handler {
                index: 0,
                message: format!("no space left for {lfn}"),
            })
        } else {
            Ok(())
        }
    }
}

impl ReplicaManager for FlakyReplicaManager {
    fn register_file<'a>(
        &'a self,
        file: &'a FileRecord,
        endpoint: &'a str,
        _catalog: &'a str,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.attempt(format!("register {} {}", file.lfn, endpoint), &file.lfn) })
    }

    fn replicate_file<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.attempt(format!("replicate {lfn} {endpoint}"), lfn) })
    }

    fn remove_replica<'a>(&'a self, lfn: &'a str, endpoint: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move { self.attempt(format!("remove {lfn} {endpoint}"), lfn) })
    }
}

fn engine_with(
    replicas: ReplicaManagerRef,
) -> (RequestTaskEngine, Arc<MemoryRequestStore>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let store = Arc::new(MemoryRequestStore::new());
    let builder = RequestTaskEngine::builder(EngineConfig::default()).store(store.clone());
    (register_builtin_handlers(builder, replicas).build(), store)
}

fn transfer_request(operation: &str, lfns: &[&str]) -> Request {
    let mut sub = SubRequest::new(operation);
    sub.target_endpoints = vec!["CERN-disk".to_string()];
    for lfn in lfns {
        sub.files.push(FileRecord::new(*lfn));
    }
    let mut request = Request::new("transfer-001");
    request.owner_dn = "/DC=org/CN=alice".into();
    request.owner_group = "prod".into();
    request.job_id = Some(1234);
    request.sub_requests.push(sub);
    request
}

#[tokio::test]
async fn round_trip_all_success_ends_done_and_finalizable() {
    let replicas = FlakyReplicaManager::failing(&[]);
    let (engine, store) = engine_with(replicas.clone());

    // Serialize and parse back to exercise the wire form end to end.
    let wire = transfer_request("register", &["/g/a", "/g/b"]).to_json().unwrap();
    let request = Request::from_json(&wire).unwrap();

    let outcome = engine.run(request).await.unwrap();
    assert!(outcome.finalizable);
    assert!(outcome.request.is_done());
    assert_eq!(outcome.request.sub_requests[0].status, Status::Done);
    assert!(outcome.request.sub_requests[0]
        .files
        .iter()
        .all(|f| f.status == Status::Done));
    assert_eq!(replicas.calls().len(), 2);
    assert_eq!(store.finalized(), vec!["transfer-001"]);
    assert_eq!(outcome.marks.get("Execute"), Some(&1));
    assert_eq!(outcome.marks.get("Done"), Some(&1));
}

#[tokio::test]
async fn partial_failure_keeps_request_open() {
    let replicas = FlakyReplicaManager::failing(&["/g/b"]);
    let (engine, store) = engine_with(replicas.clone());

    let outcome = engine
        .run(transfer_request("replicate", &["/g/a", "/g/b", "/g/c"]))
        .await
        .unwrap();

    assert!(!outcome.finalizable);
    let sub = &outcome.request.sub_requests[0];
    assert_ne!(sub.status, Status::Done);
    assert!(sub.error.as_deref().unwrap().contains("/g/b"));
    assert_eq!(sub.files[0].status, Status::Done);
    assert_eq!(sub.files[1].status, Status::Waiting);
    assert_eq!(sub.files[2].status, Status::Done);
    assert!(store.finalized().is_empty());

    // Partial progress was still written back for the next attempt.
    let stored = store.peek("transfer-001").await.unwrap().unwrap();
    assert_eq!(stored.sub_requests[0].files[0].status, Status::Done);
}

#[tokio::test]
async fn retry_after_partial_failure_only_redoes_failed_files() {
    let replicas = FlakyReplicaManager::failing(&["/g/b"]);
    let (engine, _store) = engine_with(replicas.clone());

    let outcome = engine
        .run(transfer_request("remove", &["/g/a", "/g/b"]))
        .await
        .unwrap();
    assert!(!outcome.finalizable);

    // Second attempt over the same request object: /g/a is Done already.
    let healthy = FlakyReplicaManager::failing(&[]);
    let (engine, _store) = engine_with(healthy.clone());
    let retried = engine.run(outcome.request).await.unwrap();

    assert!(retried.finalizable);
    assert_eq!(healthy.calls(), vec!["remove /g/b CERN-disk"]);
}

#[tokio::test]
async fn unknown_operation_invokes_no_handler() {
    let replicas = FlakyReplicaManager::failing(&[]);
    let (engine, store) = engine_with(replicas.clone());

    let outcome = engine
        .run(transfer_request("transmogrify", &["/g/a"]))
        .await
        .unwrap();

    assert!(!outcome.finalizable);
    let sub = &outcome.request.sub_requests[0];
    assert_eq!(sub.status, Status::Waiting);
    assert!(sub.error.as_deref().unwrap().contains("transmogrify"));
    assert!(replicas.calls().is_empty());
    assert!(store.finalized().is_empty());
}

#[tokio::test]
async fn mixed_sub_requests_respect_order_threshold() {
    let replicas = FlakyReplicaManager::failing(&[]);
    let (engine, _store) = engine_with(replicas.clone());

    let mut request = transfer_request("register", &["/g/a"]);
    let mut deferred = SubRequest::new("remove");
    deferred.execution_order = 2; // above the threshold of 0
    deferred.target_endpoints = vec!["CERN-disk".to_string()];
    deferred.files.push(FileRecord::new("/g/z"));
    request.sub_requests.push(deferred);

    let outcome = engine.run(request).await.unwrap();
    assert_eq!(outcome.request.sub_requests[0].status, Status::Done);
    assert_eq!(outcome.request.sub_requests[1].status, Status::Waiting);
    // Only the first sub-request ran.
    assert_eq!(replicas.calls(), vec!["register /g/a CERN-disk"]);
    // Deferred work above the threshold does not block close-out.
    assert!(outcome.finalizable);
}

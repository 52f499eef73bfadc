// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request task engine: sub-request dispatch under an impersonated identity.
//!
//! One engine invocation executes one request's pending sub-requests to
//! completion or partial progress and reports whether the request may be
//! closed out. The engine is single-threaded per invocation; parallelism
//! across requests belongs to the invoking scheduler, which must never
//! run two executions of the same request concurrently.
//!
//! # State machine
//!
//! | Condition                              | Effect                            |
//! |----------------------------------------|-----------------------------------|
//! | execution order above threshold        | skip sub-request                  |
//! | status is not Waiting                  | skip sub-request                  |
//! | no actionable files remain             | mark sub-request Done             |
//! | operation has no registered handler    | dispatch fault, left Waiting      |
//! | handler returns an error               | recorded on sub-request           |
//! | handler succeeds, files remain Waiting | partial progress, not finalizable |
//!
//! After the loop the updated request is written back through the
//! [`RequestStore`] only when its serialization changed, and finalized
//! when it is finalizable and carries a job id. Persistence failures are
//! fatal to the invocation; everything inside the loop is absorbed and
//! reported in the returned request.
//!
//! The dispatch table is closed: handlers are registered on the
//! [`EngineBuilder`] before the engine is shared, never at runtime.

use crate::config::EngineConfig;
use crate::error::{GridError, Result};
use crate::metrics;
use crate::request::{Request, Status, SubRequest};
use crate::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-invocation context passed to every handler call.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub request_id: u64,
    pub request_name: String,
    pub job_id: Option<u64>,
    pub owner_dn: String,
    pub owner_group: String,
    /// Endpoint used when a sub-request names no targets.
    pub default_target_endpoint: String,
}

/// A registered operation implementation.
///
/// Handlers process every Waiting file independently: a failure on one
/// target endpoint for one file must not block other files or other
/// endpoints. Fully-succeeded files are set to Done in place; the error
/// return summarizes which logical names failed. Handlers must tolerate
/// already-Done files in the list.
pub trait OperationHandler: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        index: usize,
        sub: &'a mut SubRequest,
        ctx: &'a OperationContext,
    ) -> BoxFuture<'a, ()>;
}

/// Persistence collaborator for requests.
///
/// The engine only writes back and finalizes; get/put/peek/delete exist
/// for the invoking scheduler. Implementations clone what they need
/// before going async so the returned future borrows only the store.
pub trait RequestStore: Send + Sync + 'static {
    fn put(&self, request: &Request) -> BoxFuture<'_, ()>;
    /// Next request with pending work, if any, handed out for execution.
    fn get(&self) -> BoxFuture<'_, Option<Request>>;
    /// Read a request without handing it out.
    fn peek(&self, name: &str) -> BoxFuture<'_, Option<Request>>;
    fn update(&self, request: &Request, source: &str) -> BoxFuture<'_, ()>;
    fn finalize(&self, request: &Request, source: &str) -> BoxFuture<'_, ()>;
    fn delete(&self, name: &str) -> BoxFuture<'_, ()>;
}

/// In-memory [`RequestStore`], for tests and single-process deployments.
#[derive(Default)]
pub struct MemoryRequestStore {
    requests: Mutex<BTreeMap<String, Request>>,
    finalized: Mutex<Vec<String>>,
}

impl MemoryRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of requests finalized so far, in finalize order.
    pub fn finalized(&self) -> Vec<String> {
        self.finalized.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_requests(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Request>> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RequestStore for MemoryRequestStore {
    fn put(&self, request: &Request) -> BoxFuture<'_, ()> {
        let request = request.clone();
        Box::pin(async move {
            self.lock_requests().insert(request.request_name.clone(), request);
            Ok(())
        })
    }

    fn get(&self) -> BoxFuture<'_, Option<Request>> {
        Box::pin(async move {
            let mut requests = self.lock_requests();
            let name = requests
                .iter()
                .find(|(_, r)| {
                    r.sub_requests.iter().any(|s| s.status == Status::Waiting)
                })
                .map(|(name, _)| name.clone());
            Ok(name.and_then(|n| requests.remove(&n)))
        })
    }

    fn peek(&self, name: &str) -> BoxFuture<'_, Option<Request>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.lock_requests().get(&name).cloned()) })
    }

    fn update(&self, request: &Request, _source: &str) -> BoxFuture<'_, ()> {
        let request = request.clone();
        Box::pin(async move {
            self.lock_requests().insert(request.request_name.clone(), request);
            Ok(())
        })
    }

    fn finalize(&self, request: &Request, _source: &str) -> BoxFuture<'_, ()> {
        let name = request.request_name.clone();
        Box::pin(async move {
            self.finalized.lock().unwrap_or_else(|e| e.into_inner()).push(name);
            Ok(())
        })
    }

    fn delete(&self, name: &str) -> BoxFuture<'_, ()> {
        let name = name.to_string();
        Box::pin(async move {
            self.lock_requests().remove(&name);
            Ok(())
        })
    }
}

/// An issued impersonation credential.
#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub owner_dn: String,
    pub owner_group: String,
    /// Opaque reference to the stored credential material.
    pub token: String,
}

/// Credential-issuance collaborator for impersonated execution.
///
/// `acquire` fetches and installs a credential for the identity;
/// `release` restores the previous ambient credential and deletes the
/// fetched one. Release is synchronous so the [`CredentialScope`] guard
/// can run it from `Drop`, guaranteeing cleanup on every exit path.
pub trait CredentialProvider: Send + Sync + 'static {
    fn acquire<'a>(
        &'a self,
        owner_dn: &'a str,
        owner_group: &'a str,
    ) -> BoxFuture<'a, CredentialHandle>;
    fn release(&self, handle: &CredentialHandle);
}

/// Provider that hands out inert credentials, for tests and deployments
/// without identity switching.
#[derive(Debug, Default)]
pub struct NoOpCredentialProvider;

impl CredentialProvider for NoOpCredentialProvider {
    fn acquire<'a>(
        &'a self,
        owner_dn: &'a str,
        owner_group: &'a str,
    ) -> BoxFuture<'a, CredentialHandle> {
        let handle = CredentialHandle {
            owner_dn: owner_dn.to_string(),
            owner_group: owner_group.to_string(),
            token: String::new(),
        };
        Box::pin(async move { Ok(handle) })
    }

    fn release(&self, _handle: &CredentialHandle) {}
}

/// Guard holding an impersonation credential for the duration of a run.
///
/// Dropping the scope releases the credential, so cleanup happens on
/// success, handler error and early return alike.
pub struct CredentialScope<'a> {
    provider: &'a dyn CredentialProvider,
    handle: Option<CredentialHandle>,
}

impl<'a> CredentialScope<'a> {
    pub async fn acquire(
        provider: &'a dyn CredentialProvider,
        owner_dn: &str,
        owner_group: &str,
    ) -> Result<CredentialScope<'a>> {
        let handle = provider.acquire(owner_dn, owner_group).await.map_err(|e| {
            GridError::Credential {
                owner: owner_dn.to_string(),
                group: owner_group.to_string(),
                reason: e.to_string(),
            }
        })?;
        debug!(owner = %handle.owner_dn, group = %handle.owner_group, "Credential installed");
        Ok(Self {
            provider,
            handle: Some(handle),
        })
    }
}

impl Drop for CredentialScope<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.provider.release(&handle);
            debug!(owner = %handle.owner_dn, "Credential released");
        }
    }
}

/// Result of one engine invocation.
#[derive(Debug)]
pub struct TaskOutcome {
    /// The updated request, also persisted if it changed.
    pub request: Request,
    /// Whether the request may be closed out.
    pub finalizable: bool,
    /// Opaque monitoring counters; the caller owns aggregation.
    pub marks: BTreeMap<String, u64>,
}

/// Builder for [`RequestTaskEngine`]; the dispatch table closes at
/// [`build`](EngineBuilder::build).
pub struct EngineBuilder {
    config: EngineConfig,
    handlers: HashMap<String, Box<dyn OperationHandler>>,
    store: Option<Arc<dyn RequestStore>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
}

impl EngineBuilder {
    pub fn handler(mut self, operation: &str, handler: Box<dyn OperationHandler>) -> Self {
        self.handlers.insert(operation.to_string(), handler);
        self
    }

    pub fn store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn build(self) -> RequestTaskEngine {
        RequestTaskEngine {
            config: self.config,
            handlers: self.handlers,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(MemoryRequestStore::new())),
            credentials: self
                .credentials
                .unwrap_or_else(|| Arc::new(NoOpCredentialProvider)),
        }
    }
}

/// Executes one request at a time against a closed handler table.
pub struct RequestTaskEngine {
    config: EngineConfig,
    handlers: HashMap<String, Box<dyn OperationHandler>>,
    store: Arc<dyn RequestStore>,
    credentials: Arc<dyn CredentialProvider>,
}

impl RequestTaskEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            handlers: HashMap::new(),
            store: None,
            credentials: None,
        }
    }

    /// Registered operation names, for diagnostics.
    pub fn operations(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Pull the next pending request from the store and run it.
    pub async fn process_next(&self) -> Result<Option<TaskOutcome>> {
        match self.store.get().await? {
            Some(request) => Ok(Some(self.run(request).await?)),
            None => Ok(None),
        }
    }

    /// Execute one request.
    ///
    /// Absorbs dispatch faults, handler errors and file-level failures
    /// into the returned request; only credential acquisition and
    /// store write-back failures propagate as errors.
    pub async fn run(&self, mut request: Request) -> Result<TaskOutcome> {
        let started = Instant::now();
        let mut marks: BTreeMap<String, u64> = BTreeMap::new();
        *marks.entry("Execute".to_string()).or_insert(0) += 1;
        metrics::record_request_execute();

        info!(
            request = %request.request_name,
            sub_requests = request.sub_requests.len(),
            "Executing request"
        );
        let before = request.to_json()?;

        // Holds the impersonated identity for the whole run; dropping
        // at the end of this scope restores the previous credential.
        let _scope = if request.owner_dn.is_empty() {
            None
        } else {
            Some(
                CredentialScope::acquire(
                    self.credentials.as_ref(),
                    &request.owner_dn,
                    &request.owner_group,
                )
                .await?,
            )
        };

        let ctx = OperationContext {
            request_id: request.request_id,
            request_name: request.request_name.clone(),
            job_id: request.job_id,
            owner_dn: request.owner_dn.clone(),
            owner_group: request.owner_group.clone(),
            default_target_endpoint: self.config.default_target_endpoint.clone(),
        };

        let mut fault_free = true;
        for (index, sub) in request.sub_requests.iter_mut().enumerate() {
            if sub.execution_order > self.config.execution_order {
                debug!(
                    index,
                    order = sub.execution_order,
                    "Execution order above threshold, skipping"
                );
                continue;
            }
            if sub.status != Status::Waiting {
                debug!(index, status = %sub.status, "Sub-request not Waiting, skipping");
                continue;
            }

            if sub.is_empty_of_waiting() {
                info!(index, "No waiting files, sub-request is Done");
                sub.status = Status::Done;
                continue;
            }

            let handler = match self.handlers.get(&sub.operation) {
                Some(handler) => handler,
                None => {
                    warn!(index, operation = %sub.operation, "Operation not known");
                    metrics::record_dispatch_fault(&sub.operation);
                    let fault = GridError::Dispatch {
                        operation: sub.operation.clone(),
                    };
                    sub.error = Some(fault.to_string());
                    fault_free = false;
                    continue;
                }
            };

            info!(index, operation = %sub.operation, "Dispatching sub-request");
            match handler.handle(index, sub, &ctx).await {
                Ok(()) => {
                    if sub.is_empty_of_waiting() {
                        sub.status = Status::Done;
                    } else {
                        debug!(index, "Files still waiting, partial progress only");
                    }
                }
                Err(e) => {
                    warn!(index, error = %e, "Handler failed");
                    sub.error = Some(e.to_string());
                    fault_free = false;
                }
            }
        }

        let finalizable = fault_free
            && request
                .sub_requests
                .iter()
                .filter(|s| s.execution_order <= self.config.execution_order)
                .all(|s| s.status == Status::Done);

        let after = request.to_json()?;
        if after != before {
            info!(request = %request.request_name, "Request changed, writing back");
            self.store
                .update(&request, &self.config.source_tag)
                .await
                .map_err(|e| GridError::Persistence(e.to_string()))?;

            if finalizable && request.job_id.is_some() {
                info!(request = %request.request_name, job = ?request.job_id, "Finalizing request");
                self.store
                    .finalize(&request, &self.config.source_tag)
                    .await
                    .map_err(|e| GridError::Persistence(e.to_string()))?;
            }
        }

        *marks.entry("Done".to_string()).or_insert(0) += 1;
        metrics::record_request_done(started.elapsed());
        info!(request = %request.request_name, finalizable, "Request execution finished");

        Ok(TaskOutcome {
            request,
            finalizable,
            marks,
        })
    }
}

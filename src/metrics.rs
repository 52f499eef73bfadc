//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Snapshot commits and rejected submissions
//! - Slave heartbeats and sweep removals
//! - Request engine executions and per-operation file outcomes
//!
//! All metrics are prefixed with `gridmesh_`; counters end in `_total`,
//! gauges represent current state. Aggregation and export belong to the
//! embedding daemon; the engine additionally returns its per-invocation
//! marks to the caller, which owns pushing them anywhere.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a configuration commit attempt.
pub fn record_commit(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("gridmesh_config_commits_total", "status" => status).increment(1);
}

/// Record a submission rejected before commit (version or name mismatch).
pub fn record_submission_rejected(reason: &'static str) {
    counter!("gridmesh_config_rejections_total", "reason" => reason).increment(1);
}

/// Record a slave heartbeat.
pub fn record_heartbeat(accepted: bool) {
    let status = if accepted { "accepted" } else { "discarded" };
    counter!("gridmesh_slave_heartbeats_total", "status" => status).increment(1);
}

/// Set the current count of alive slaves.
pub fn set_alive_slaves(count: usize) {
    gauge!("gridmesh_alive_slaves").set(count as f64);
}

/// Record slaves removed by one sweep pass.
pub fn record_sweep_removed(count: usize) {
    if count > 0 {
        counter!("gridmesh_slaves_swept_total").increment(count as u64);
    }
}

/// Record a request engine invocation starting.
pub fn record_request_execute() {
    counter!("gridmesh_requests_executed_total").increment(1);
}

/// Record a request engine invocation completing normally.
pub fn record_request_done(duration: Duration) {
    counter!("gridmesh_requests_done_total").increment(1);
    histogram!("gridmesh_request_duration_seconds").record(duration.as_secs_f64());
}

/// Record a sub-request naming an unregistered operation.
pub fn record_dispatch_fault(operation: &str) {
    counter!("gridmesh_dispatch_faults_total", "operation" => operation.to_string()).increment(1);
}

/// Record per-file operation attempts for a handler.
pub fn record_operation_attempted(operation: &'static str, count: usize) {
    counter!("gridmesh_operation_files_total", "operation" => operation, "status" => "attempted")
        .increment(count as u64);
}

/// Record per-file operation successes for a handler.
pub fn record_operation_ok(operation: &'static str, count: usize) {
    counter!("gridmesh_operation_files_total", "operation" => operation, "status" => "ok")
        .increment(count as u64);
}

/// Record per-file operation failures for a handler.
pub fn record_operation_failed(operation: &'static str, count: usize) {
    counter!("gridmesh_operation_files_total", "operation" => operation, "status" => "failed")
        .increment(count as u64);
}

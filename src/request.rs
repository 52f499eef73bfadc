//! Request data model: the unit of work the task engine executes.
//!
//! A [`Request`] is an ordered list of [`SubRequest`]s, each naming one
//! operation (register, replicate, remove, ...) over zero or more
//! [`FileRecord`]s. Requests travel as JSON documents; the engine parses
//! one, drives its waiting sub-requests, and hands the updated document
//! back to the request store.

use serde::{Deserialize, Serialize};

/// Lifecycle status shared by requests, sub-requests and file records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Status {
    /// Not yet processed; the only actionable state.
    #[default]
    Waiting,
    /// Accepted by a scheduler, not yet executing.
    Scheduled,
    /// Terminal success.
    Done,
    /// Terminal failure.
    Failed,
    /// Withdrawn by the submitter.
    Canceled,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Waiting => "Waiting",
            Status::Scheduled => "Scheduled",
            Status::Done => "Done",
            Status::Failed => "Failed",
            Status::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// One file-level action inside a sub-request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Logical file name.
    pub lfn: String,
    /// Physical name hint, if the submitter knows one.
    #[serde(default)]
    pub pfn: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub status: Status,
    /// Accumulated per-target failure reasons, joined per target.
    #[serde(default)]
    pub error: Option<String>,
}

impl FileRecord {
    /// A fresh waiting record for a logical name.
    pub fn new(lfn: impl Into<String>) -> Self {
        Self {
            lfn: lfn.into(),
            pfn: String::new(),
            size: 0,
            guid: String::new(),
            checksum: String::new(),
            status: Status::Waiting,
            error: None,
        }
    }
}

/// One logical operation within a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubRequest {
    /// Key into the engine's operation dispatch table.
    pub operation: String,
    /// Processed only when at or below the engine's configured threshold.
    #[serde(default)]
    pub execution_order: i64,
    #[serde(default)]
    pub status: Status,
    /// Catalog hint forwarded to the handler.
    #[serde(default)]
    pub catalog: String,
    /// Target endpoints; deduplicated at dispatch, with a configured
    /// fallback when empty.
    #[serde(default)]
    pub target_endpoints: Vec<String>,
    /// Error recorded by the engine when a handler failed.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl SubRequest {
    /// A fresh waiting sub-request for an operation.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            execution_order: 0,
            status: Status::Waiting,
            catalog: String::new(),
            target_endpoints: Vec::new(),
            error: None,
            files: Vec::new(),
        }
    }

    /// Whether no contained file is still waiting.
    ///
    /// An empty sub-request is immediately markable `Done` without any
    /// handler invocation.
    pub fn is_empty_of_waiting(&self) -> bool {
        !self.files.iter().any(|f| f.status == Status::Waiting)
    }

    /// The files still awaiting action.
    pub fn waiting_files(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(|f| f.status == Status::Waiting)
    }

    /// Target endpoints deduplicated in order, falling back to `default`
    /// when none are named.
    pub fn resolved_targets(&self, default: &str) -> Vec<String> {
        let mut targets: Vec<String> = Vec::new();
        for endpoint in &self.target_endpoints {
            let trimmed = endpoint.trim();
            if !trimmed.is_empty() && !targets.iter().any(|t| t == trimmed) {
                targets.push(trimmed.to_string());
            }
        }
        if targets.is_empty() {
            targets.push(default.to_string());
        }
        targets
    }
}

/// The unit of work handed to the task engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub request_id: u64,
    pub request_name: String,
    /// Identity the engine impersonates while executing, if present.
    #[serde(default)]
    pub owner_dn: String,
    #[serde(default)]
    pub owner_group: String,
    /// Originating job; its presence enables finalization.
    #[serde(default)]
    pub job_id: Option<u64>,
    #[serde(default)]
    pub sub_requests: Vec<SubRequest>,
}

impl Request {
    /// A fresh named request with no sub-requests.
    pub fn new(request_name: impl Into<String>) -> Self {
        Self {
            request_id: 0,
            request_name: request_name.into(),
            owner_dn: String::new(),
            owner_group: String::new(),
            job_id: None,
            sub_requests: Vec::new(),
        }
    }

    /// Whether every sub-request has reached terminal success.
    ///
    /// An empty request has nothing left to do and counts as done.
    pub fn is_done(&self) -> bool {
        self.sub_requests.iter().all(|s| s.status == Status::Done)
    }

    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from the JSON wire form.
    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the configuration replicator and the request task engine.
//!
//! Every public operation in this crate returns a [`Result`] carrying a
//! [`GridError`] on failure. Errors never cross a component boundary as a
//! panic; locally recoverable conditions (an unreachable slave, one file
//! failing on one target) are absorbed into partial-failure data instead of
//! surfacing here.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Backup` | Yes | Disk I/O while writing or reading version backups |
//! | `Persistence` | Yes | Request store write-back failed |
//! | `NotMaster` | No | Mutation submitted to a slave server |
//! | `NameMismatch` | No | Submitted configuration identity differs |
//! | `Merge` | No | Divergent versions could not be auto-merged |
//! | `VersionNotFound` | No | No backup archive matches the version label |
//! | `Config` | No | Invalid or incomplete configuration at startup |
//! | `Codec` | No | Corrupt compressed snapshot or malformed JSON |
//! | `Dispatch` | No | No handler registered for a sub-request operation |
//! | `Handler` | No | An operation handler reported a failure |
//! | `Credential` | No | Impersonation credential could not be acquired |
//!
//! Use [`GridError::is_retryable()`] to decide whether the caller should
//! retry with backoff. The replicator never retries internally; a failed
//! commit is fatal to the triggering call and the supervisor retries.

use thiserror::Error;

/// Result type alias for replicator and engine operations.
pub type Result<T> = std::result::Result<T, GridError>;

/// Errors surfaced by the configuration replicator and the request engine.
#[derive(Error, Debug)]
pub enum GridError {
    /// Mutation submitted to a server running in slave mode.
    ///
    /// Only the master accepts configuration updates and heartbeats.
    #[error("configuration modification is not allowed in this server")]
    NotMaster,

    /// Configuration identity differs between master and submission.
    #[error("configuration names differ: server is {local} and remote is {remote}")]
    NameMismatch { local: String, remote: String },

    /// Divergent snapshot versions could not be reconciled.
    ///
    /// The submission is rejected in full; the authoritative snapshot is
    /// left untouched. The message names the colliding path when the
    /// conflict detector found one.
    #[error("AutoMerge failed: {0}")]
    Merge(String),

    /// No backup archive matches the requested version label.
    #[error("version {0} does not exist")]
    VersionNotFound(String),

    /// Invalid or incomplete configuration.
    ///
    /// Raised at startup (e.g. a master without a configuration name) and
    /// never recoverable without operator intervention.
    #[error("configuration error: {0}")]
    Config(String),

    /// Disk I/O failure in the backup store.
    ///
    /// Fatal to the triggering commit; the caller must retry the whole
    /// submission once the disk condition is resolved.
    #[error("backup store error ({operation}): {source}")]
    Backup {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Zip archive failure in the backup store.
    #[error("backup archive error ({operation}): {source}")]
    Archive {
        operation: String,
        #[source]
        source: zip::result::ZipError,
    },

    /// Corrupt compressed payload.
    #[error("codec error: {0}")]
    Codec(String),

    /// JSON (de)serialization failure for snapshots or requests.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A sub-request names an operation with no registered handler.
    ///
    /// A configuration fault, not a data fault: the sub-request is left
    /// `Waiting` for operator correction and the request becomes
    /// non-finalizable.
    #[error("no handler registered for operation '{operation}'")]
    Dispatch { operation: String },

    /// An operation handler reported a failure for a sub-request.
    ///
    /// The message aggregates the logical names that failed.
    #[error("sub-request {index} failed: {message}")]
    Handler { index: usize, message: String },

    /// Writing the updated request back to the request store failed.
    ///
    /// Fatal to the engine invocation and propagated to the caller.
    #[error("request store error: {0}")]
    Persistence(String),

    /// Impersonation credential acquisition failed.
    ///
    /// Aborts the engine invocation before any dispatch.
    #[error("credential error for '{owner}'@'{group}': {reason}")]
    Credential {
        owner: String,
        group: String,
        reason: String,
    },
}

impl GridError {
    /// Create a backup I/O error with operation context.
    pub fn backup(operation: impl Into<String>, source: std::io::Error) -> Self {
        Self::Backup {
            operation: operation.into(),
            source,
        }
    }

    /// Create a backup archive error with operation context.
    pub fn archive(operation: impl Into<String>, source: zip::result::ZipError) -> Self {
        Self::Archive {
            operation: operation.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Backup { .. } => true,
            Self::Archive { .. } => false, // corrupt archive needs attention
            Self::Persistence(_) => true,
            Self::NotMaster => false,
            Self::NameMismatch { .. } => false,
            Self::Merge(_) => false,
            Self::VersionNotFound(_) => false,
            Self::Config(_) => false,
            Self::Codec(_) => false,
            Self::Serialization(_) => false,
            Self::Dispatch { .. } => false,
            Self::Handler { .. } => false,
            Self::Credential { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_backup_io() {
        let err = GridError::backup(
            "write",
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(err.is_retryable());
        assert!(err.to_string().contains("write"));
    }

    #[test]
    fn test_not_retryable_not_master() {
        assert!(!GridError::NotMaster.is_retryable());
    }

    #[test]
    fn test_not_retryable_merge() {
        let err = GridError::Merge("AutoMerge not available".into());
        assert!(!err.is_retryable());
        assert!(err.to_string().starts_with("AutoMerge failed"));
    }

    #[test]
    fn test_name_mismatch_names_both_sides() {
        let err = GridError::NameMismatch {
            local: "Production".into(),
            remote: "Certification".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("Production"));
        assert!(msg.contains("Certification"));
    }

    #[test]
    fn test_dispatch_names_operation() {
        let err = GridError::Dispatch {
            operation: "transfer".into(),
        };
        assert!(err.to_string().contains("transfer"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_handler_names_index() {
        let err = GridError::Handler {
            index: 3,
            message: "registration failed for /grid/a".into(),
        };
        assert!(err.to_string().contains('3'));
        assert!(err.to_string().contains("/grid/a"));
    }

    #[test]
    fn test_credential_names_owner_and_group() {
        let err = GridError::Credential {
            owner: "/DC=org/CN=alice".into(),
            group: "prod".into(),
            reason: "no valid proxy".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("alice"));
        assert!(msg.contains("prod"));
        assert!(msg.contains("no valid proxy"));
    }

    #[test]
    fn test_retryable_persistence() {
        assert!(GridError::Persistence("timeout".into()).is_retryable());
    }

    #[test]
    fn test_version_not_found_message() {
        let err = GridError::VersionNotFound("20260101".into());
        assert_eq!(err.to_string(), "version 20260101 does not exist");
    }
}

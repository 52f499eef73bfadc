//! Configuration for the replicator and the request task engine.
//!
//! Both config types are plain serde structs with per-field defaults, so
//! they can be constructed programmatically or deserialized from YAML/JSON
//! by the embedding daemon.
//!
//! # Example
//!
//! ```rust
//! use gridmesh::config::{ReplicatorConfig, Role};
//!
//! let config = ReplicatorConfig {
//!     config_name: "Production".into(),
//!     role: Role::Master,
//!     self_url: "dips://cs-master:9135".into(),
//!     backup_dir: "/var/lib/gridmesh/csbackup".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.grace_time_sec, 600);
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Role of this configuration server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Owns the authoritative tree; accepts updates and heartbeats.
    Master,
    /// Pulls snapshots from the master; rejects all mutations.
    #[default]
    Slave,
}

/// Configuration for [`ConfigReplicator`](crate::replicator::ConfigReplicator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Logical identity of the configuration being served.
    /// A master refuses to start without one.
    #[serde(default)]
    pub config_name: String,

    /// Master or slave role.
    #[serde(default)]
    pub role: Role,

    /// This server's own endpoint, registered in the server list.
    #[serde(default)]
    pub self_url: String,

    /// Master endpoint a slave pulls from. Unused in master role.
    #[serde(default)]
    pub master_url: String,

    /// Directory holding the zipped version history.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Seconds a slave may stay silent before the sweep removes it.
    /// Also the sweep loop period.
    #[serde(default = "default_grace_time_sec")]
    pub grace_time_sec: u64,

    /// Service type a slave must identify as when pinged.
    #[serde(default = "default_service_type")]
    pub service_type: String,
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("etc/csbackup")
}

fn default_grace_time_sec() -> u64 {
    600
}

fn default_service_type() -> String {
    "Configuration/Server".to_string()
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            config_name: String::new(),
            role: Role::Slave,
            self_url: String::new(),
            master_url: String::new(),
            backup_dir: default_backup_dir(),
            grace_time_sec: default_grace_time_sec(),
            service_type: default_service_type(),
        }
    }
}

impl ReplicatorConfig {
    /// The grace period as a [`Duration`].
    pub fn grace_time(&self) -> Duration {
        Duration::from_secs(self.grace_time_sec)
    }

    /// Minimal master config for tests: short grace time, temp-style paths.
    pub fn for_testing(config_name: &str, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_name: config_name.to_string(),
            role: Role::Master,
            self_url: "dips://test-master:9135".to_string(),
            backup_dir: backup_dir.into(),
            grace_time_sec: 1,
            ..Default::default()
        }
    }
}

/// Configuration for [`RequestTaskEngine`](crate::engine::RequestTaskEngine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Execution-order threshold: sub-requests whose order exceeds this
    /// are skipped in this invocation.
    #[serde(default)]
    pub execution_order: i64,

    /// Endpoint used when a file record names no target endpoints.
    #[serde(default = "default_failover_endpoint")]
    pub default_target_endpoint: String,

    /// Source tag passed to the request store on write-back and finalize.
    #[serde(default = "default_source_tag")]
    pub source_tag: String,
}

fn default_failover_endpoint() -> String {
    "failover".to_string()
}

fn default_source_tag() -> String {
    "gridmesh-engine".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_order: 0,
            default_target_endpoint: default_failover_endpoint(),
            source_tag: default_source_tag(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicator_defaults() {
        let config = ReplicatorConfig::default();
        assert_eq!(config.role, Role::Slave);
        assert_eq!(config.grace_time_sec, 600);
        assert_eq!(config.service_type, "Configuration/Server");
    }

    #[test]
    fn test_replicator_deserializes_with_partial_fields() {
        let config: ReplicatorConfig = serde_json::from_str(
            r#"{"config_name": "Production", "role": "master", "grace_time_sec": 30}"#,
        )
        .unwrap();
        assert_eq!(config.config_name, "Production");
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.grace_time(), Duration::from_secs(30));
        assert_eq!(config.backup_dir, PathBuf::from("etc/csbackup"));
    }

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.execution_order, 0);
        assert_eq!(config.default_target_endpoint, "failover");
    }

    #[test]
    fn test_for_testing_is_master() {
        let config = ReplicatorConfig::for_testing("Test", "/tmp/backups");
        assert_eq!(config.role, Role::Master);
        assert_eq!(config.grace_time_sec, 1);
    }
}

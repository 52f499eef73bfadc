// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration replicator: master/slave membership, versioning, history.
//!
//! The main orchestrator for the configuration service core:
//! - authoritative snapshot ownership via [`crate::snapshot::ConfigSnapshot`]
//! - durable version history via [`crate::backup::BackupStore`]
//! - slave liveness table swept by a background task
//! - optimistic-concurrency update submissions with conflict detection
//!
//! # Architecture
//!
//! In master mode the replicator owns the tree: it accepts
//! [`submit_update`](ConfigReplicator::submit_update) calls, registers
//! slave heartbeats, and runs a sweep loop that expires silent slaves.
//! In slave mode every mutation is refused and continuous pulling is
//! delegated to the [`Refresher`] collaborator.
//!
//! All writes to the authoritative snapshot serialize through one
//! exclusive lock; the lock covers only the swap-and-version-bump step.
//! Disk persistence, network pings and merge computation happen outside
//! it. Version reads are advisory: a read racing a commit may observe
//! either value.

use crate::backup::{BackupStore, HistoryEntry};
use crate::config::{ReplicatorConfig, Role};
use crate::diff::{check_conflicts, modifications_between, Modification};
use crate::error::{GridError, Result};
use crate::metrics;
use crate::snapshot::{ConfigSnapshot, RESERVED_SECTION};
use crate::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reply to the identification call, used to validate a slave.
#[derive(Debug, Clone)]
pub struct PingInfo {
    /// Service type the remote identifies as.
    pub service_type: String,
}

/// Identification call against a remote endpoint.
///
/// The transport is out of scope here; the daemon provides an
/// implementation over its RPC layer. A failed ping or a wrong service
/// type silently discards the heartbeat.
pub trait ServicePing: Send + Sync + 'static {
    fn ping(&self, url: &str) -> BoxFuture<'_, PingInfo>;
}

/// Ping implementation answering a fixed service type, for tests and
/// standalone runs.
#[derive(Debug, Clone)]
pub struct StaticPing {
    pub service_type: String,
}

impl StaticPing {
    pub fn configuration_server() -> Self {
        Self {
            service_type: "Configuration/Server".to_string(),
        }
    }
}

impl ServicePing for StaticPing {
    fn ping(&self, url: &str) -> BoxFuture<'_, PingInfo> {
        let reply = PingInfo {
            service_type: self.service_type.clone(),
        };
        debug!(url, "StaticPing: answering ping");
        Box::pin(async move { Ok(reply) })
    }
}

/// Continuous-pull collaborator a slave delegates to.
pub trait Refresher: Send + Sync + 'static {
    /// Start pulling snapshots from the master and republishing them.
    fn auto_refresh(&self, master_url: &str) -> BoxFuture<'_, ()>;
}

/// Refresher that does nothing, for tests and master-only deployments.
#[derive(Debug, Clone)]
pub struct NoOpRefresher;

impl Refresher for NoOpRefresher {
    fn auto_refresh(&self, master_url: &str) -> BoxFuture<'_, ()> {
        debug!(master_url, "NoOpRefresher: would start auto refresh");
        Box::pin(async { Ok(()) })
    }
}

/// Master/slave configuration replicator.
pub struct ConfigReplicator {
    config: ReplicatorConfig,
    pinger: Arc<dyn ServicePing>,
    refresher: Arc<dyn Refresher>,
    backup: BackupStore,

    /// Authoritative snapshot; the write lock is the commit lock.
    snapshot: Arc<RwLock<ConfigSnapshot>>,
    /// Merge base: the snapshot committed just before the current one.
    previous: Arc<RwLock<Option<ConfigSnapshot>>>,
    /// Slave endpoint -> last heartbeat. The mutex is held across the
    /// matching server-list commit so heartbeat registration and the
    /// sweep never interleave their membership writes.
    slaves: Arc<Mutex<HashMap<String, Instant>>>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    sweep_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ConfigReplicator {
    /// Create a replicator with the default collaborators.
    pub fn new(config: ReplicatorConfig) -> Result<Self> {
        Self::with_collaborators(
            config,
            Arc::new(StaticPing::configuration_server()),
            Arc::new(NoOpRefresher),
        )
    }

    /// Create a replicator with explicit ping and refresh collaborators.
    pub fn with_collaborators(
        config: ReplicatorConfig,
        pinger: Arc<dyn ServicePing>,
        refresher: Arc<dyn Refresher>,
    ) -> Result<Self> {
        let backup = BackupStore::new(&config.backup_dir, &config.config_name)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let snapshot = ConfigSnapshot::new(&config.config_name);
        Ok(Self {
            config,
            pinger,
            refresher,
            backup,
            snapshot: Arc::new(RwLock::new(snapshot)),
            previous: Arc::new(RwLock::new(None)),
            slaves: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            sweep_handle: Mutex::new(None),
        })
    }

    /// Whether this server owns the authoritative tree.
    pub fn is_master(&self) -> bool {
        self.config.role == Role::Master
    }

    /// Initialize the service for its configured role.
    ///
    /// Slave: delegates continuous pulling to the refresher and returns.
    ///
    /// Master: loads the most recent committed snapshot, verifies the
    /// configuration identity (a missing name is a fatal startup
    /// precondition), generates an initial version if none exists,
    /// registers its own endpoint in the server list, persists any of
    /// those changes as one new version, loads the merge base, and
    /// starts the dead-slave sweep loop.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        info!(
            url = %self.config.self_url,
            name = %self.config.config_name,
            "Initializing configuration service"
        );

        if !self.is_master() {
            info!("Starting configuration service as slave");
            self.refresher.auto_refresh(&self.config.master_url).await?;
            return Ok(());
        }

        info!("Starting configuration service as master");
        if self.config.config_name.is_empty() {
            return Err(GridError::Config(
                "missing name for the configuration to be exported".into(),
            ));
        }

        let mut built_new_version = false;
        {
            let mut snap = self.snapshot.write().await;
            if let Some(loaded) = self.backup.load_latest()? {
                if loaded.name != self.config.config_name {
                    return Err(GridError::Config(format!(
                        "backup directory holds configuration '{}', expected '{}'",
                        loaded.name, self.config.config_name
                    )));
                }
                *snap = loaded;
            }

            if !snap.has_version() {
                info!("There is no version yet, generating a new one");
                built_new_version = true;
            }

            let mut servers = snap.servers();
            if !servers.iter().any(|s| s == &self.config.self_url) {
                servers.insert(0, self.config.self_url.clone());
                snap.set_servers(&servers);
                built_new_version = true;
            }
            snap.set_master_server(&self.config.self_url);

            if built_new_version {
                snap.generate_new_version();
            }
        }

        if built_new_version {
            let snap = self.snapshot.read().await.clone();
            self.backup.write(&snap, &self.config.self_url)?;
        }

        // The newest backup becomes the merge base for the next commit.
        *self.previous.write().await = self.backup.load_latest()?;

        self.spawn_sweep_task().await;
        Ok(())
    }

    /// Spawn the dead-slave sweep loop; period equals the grace time.
    async fn spawn_sweep_task(self: &Arc<Self>) {
        let replicator = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_rx.clone();
        let period = self.config.grace_time();

        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            timer.tick().await; // first tick fires immediately, skip it
            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = replicator.sweep_dead_slaves().await {
                            warn!(error = %e, "Dead-slave sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Sweep task stopping");
                            break;
                        }
                    }
                }
            }
        });

        info!(period_sec = self.config.grace_time_sec, "Spawned slave sweep task");
        *self.sweep_handle.lock().await = Some(handle);
    }

    /// Stop the background sweep loop.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("Configuration replicator stopped");
    }

    /// Record a slave heartbeat, validating the remote first.
    ///
    /// A failed ping or a wrong service type discards the heartbeat
    /// without error: the slave is presumed transiently unreachable. A
    /// first-time registration rewrites the server list and commits a new
    /// version, which fans out to all replicas on their next pull.
    pub async fn register_heartbeat(&self, slave_url: &str) -> Result<()> {
        if !self.is_master() {
            return Err(GridError::NotMaster);
        }

        info!(slave = slave_url, "Pinging slave");
        let reply = match self.pinger.ping(slave_url).await {
            Ok(reply) => reply,
            Err(e) => {
                info!(slave = slave_url, error = %e, "Slave did not reply, heartbeat discarded");
                metrics::record_heartbeat(false);
                return Ok(());
            }
        };
        if reply.service_type != self.config.service_type {
            info!(
                slave = slave_url,
                service_type = %reply.service_type,
                "Slave is not a configuration server, heartbeat discarded"
            );
            metrics::record_heartbeat(false);
            return Ok(());
        }

        let mut slaves = self.slaves.lock().await;
        let is_new = !slaves.contains_key(slave_url);
        slaves.insert(slave_url.to_string(), Instant::now());
        metrics::record_heartbeat(true);
        metrics::set_alive_slaves(slaves.len());

        if is_new {
            info!(slave = slave_url, "New slave registered");
            self.commit_server_list(&slaves).await?;
        }
        Ok(())
    }

    /// Remove slaves silent for longer than the grace period.
    ///
    /// Returns the number of endpoints removed. A membership change
    /// commits a new version, same as a registration.
    pub async fn sweep_dead_slaves(&self) -> Result<usize> {
        debug!("Checking status of slave servers");
        let grace = self.config.grace_time();
        let now = Instant::now();

        let mut slaves = self.slaves.lock().await;
        let dead: Vec<String> = slaves
            .iter()
            .filter(|(_, last)| now.duration_since(**last) > grace)
            .map(|(url, _)| url.clone())
            .collect();
        for url in &dead {
            info!(slave = %url, "Found dead slave");
            slaves.remove(url);
        }

        metrics::record_sweep_removed(dead.len());
        metrics::set_alive_slaves(slaves.len());
        if !dead.is_empty() {
            self.commit_server_list(&slaves).await?;
        }
        Ok(dead.len())
    }

    /// Rewrite the server-list option and commit a new version.
    ///
    /// Caller holds the slave table mutex, so membership commits from
    /// heartbeats and the sweep are serialized with respect to each
    /// other as well as through the snapshot commit lock.
    async fn commit_server_list(&self, slaves: &HashMap<String, Instant>) -> Result<()> {
        let mut servers: Vec<String> = slaves.keys().cloned().collect();
        servers.sort();
        servers.insert(0, self.config.self_url.clone());

        let committed = {
            let mut snap = self.snapshot.write().await;
            snap.set_servers(&servers);
            snap.generate_new_version();
            snap.clone()
        };
        self.backup.write(&committed, &self.config.self_url)?;
        debug!(version = %committed.version, servers = servers.len(), "Server list committed");
        Ok(())
    }

    /// Accept or reject a configuration update submission.
    ///
    /// `buffer` is the compressed serialized snapshot; `committer` tags
    /// the durable backup. With `force_version` the submission is stamped
    /// with the current authoritative version (the caller asserts it is
    /// up to date) and always applies; otherwise a version mismatch goes
    /// through [`auto_merge`](Self::auto_merge), which presently always
    /// rejects. A name mismatch rejects outright. On success the previous
    /// snapshot becomes the new merge base, the tree is swapped under the
    /// commit lock, and the result is persisted to backup storage tagged
    /// `committer@version`.
    pub async fn submit_update(
        &self,
        buffer: &[u8],
        committer: &str,
        force_version: bool,
    ) -> Result<String> {
        if !self.is_master() {
            return Err(GridError::NotMaster);
        }

        let mut remote = ConfigSnapshot::from_compressed_bytes(buffer)?;
        let local_version = self.version().await;
        if force_version {
            remote.version = local_version.clone();
        }

        info!(
            remote = %remote.version,
            local = %local_version,
            committer,
            "Checking versions"
        );
        if remote.version != local_version {
            info!("Versions differ, attempting AutoMerge");
            match self.auto_merge(&remote).await {
                Ok(merged) => {
                    info!("AutoMerge successful");
                    remote = merged;
                }
                Err(e) => {
                    warn!(error = %e, "Could not AutoMerge");
                    metrics::record_submission_rejected("version_mismatch");
                    return Err(e);
                }
            }
        }

        let local_name = self.name().await;
        if remote.name != local_name {
            metrics::record_submission_rejected("name_mismatch");
            return Err(GridError::NameMismatch {
                local: local_name,
                remote: remote.name,
            });
        }

        info!("Committing new data");
        let committed = {
            let mut snap = self.snapshot.write().await;
            let prev = snap.clone();
            snap.tree = remote.tree;
            snap.generate_new_version();
            *self.previous.write().await = Some(prev);
            snap.clone()
        };

        // Persistence stays outside the commit lock; a disk failure is
        // fatal to this call and the caller retries the submission.
        match self.backup.write(&committed, committer) {
            Ok(_) => {
                metrics::record_commit(true);
                info!(version = %committed.version, "New version committed");
                Ok(committed.version)
            }
            Err(e) => {
                metrics::record_commit(false);
                Err(e)
            }
        }
    }

    /// Three-way reconciliation of a divergent submission.
    ///
    /// Loads the submitter's claimed version from backup history as the
    /// merge base, computes base-to-authoritative and base-to-submission
    /// modification lists (masking the reserved section, whose churn is
    /// membership noise), and runs conflict detection. The replay step is
    /// not validated yet, so every attempt fails with "AutoMerge not
    /// available" even when no conflict was found; divergent versions are
    /// never silently accepted.
    pub async fn auto_merge(&self, remote: &ConfigSnapshot) -> Result<ConfigSnapshot> {
        let base = self.backup.load_at_version(&remote.version).map_err(|_| {
            GridError::Merge("could not retrieve original committer's version".into())
        })?;
        info!(base = %base.version, "Loaded client original version");

        let current = self.snapshot.read().await.clone();
        let real = masked_modifications(&base, &current);
        let requested = masked_modifications(&base, remote);
        check_conflicts(&real, &requested, "")?;

        warn!("No conflicts found, but the merge replay step is not validated");
        Err(GridError::Merge("AutoMerge not available".into()))
    }

    /// Current version label. Advisory: a racing commit may be observed
    /// at either the old or new value.
    pub async fn version(&self) -> String {
        self.snapshot.read().await.version.clone()
    }

    /// Configuration identity.
    pub async fn name(&self) -> String {
        self.snapshot.read().await.name.clone()
    }

    /// Current snapshot as a compressed wire buffer.
    pub async fn compressed_snapshot(&self) -> Result<Vec<u8>> {
        self.snapshot.read().await.to_compressed_bytes()
    }

    /// A clone of the current authoritative snapshot.
    pub async fn current_snapshot(&self) -> ConfigSnapshot {
        self.snapshot.read().await.clone()
    }

    /// `(version, committer)` history, most recent first.
    pub fn backup_history(&self) -> Result<Vec<HistoryEntry>> {
        self.backup.history()
    }

    /// The archived tree at a version label, recompressed for transport.
    pub fn snapshot_at_version(&self, version: &str) -> Result<Vec<u8>> {
        self.backup.contents_at_version(version)
    }

    /// Currently alive slave endpoints.
    pub async fn alive_slaves(&self) -> Vec<String> {
        self.slaves.lock().await.keys().cloned().collect()
    }
}

/// Diff two snapshots, dropping modifications under the reserved section.
fn masked_modifications(from: &ConfigSnapshot, to: &ConfigSnapshot) -> Vec<Modification> {
    modifications_between(&from.tree, &to.tree)
        .into_iter()
        .filter(|m| m.name() != RESERVED_SECTION)
        .collect()
}

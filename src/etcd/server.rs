//! Local etcd server lifecycle
//!
//! Supervises the co-located etcd process: seeding a brand-new cluster
//! (optionally from a snapshot), joining an existing one, periodic snapshots,
//! and stopping. Background tasks (exit watcher, member cleaner, periodic
//! snapshotter) share a cancellation token so none of them outlives the
//! server they observe.

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::client::Client;
use super::snapshot::{self, remove_dir_if_exists};
use super::{
    cleaner, client_url, initial_cluster, peer_url, EtcdError, SecurityConfig,
    DEFAULT_METRICS_PORT, DEFAULT_START_HEALTHY_THRESHOLD, DEFAULT_START_TIMEOUT,
};
use crate::providers::snapshot::etcd::EtcdDirProvider;
use crate::providers::snapshot::{Metadata, Provider, SnapshotError};

/// Deadline for the opportunistic restart as an existing member during a
/// join; a stale membership should not hold the join up for long.
const REJOIN_START_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a graceful stop may take before the process is killed.
const STOP_GRACE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub data_dir: PathBuf,
    pub data_quota: i64,
    pub public_address: String,
    pub private_address: String,
    pub client_sc: SecurityConfig,
    pub peer_sc: SecurityConfig,
    pub auto_compaction_mode: Option<String>,
    pub auto_compaction_retention: Option<String>,
    pub unhealthy_member_ttl: Duration,
    pub snapshot_interval: Duration,
    pub snapshot_ttl: Duration,
}

pub struct Server {
    cfg: ServerConfig,
    snapshot_provider: Option<Arc<dyn Provider>>,
    running: Arc<AtomicBool>,
    supervised: tokio::sync::Mutex<Option<Supervised>>,
}

struct Supervised {
    pid: u32,
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
}

impl Server {
    pub fn new(cfg: ServerConfig, snapshot_provider: Option<Arc<dyn Provider>>) -> Self {
        Self {
            cfg,
            snapshot_provider,
            running: Arc::new(AtomicBool::new(false)),
            supervised: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Seed a brand-new one-member cluster, optionally restoring `snapshot`
    /// into the data directory first.
    pub async fn seed(self: &Arc<Self>, snapshot_meta: Option<Metadata>) -> Result<()> {
        match snapshot_meta {
            Some(meta) => {
                let source = meta
                    .source
                    .clone()
                    .ok_or_else(|| anyhow!("snapshot metadata carries no source store"))?;

                // Materialize before touching the data directory; the backup
                // may live inside it.
                let (path, delete_on_consume) = source
                    .get(&meta)
                    .await
                    .map_err(|e| anyhow!(e))
                    .context("failed to retrieve latest snapshot")?;

                tracing::info!(
                    snapshot = %meta.filename(),
                    size_mb = format!("{:.3}", to_mb(meta.size)),
                    "restoring snapshot"
                );

                let restored = snapshot::restore(
                    &path,
                    &self.cfg.name,
                    &self.cfg.data_dir,
                    &self.cfg.private_address,
                    &self.cfg.peer_sc,
                )
                .await;

                if delete_on_consume {
                    let _ = tokio::fs::remove_file(&path).await;
                }
                restored.context("failed to restore snapshot")?;
            }
            None => {
                remove_dir_if_exists(&self.cfg.data_dir).await?;
            }
        }

        let peers = vec![(self.cfg.name.clone(), self.cfg.private_address.clone())];
        self.start_server("new", &peers, DEFAULT_START_TIMEOUT).await
    }

    /// Join the currently running cluster.
    ///
    /// If this instance already holds a membership and a data directory, a
    /// restart as an existing member is attempted first under a short
    /// deadline; a stale membership is removed instead. The fresh join adds
    /// the member under the cluster-wide join lock, wipes the data directory
    /// and starts with `cluster-state = existing`.
    pub async fn join(self: &Arc<Self>, client: &Client) -> Result<()> {
        let (members, _) = client.cluster_status().await?;

        let mut peers: Vec<(String, String)> = members
            .values()
            .filter(|member| member.healthy && member.name != self.cfg.name)
            .map(|member| (member.name.clone(), member.peer_address.clone()))
            .collect();
        peers.push((self.cfg.name.clone(), self.cfg.private_address.clone()));

        if let Some(existing) = members.get(&self.cfg.name) {
            if self.cfg.data_dir.exists() {
                match self
                    .start_server("existing", &peers, REJOIN_START_TIMEOUT)
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to join as an existing member, resetting");
                    }
                }
            }
            client
                .member_remove(existing.id)
                .await
                .context("failed to remove stale membership")?;
        }

        let peer_urls = vec![peer_url(
            &self.cfg.private_address,
            self.cfg.peer_sc.tls_enabled(),
        )];
        let (member_id, lock) = client.add_member(&self.cfg.name, peer_urls).await?;

        remove_dir_if_exists(&self.cfg.data_dir).await?;

        let started = self
            .start_server("existing", &peers, DEFAULT_START_TIMEOUT)
            .await;
        lock.unlock().await;

        if let Err(e) = started {
            if let Err(remove_err) = client.member_remove(member_id).await {
                tracing::warn!(error = %remove_err, "failed to remove just-added membership");
            }
            return Err(e).context("failed to start server");
        }
        Ok(())
    }

    /// Take a snapshot of the local member and save it to the snapshot store.
    ///
    /// Returns `EtcdError::RevisionTooOld` without writing anything when the
    /// store already holds the member's current revision.
    pub async fn snapshot(&self) -> Result<(), EtcdError> {
        let provider = match &self.snapshot_provider {
            Some(provider) => provider,
            None => return Ok(()),
        };

        let min_revision = match provider.info().await {
            Ok(meta) => meta.revision,
            Err(SnapshotError::NoSnapshot) => 0,
            Err(e) => {
                tracing::warn!(error = %e, "failed to find latest snapshot revision, continuing anyways");
                0
            }
        };

        let (spool, revision) =
            snapshot::take(&self.cfg.private_address, &self.cfg.client_sc, min_revision).await?;

        let mut metadata = Metadata::new(self.cfg.name.clone(), revision);
        let result = async {
            let mut reader = tokio::fs::File::open(&spool)
                .await
                .context("failed to open snapshot spool")?;
            provider
                .save(&mut reader, &mut metadata)
                .await
                .map_err(|e| anyhow!(e).context("failed to save snapshot"))
        }
        .await;
        let _ = tokio::fs::remove_file(&spool).await;
        result?;

        tracing::info!(
            snapshot = %metadata.filename(),
            size_mb = format!("{:.3}", to_mb(metadata.size)),
            "snapshot saved successfully"
        );

        let purger = Arc::clone(provider);
        let ttl = self.cfg.snapshot_ttl;
        tokio::spawn(async move {
            if let Err(e) = purger.purge(ttl).await {
                tracing::warn!(error = %e, "failed to purge old snapshots");
            }
        });

        Ok(())
    }

    /// The newest known snapshot: the snapshot store's latest, or the local
    /// data directory's state when the engine is stopped, whichever has the
    /// higher revision.
    pub async fn snapshot_info(&self) -> Result<Metadata, SnapshotError> {
        let mut candidates: Vec<Metadata> = Vec::new();

        if let Some(provider) = &self.snapshot_provider {
            match provider.info().await {
                Ok(meta) => candidates.push(meta.with_source(Arc::clone(provider))),
                Err(SnapshotError::NoSnapshot) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read snapshot store info");
                }
            }
        }

        // The data directory is owned by the engine while it runs; only look
        // at it when the engine is down.
        if !self.is_running() {
            let local: Arc<dyn Provider> = Arc::new(EtcdDirProvider::new(
                self.cfg.data_dir.clone(),
                self.cfg.name.clone(),
            ));
            match local.info().await {
                Ok(meta) => candidates.push(meta.with_source(local)),
                Err(SnapshotError::NoSnapshot) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read data-dir snapshot info");
                }
            }
        }

        candidates
            .into_iter()
            .max_by_key(|meta| meta.revision)
            .ok_or(SnapshotError::NoSnapshot)
    }

    /// Stop the local member. `graceful` terminates the engine and waits;
    /// otherwise it is killed outright. `take_snapshot` saves a final
    /// snapshot first when the engine is still up.
    pub async fn stop(&self, graceful: bool, take_snapshot: bool) {
        if take_snapshot && self.is_running() {
            match self.snapshot().await {
                Ok(()) => {}
                Err(EtcdError::RevisionTooOld) => {
                    tracing::debug!("skipping snapshot: store already holds the current revision");
                }
                Err(e) => tracing::warn!(error = %e, "failed to snapshot before stopping"),
            }
        }

        let supervised = self.supervised.lock().await.take();
        if let Some(supervised) = supervised {
            supervised.cancel.cancel();

            let signal = if graceful {
                Signal::SIGTERM
            } else {
                Signal::SIGKILL
            };
            let pid = Pid::from_raw(supervised.pid as i32);
            if let Err(e) = kill(pid, signal) {
                tracing::debug!(error = %e, "failed to signal etcd server");
            }

            let mut watcher = supervised.watcher;
            if tokio::time::timeout(STOP_GRACE_TIMEOUT, &mut watcher)
                .await
                .is_err()
            {
                tracing::warn!("etcd server did not exit in time, killing");
                let _ = kill(pid, Signal::SIGKILL);
                let _ = watcher.await;
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Start the etcd process and wait until the member is ready.
    ///
    /// Readiness means the member answers health probes continuously for
    /// `DEFAULT_START_HEALTHY_THRESHOLD`, bounded by `start_timeout`. On
    /// deadline or early exit the process is terminated and an error is
    /// returned; callers treat that as fatal.
    async fn start_server(
        self: &Arc<Self>,
        cluster_state: &str,
        peers: &[(String, String)],
        start_timeout: Duration,
    ) -> Result<()> {
        if self.is_running() {
            return Err(anyhow!("etcd server is already running"));
        }

        let mut child = self.spawn_etcd(cluster_state, peers)?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow!("etcd server exited immediately"))?;

        forward_stdio(&mut child);

        let deadline = Instant::now() + start_timeout;
        if let Err(e) = self.wait_ready(&mut child, deadline).await {
            let _ = child.kill().await;
            return Err(e);
        }

        let cancel = CancellationToken::new();
        self.running.store(true, Ordering::SeqCst);

        let watcher = {
            let running = Arc::clone(&self.running);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match child.wait().await {
                    Ok(status) => {
                        tracing::warn!(status = %status, "etcd server exited");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to wait on etcd server");
                    }
                }
                running.store(false, Ordering::SeqCst);
                cancel.cancel();
            })
        };

        cleaner::spawn(self, cancel.clone());
        self.spawn_snapshotter(cancel.clone());

        *self.supervised.lock().await = Some(Supervised {
            pid,
            cancel,
            watcher,
        });

        tracing::info!(
            name = %self.cfg.name,
            cluster_state = %cluster_state,
            "etcd server started"
        );
        Ok(())
    }

    fn spawn_etcd(&self, cluster_state: &str, peers: &[(String, String)]) -> Result<Child> {
        let cfg = &self.cfg;
        let peer_tls = cfg.peer_sc.tls_enabled();
        let client_tls = cfg.client_sc.tls_enabled();

        let mut command = Command::new("etcd");
        command
            .arg("--name")
            .arg(&cfg.name)
            .arg("--data-dir")
            .arg(&cfg.data_dir)
            .arg("--initial-cluster-state")
            .arg(cluster_state)
            .arg("--initial-cluster")
            .arg(initial_cluster(peers, peer_tls))
            .arg("--initial-advertise-peer-urls")
            .arg(peer_url(&cfg.private_address, peer_tls))
            .arg("--listen-peer-urls")
            .arg(peer_url(&cfg.private_address, peer_tls))
            .arg("--listen-client-urls")
            .arg(client_url(&cfg.private_address, client_tls))
            .arg("--advertise-client-urls")
            .arg(client_url(&cfg.public_address, client_tls))
            .arg("--listen-metrics-urls")
            .arg(format!(
                "http://{}:{},http://127.0.0.1:{}",
                cfg.private_address, DEFAULT_METRICS_PORT, DEFAULT_METRICS_PORT
            ))
            .arg("--metrics")
            .arg("extensive");

        if cfg.data_quota > 0 {
            command
                .arg("--quota-backend-bytes")
                .arg(cfg.data_quota.to_string());
        }
        if let Some(mode) = &cfg.auto_compaction_mode {
            command.arg("--auto-compaction-mode").arg(mode);
        }
        if let Some(retention) = &cfg.auto_compaction_retention {
            command.arg("--auto-compaction-retention").arg(retention);
        }

        if cfg.client_sc.has_material() {
            if let Some(cert) = &cfg.client_sc.cert_file {
                command.arg("--cert-file").arg(cert);
            }
            if let Some(key) = &cfg.client_sc.key_file {
                command.arg("--key-file").arg(key);
            }
            if let Some(ca) = &cfg.client_sc.trusted_ca_file {
                command.arg("--trusted-ca-file").arg(ca);
            }
            if cfg.client_sc.cert_auth {
                command.arg("--client-cert-auth");
            }
        } else if cfg.client_sc.auto_tls {
            command.arg("--auto-tls");
        }

        if cfg.peer_sc.has_material() {
            if let Some(cert) = &cfg.peer_sc.cert_file {
                command.arg("--peer-cert-file").arg(cert);
            }
            if let Some(key) = &cfg.peer_sc.key_file {
                command.arg("--peer-key-file").arg(key);
            }
            if let Some(ca) = &cfg.peer_sc.trusted_ca_file {
                command.arg("--peer-trusted-ca-file").arg(ca);
            }
            if cfg.peer_sc.cert_auth {
                command.arg("--peer-client-cert-auth");
            }
        } else if cfg.peer_sc.auto_tls {
            command.arg("--peer-auto-tls");
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command.spawn().context("failed to spawn etcd")
    }

    async fn wait_ready(&self, child: &mut Child, deadline: Instant) -> Result<()> {
        let addresses = [self.cfg.private_address.clone()];
        let mut healthy_since: Option<Instant> = None;

        loop {
            if Instant::now() >= deadline {
                return Err(anyhow!("server took too long to start"));
            }
            if let Some(status) = child.try_wait().context("failed to poll etcd server")? {
                return Err(anyhow!("etcd server exited during startup: {}", status));
            }

            let healthy = match Client::new(&addresses, &self.cfg.client_sc, false).await {
                Ok(client) => client.is_healthy(1, Duration::from_secs(2)).await,
                Err(_) => false,
            };

            if healthy {
                let since = *healthy_since.get_or_insert_with(Instant::now);
                if since.elapsed() >= DEFAULT_START_HEALTHY_THRESHOLD {
                    return Ok(());
                }
            } else {
                healthy_since = None;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn spawn_snapshotter(self: &Arc<Self>, cancel: CancellationToken) {
        if self.snapshot_provider.is_none() || self.cfg.snapshot_interval.is_zero() {
            tracing::warn!("snapshots are disabled");
            return;
        }

        let server = Arc::clone(self);
        let interval = self.cfg.snapshot_interval;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }

                match server.snapshot().await {
                    Ok(()) => {}
                    Err(EtcdError::RevisionTooOld) => {
                        tracing::debug!(
                            "skipping snapshot: store already holds the current revision"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "failed to snapshot"),
                }
            }
        });
    }

    pub(super) fn cleaner_config(&self) -> cleaner::CleanerConfig {
        cleaner::CleanerConfig {
            private_address: self.cfg.private_address.clone(),
            client_sc: self.cfg.client_sc.clone(),
            start_timeout: DEFAULT_START_TIMEOUT,
            unhealthy_member_ttl: self.cfg.unhealthy_member_ttl,
        }
    }
}

fn forward_stdio(child: &mut Child) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "etcd", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(target: "etcd", "{}", line);
            }
        });
    }
}

fn to_mb(size: i64) -> f64 {
    size as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ServerConfig {
        ServerConfig {
            name: "node-a".to_string(),
            data_dir: PathBuf::from("/tmp/eco-test-etcd"),
            data_quota: 0,
            public_address: "10.0.0.1".to_string(),
            private_address: "10.0.0.1".to_string(),
            client_sc: SecurityConfig::default(),
            peer_sc: SecurityConfig::default(),
            auto_compaction_mode: None,
            auto_compaction_retention: None,
            unhealthy_member_ttl: Duration::from_secs(120),
            snapshot_interval: Duration::from_secs(1800),
            snapshot_ttl: Duration::from_secs(86400),
        }
    }

    #[test]
    fn test_server_starts_stopped() {
        let server = Server::new(test_config(), None);
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_snapshot_without_provider_is_noop() {
        let server = Server::new(test_config(), None);
        assert!(server.snapshot().await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_info_without_anything() {
        let server = Server::new(test_config(), None);
        assert!(matches!(
            server.snapshot_info().await,
            Err(SnapshotError::NoSnapshot)
        ));
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_noop() {
        let server = Server::new(test_config(), None);
        server.stop(true, false).await;
        assert!(!server.is_running());
    }

    #[test]
    fn test_to_mb() {
        assert_eq!(to_mb(1024 * 1024), 1.0);
        assert_eq!(to_mb(0), 0.0);
    }
}

//! etcd client wrapper
//!
//! Wraps the gRPC client with the handful of operations the operator needs:
//! health probing, membership changes guarded by a cluster-wide lock, and the
//! revision/hash consistency probes.

use anyhow::{anyhow, Context, Result};
use etcd_client::{GetOptions, LockOptions};
use futures::future::join_all;
use std::collections::HashMap;
use std::time::Duration;

use super::{
    clients_urls, url_to_address, SecurityConfig, DEFAULT_DIAL_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

/// Lease TTL backing the join lock; it must outlive the longest join,
/// including the server start that happens while the lock is held.
const LOCK_LEASE_TTL_SECS: i64 = 300;

/// Health-probe retries used when probing a single member.
const MEMBER_HEALTH_RETRIES: usize = 5;
const MEMBER_HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// A member of the etcd cluster, as observed through the membership API.
#[derive(Debug, Clone)]
pub struct MemberStatus {
    pub id: u64,
    pub name: String,
    pub peer_address: String,
    pub healthy: bool,
}

pub struct Client {
    inner: etcd_client::Client,
    sc: SecurityConfig,
    single_endpoint: bool,
    auto_sync: bool,
}

impl Client {
    /// Connect to one or more members.
    ///
    /// `auto_sync` mirrors the balancer mode the caller wants: a multi-endpoint
    /// client used for cluster-wide probes should set it, while a pinned
    /// single-member client should not, so its probes fall back to
    /// serializable reads a lone member can answer.
    pub async fn new(addresses: &[String], sc: &SecurityConfig, auto_sync: bool) -> Result<Self> {
        Self::with_request_timeout(addresses, sc, auto_sync, DEFAULT_REQUEST_TIMEOUT).await
    }

    pub async fn with_request_timeout(
        addresses: &[String],
        sc: &SecurityConfig,
        auto_sync: bool,
        request_timeout: Duration,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(anyhow!("no etcd endpoints given"));
        }

        let endpoints = clients_urls(addresses, sc.tls_enabled());

        let mut options = etcd_client::ConnectOptions::new()
            .with_connect_timeout(DEFAULT_DIAL_TIMEOUT)
            .with_timeout(request_timeout);
        if sc.has_material() {
            options = options.with_tls(tls_options(sc)?);
        }

        let inner = etcd_client::Client::connect(&endpoints, Some(options))
            .await
            .context("failed to build etcd client")?;

        Ok(Self {
            inner,
            sc: sc.clone(),
            single_endpoint: addresses.len() == 1,
            auto_sync,
        })
    }

    /// Whether the cluster (or, for a pinned single-endpoint client, the
    /// member) answers a KV read.
    ///
    /// Linearizable reads go through raft, so a positive answer implies
    /// quorum. Permission-denied and compacted responses still reached
    /// quorum; the read was only rejected at the application layer.
    pub async fn is_healthy(&self, retries: usize, timeout: Duration) -> bool {
        let mut kv = self.inner.kv_client();

        for _ in 0..retries.max(1) {
            let options =
                (self.single_endpoint && !self.auto_sync).then(|| GetOptions::new().with_serializable());

            match tokio::time::timeout(timeout, kv.get("health", options)).await {
                Ok(Ok(_)) => return true,
                Ok(Err(e)) if is_permission_denied(&e) || is_compacted(&e) => return true,
                Ok(Err(_)) | Err(_) => {}
            }
        }

        false
    }

    /// List the cluster members and probe each one's health in parallel.
    /// Returns the members keyed by name and whether a quorum of them is
    /// healthy. Members that have not started yet (empty name) are skipped.
    pub async fn cluster_status(&self) -> Result<(HashMap<String, MemberStatus>, bool)> {
        let members = self.members().await?;

        let probes = members.iter().map(|member| {
            let sc = self.sc.clone();
            let address = member.peer_address.clone();
            async move { member_health(&address, &sc).await }
        });
        let healths = join_all(probes).await;

        let mut status = HashMap::with_capacity(members.len());
        let mut healthy_count = 0;
        for (mut member, healthy) in members.into_iter().zip(healths) {
            member.healthy = healthy;
            if healthy {
                healthy_count += 1;
            }
            status.insert(member.name.clone(), member);
        }

        let quorum = healthy_count >= super::quorum(status.len());
        Ok((status, quorum))
    }

    /// List the named members of the cluster.
    pub async fn members(&self) -> Result<Vec<MemberStatus>> {
        let mut cluster = self.inner.cluster_client();
        let resp = cluster
            .member_list()
            .await
            .context("failed to list members")?;

        Ok(resp
            .members()
            .iter()
            .filter(|member| !member.name().is_empty() && !member.peer_urls().is_empty())
            .map(|member| MemberStatus {
                id: member.id(),
                name: member.name().to_string(),
                peer_address: url_to_address(&member.peer_urls()[0]),
                healthy: false,
            })
            .collect())
    }

    /// Add a member under the cluster-wide `/eco/<name>/join` lock. The lock
    /// is returned to the caller and must be released once the new member has
    /// started (or the join was aborted).
    pub async fn add_member(&self, name: &str, peer_urls: Vec<String>) -> Result<(u64, LockGuard)> {
        let guard = self
            .lock(&format!("/eco/{}/join", name), DEFAULT_REQUEST_TIMEOUT)
            .await
            .context("unable to acquire lock to join cluster")?;

        let mut cluster = self.inner.cluster_client();
        match cluster.member_add(peer_urls, None).await {
            Ok(resp) => {
                let id = resp.member().map(|m| m.id()).unwrap_or_default();
                Ok((id, guard))
            }
            Err(e) => {
                guard.unlock().await;
                Err(anyhow!(e).context("failed to add member to cluster"))
            }
        }
    }

    /// Remove a member; removing an already-gone member is not an error.
    pub async fn member_remove(&self, id: u64) -> Result<()> {
        let mut cluster = self.inner.cluster_client();
        match cluster.member_remove(id).await {
            Ok(_) => Ok(()),
            Err(e) if is_member_not_found(&e) => Ok(()),
            Err(e) => Err(anyhow!(e).context("failed to remove member")),
        }
    }

    /// Acquire a lease-backed distributed lock.
    pub async fn lock(&self, name: &str, max_wait: Duration) -> Result<LockGuard> {
        let mut lease = self.inner.lease_client();
        let granted = lease
            .grant(LOCK_LEASE_TTL_SECS, None)
            .await
            .context("failed to grant lock lease")?;
        let lease_id = granted.id();

        let mut lock = self.inner.lock_client();
        let locked = tokio::time::timeout(
            max_wait,
            lock.lock(name, Some(LockOptions::new().with_lease(lease_id))),
        )
        .await;

        match locked {
            Ok(Ok(resp)) => Ok(LockGuard {
                client: self.inner.clone(),
                key: resp.key().to_vec(),
                lease_id,
            }),
            Ok(Err(e)) => {
                let _ = self.inner.lease_client().revoke(lease_id).await;
                Err(anyhow!(e).context(format!("failed to lock {:?}", name)))
            }
            Err(_) => {
                let _ = self.inner.lease_client().revoke(lease_id).await;
                Err(anyhow!("timed out waiting for lock {:?}", name))
            }
        }
    }

    /// Collect each member's KV revision and hash.
    pub async fn revisions_hashes(&self) -> Result<(HashMap<String, i64>, HashMap<String, i64>)> {
        let members = self.members().await?;

        let probes = members.iter().map(|member| {
            let sc = self.sc.clone();
            let name = member.name.clone();
            let address = member.peer_address.clone();
            async move {
                let result = async {
                    let client = Client::new(&[address], &sc, false).await?;
                    let mut maintenance = client.inner.maintenance_client();

                    let status = maintenance.status().await.context("failed to get status")?;
                    let revision = status
                        .header()
                        .map(|header| header.revision())
                        .unwrap_or_default();

                    let hash = maintenance
                        .hash_kv(0)
                        .await
                        .context("failed to get hashkv")?
                        .hash() as i64;

                    anyhow::Ok((revision, hash))
                }
                .await;
                (name, result)
            }
        });

        let mut revisions = HashMap::new();
        let mut hashes = HashMap::new();
        let mut errors = Vec::new();
        for (name, result) in join_all(probes).await {
            match result {
                Ok((revision, hash)) => {
                    revisions.insert(name.clone(), revision);
                    hashes.insert(name, hash);
                }
                Err(e) => errors.push(format!("[{}]: {}", name, e)),
            }
        }

        if !errors.is_empty() {
            return Err(anyhow!(errors.join(",")));
        }
        Ok((revisions, hashes))
    }

    /// Highest KV revision across the members.
    #[allow(dead_code)]
    pub async fn highest_revision(&self) -> Result<i64> {
        let (revisions, _) = self.revisions_hashes().await?;
        Ok(revisions.values().copied().max().unwrap_or_default())
    }

    /// Whether every member reports the same revision and KV hash. Retried
    /// for up to 15 seconds to let replication settle.
    #[allow(dead_code)]
    pub async fn is_consistent(&self) -> Result<()> {
        let mut last = None;

        for _ in 0..15 {
            match self.revisions_hashes().await {
                Ok((revisions, hashes)) => {
                    if same_values(&revisions) && same_values(&hashes) {
                        return Ok(());
                    }
                    last = Some((revisions, hashes));
                }
                Err(_) => {}
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(anyhow!("cluster is inconsistent: {:?}", last))
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut kv = self.inner.kv_client();
        let resp = kv.get(key, None).await.context("failed to get key")?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    pub async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut kv = self.inner.kv_client();
        kv.put(key, value, None).await.context("failed to put key")?;
        Ok(())
    }

    pub(crate) fn raw(&self) -> etcd_client::Client {
        self.inner.clone()
    }
}

/// Releases the join lock and its backing lease.
pub struct LockGuard {
    client: etcd_client::Client,
    key: Vec<u8>,
    lease_id: i64,
}

impl LockGuard {
    pub async fn unlock(self) {
        let mut lock = self.client.lock_client();
        if let Err(e) = lock.unlock(self.key).await {
            tracing::warn!(error = %e, "failed to release lock");
        }
        let mut lease = self.client.lease_client();
        if let Err(e) = lease.revoke(self.lease_id).await {
            tracing::debug!(error = %e, "failed to revoke lock lease");
        }
    }
}

/// Probe one member's health through a pinned client.
pub async fn member_health(address: &str, sc: &SecurityConfig) -> bool {
    match Client::new(&[address.to_string()], sc, false).await {
        Ok(client) => {
            client
                .is_healthy(MEMBER_HEALTH_RETRIES, MEMBER_HEALTH_TIMEOUT)
                .await
        }
        Err(e) => {
            tracing::debug!(address = %address, error = %e, "failed to create client for health check");
            false
        }
    }
}

fn tls_options(sc: &SecurityConfig) -> Result<etcd_client::TlsOptions> {
    let mut options = etcd_client::TlsOptions::new();

    let ca = sc.trusted_ca_file.as_ref().or(sc.ca_file.as_ref());
    if let Some(ca) = ca {
        let pem = std::fs::read(ca).with_context(|| format!("failed to read {:?}", ca))?;
        options = options.ca_certificate(etcd_client::Certificate::from_pem(pem));
    }

    if let (Some(cert), Some(key)) = (&sc.cert_file, &sc.key_file) {
        let cert_pem =
            std::fs::read(cert).with_context(|| format!("failed to read {:?}", cert))?;
        let key_pem = std::fs::read(key).with_context(|| format!("failed to read {:?}", key))?;
        options = options.identity(etcd_client::Identity::from_pem(cert_pem, key_pem));
    }

    Ok(options)
}

fn same_values(values: &HashMap<String, i64>) -> bool {
    let mut iter = values.values();
    match iter.next() {
        Some(first) => iter.all(|value| value == first),
        None => true,
    }
}

// The etcd server encodes application-level rejections as grpc status
// messages; these match the rpctypes strings.
fn is_permission_denied(err: &etcd_client::Error) -> bool {
    err.to_string().contains("permission denied")
}

fn is_compacted(err: &etcd_client::Error) -> bool {
    err.to_string().contains("required revision has been compacted")
}

fn is_member_not_found(err: &etcd_client::Error) -> bool {
    err.to_string().contains("member not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_values() {
        let mut values = HashMap::new();
        assert!(same_values(&values));

        values.insert("a".to_string(), 7);
        values.insert("b".to_string(), 7);
        assert!(same_values(&values));

        values.insert("c".to_string(), 8);
        assert!(!same_values(&values));
    }

    #[tokio::test]
    async fn test_new_requires_endpoints() {
        assert!(Client::new(&[], &SecurityConfig::default(), true)
            .await
            .is_err());
    }
}

//! Embedded etcd lifecycle and RPC plumbing
//!
//! This module wraps everything etcd-specific:
//! - Client wrapper for KV, membership, lock and maintenance RPCs
//! - Server lifecycle (seed, join, snapshot, restore, stop)
//! - Background member cleaner
//! - Shared configuration types and URL helpers

mod cleaner;
mod client;
mod server;
mod snapshot;

pub use client::{Client, MemberStatus};
pub use server::{Server, ServerConfig};
pub use snapshot::{db_status as snapshot_db_status, DbStatus};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CLIENT_PORT: u16 = 2379;
pub const DEFAULT_PEER_PORT: u16 = 2380;
pub const DEFAULT_METRICS_PORT: u16 = 2381;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_START_HEALTHY_THRESHOLD: Duration = Duration::from_secs(10);

/// Deadline for streaming a snapshot out of a member.
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(1800);

/// Typed etcd-level failure conditions the controller reacts to.
#[derive(Debug, Error)]
pub enum EtcdError {
    #[error("member revision older than the minimum desired revision")]
    RevisionTooOld,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// TLS material for one of etcd's transports (client or peer).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecurityConfig {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    #[serde(rename = "client-cert-auth")]
    pub cert_auth: bool,
    pub trusted_ca_file: Option<PathBuf>,
    pub auto_tls: bool,
}

impl SecurityConfig {
    /// Whether any explicit TLS material is configured.
    pub fn has_material(&self) -> bool {
        self.ca_file.is_some()
            || self.cert_file.is_some()
            || self.key_file.is_some()
            || self.trusted_ca_file.is_some()
    }

    pub fn tls_enabled(&self) -> bool {
        self.auto_tls || self.has_material()
    }
}

/// Configuration of the underlying etcd server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EtcdConfig {
    pub advertise_address: Option<String>,
    pub data_dir: PathBuf,
    pub client_transport_security: SecurityConfig,
    pub peer_transport_security: SecurityConfig,
    pub backend_quota: i64,
    pub auto_compaction_mode: Option<String>,
    pub auto_compaction_retention: Option<String>,
    pub init_acl: Option<AclConfig>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            advertise_address: None,
            data_dir: PathBuf::from("/var/lib/etcd"),
            client_transport_security: SecurityConfig::default(),
            peer_transport_security: SecurityConfig {
                auto_tls: true,
                ..SecurityConfig::default()
            },
            backend_quota: 0,
            auto_compaction_mode: None,
            auto_compaction_retention: None,
            init_acl: None,
        }
    }
}

/// Initial ACL state reconciled by the seeder once the cluster reports OK.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct AclConfig {
    #[serde(default)]
    pub root_password: Option<String>,
    #[serde(default)]
    pub roles: Vec<AclRole>,
    #[serde(default)]
    pub users: Vec<AclUser>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AclRole {
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<AclPermission>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AclPermission {
    pub mode: String,
    pub key: String,
    #[serde(default)]
    pub prefix: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AclUser {
    pub name: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Majority threshold for a cluster of `total` members.
pub fn quorum(total: usize) -> usize {
    total / 2 + 1
}

pub fn scheme(tls_enabled: bool) -> &'static str {
    if tls_enabled {
        "https"
    } else {
        "http"
    }
}

pub fn client_url(address: &str, tls_enabled: bool) -> String {
    format!("{}://{}:{}", scheme(tls_enabled), address, DEFAULT_CLIENT_PORT)
}

pub fn peer_url(address: &str, tls_enabled: bool) -> String {
    format!("{}://{}:{}", scheme(tls_enabled), address, DEFAULT_PEER_PORT)
}

pub fn clients_urls(addresses: &[String], tls_enabled: bool) -> Vec<String> {
    addresses
        .iter()
        .map(|address| client_url(address, tls_enabled))
        .collect()
}

/// Builds the `--initial-cluster` flag value: `name=peer_url` pairs.
pub fn initial_cluster(peers: &[(String, String)], tls_enabled: bool) -> String {
    peers
        .iter()
        .map(|(name, address)| format!("{}={}", name, peer_url(address, tls_enabled)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Extracts the host out of a peer or client URL.
pub fn url_to_address(url: &str) -> String {
    let stripped = url
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    match stripped.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => stripped.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_arithmetic() {
        let expected = [(1, 1), (2, 2), (3, 2), (4, 3), (5, 3), (6, 4), (7, 4), (8, 5), (9, 5)];
        for (total, threshold) in expected {
            assert_eq!(quorum(total), threshold, "quorum({})", total);
        }
    }

    #[test]
    fn test_urls() {
        assert_eq!(client_url("10.0.0.1", false), "http://10.0.0.1:2379");
        assert_eq!(client_url("10.0.0.1", true), "https://10.0.0.1:2379");
        assert_eq!(peer_url("10.0.0.1", false), "http://10.0.0.1:2380");
        assert_eq!(url_to_address("https://10.0.0.1:2380"), "10.0.0.1");
        assert_eq!(url_to_address("http://node-0.etcd.svc:2380"), "node-0.etcd.svc");
    }

    #[test]
    fn test_initial_cluster() {
        let peers = vec![
            ("a".to_string(), "10.0.0.1".to_string()),
            ("b".to_string(), "10.0.0.2".to_string()),
        ];
        assert_eq!(
            initial_cluster(&peers, false),
            "a=http://10.0.0.1:2380,b=http://10.0.0.2:2380"
        );
    }

    #[test]
    fn test_security_config_tls_enabled() {
        assert!(!SecurityConfig::default().tls_enabled());
        assert!(SecurityConfig {
            auto_tls: true,
            ..SecurityConfig::default()
        }
        .tls_enabled());
        assert!(SecurityConfig {
            cert_file: Some(PathBuf::from("/etc/etcd/tls/server.crt")),
            ..SecurityConfig::default()
        }
        .tls_enabled());
    }
}

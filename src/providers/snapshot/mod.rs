//! Snapshot stores
//!
//! A snapshot store keeps durable, out-of-band backups of the etcd keyspace:
//! - `file`: local filesystem directory
//! - `s3`: object storage bucket
//! - `etcd`: read-only view over a local etcd data directory
//!
//! All variants share the same filename grammar, which is the sole source of
//! truth for revision ordering: `<name>_<16-hex-revision>_etcd.backup`.

pub mod etcd;
pub mod file;
pub mod s3;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;

const SNAPSHOT_FILENAME_SUFFIX: &str = "etcd.backup";

static SNAPSHOT_FILENAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+)_([0-9a-f]{16})_etcd\.backup$").unwrap());

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("no snapshot available")]
    NoSnapshot,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Descriptor of one durable backup.
pub struct Metadata {
    /// Name of the instance that produced the backup
    pub name: String,
    /// KV revision at capture time
    pub revision: i64,
    /// Size in bytes, set by `Provider::save`
    pub size: i64,
    /// Store the backup lives in, used to materialize it again
    pub source: Option<Arc<dyn Provider>>,
}

impl Metadata {
    pub fn new(name: String, revision: i64) -> Self {
        Self {
            name,
            revision,
            size: 0,
            source: None,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn Provider>) -> Self {
        self.source = Some(source);
        self
    }

    /// Parses `<name>_<hex16>_etcd.backup` back into a descriptor.
    pub fn from_filename(filename: &str) -> Result<Self, SnapshotError> {
        let captures = SNAPSHOT_FILENAME_RE
            .captures(filename)
            .ok_or_else(|| anyhow::anyhow!("invalid snapshot filename {:?}", filename))?;
        let revision = i64::from_str_radix(&captures[2], 16)
            .map_err(|e| anyhow::anyhow!("invalid revision in {:?}: {}", filename, e))?;

        Ok(Self::new(captures[1].to_string(), revision))
    }

    pub fn filename(&self) -> String {
        snapshot_name(self.revision, &self.name)
    }
}

impl Clone for Metadata {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            revision: self.revision,
            size: self.size,
            source: self.source.clone(),
        }
    }
}

impl fmt::Debug for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metadata")
            .field("name", &self.name)
            .field("revision", &self.revision)
            .field("size", &self.size)
            .finish()
    }
}

/// A pluggable snapshot store.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Write a backup atomically under its revision-derived filename; sets
    /// `metadata.size` on success.
    async fn save(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &mut Metadata,
    ) -> Result<(), SnapshotError>;

    /// The single highest-revision backup, or `SnapshotError::NoSnapshot`.
    async fn info(&self) -> Result<Metadata, SnapshotError>;

    /// Materialize the backup to a local file the restore path can consume.
    /// The returned flag asks the caller to delete the file afterwards.
    async fn get(&self, metadata: &Metadata) -> Result<(PathBuf, bool), SnapshotError>;

    /// Delete backups whose modification time is older than `ttl`.
    async fn purge(&self, ttl: Duration) -> Result<(), SnapshotError>;
}

pub fn snapshot_name(revision: i64, name: &str) -> String {
    format!("{}_{:016x}_{}", name, revision, SNAPSHOT_FILENAME_SUFFIX)
}

pub fn is_snapshot(name: &str) -> bool {
    name.ends_with(SNAPSHOT_FILENAME_SUFFIX)
}

/// Picks the highest-revision valid snapshot filename out of `names`.
pub fn latest_from_names(names: &[String]) -> Result<Metadata, SnapshotError> {
    let mut latest: Option<Metadata> = None;

    for name in names {
        if !is_snapshot(name) {
            continue;
        }

        let meta = match Metadata::from_filename(name) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(file = %name, error = %e, "failed to parse revision from backup");
                continue;
            }
        };

        if latest.as_ref().map_or(true, |l| meta.revision > l.revision) {
            latest = Some(meta);
        }
    }

    latest.ok_or(SnapshotError::NoSnapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_round_trip() {
        for (name, rev) in [("i-0123456789abcdef0", 42i64), ("eco-1", 0), ("pod_0", i64::MAX)] {
            let filename = snapshot_name(rev, name);
            let meta = Metadata::from_filename(&filename).unwrap();
            assert_eq!(meta.name, name);
            assert_eq!(meta.revision, rev);
            assert_eq!(meta.filename(), filename);
        }
    }

    #[test]
    fn test_filename_format() {
        assert_eq!(snapshot_name(0x2a, "node-a"), "node-a_000000000000002a_etcd.backup");
    }

    #[test]
    fn test_latest_from_names() {
        let names = vec![
            snapshot_name(3, "a"),
            snapshot_name(0x2a, "c"),
            snapshot_name(7, "b"),
            "unrelated.txt".to_string(),
            "broken_zzzz_etcd.backup".to_string(),
        ];
        let latest = latest_from_names(&names).unwrap();
        assert_eq!(latest.name, "c");
        assert_eq!(latest.revision, 0x2a);
    }

    #[test]
    fn test_latest_from_names_empty() {
        assert!(matches!(
            latest_from_names(&[]),
            Err(SnapshotError::NoSnapshot)
        ));
        assert!(matches!(
            latest_from_names(&["README.md".to_string()]),
            Err(SnapshotError::NoSnapshot)
        ));
    }

    #[test]
    fn test_is_snapshot() {
        assert!(is_snapshot("a_0000000000000001_etcd.backup"));
        assert!(!is_snapshot("a_0000000000000001_etcd.bak"));
    }
}

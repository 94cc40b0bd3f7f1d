//! Local data-directory snapshot source
//!
//! Exposes the boltdb file of a local etcd data directory as a read-only
//! snapshot store. Saving and purging are not supported; the store exists so
//! the seeder can compare its on-disk state against the external store and
//! restore from whichever is newer. Must only be consulted while the engine
//! is stopped.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;

use super::{Metadata, Provider, SnapshotError};
use crate::etcd::snapshot_db_status;
use crate::providers::parse_params;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct EtcdDirParams {
    data_dir: PathBuf,
}

impl Default for EtcdDirParams {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/etcd"),
        }
    }
}

/// Read-only snapshot view over a local etcd data directory.
pub struct EtcdDirProvider {
    data_dir: PathBuf,
    name: String,
}

impl EtcdDirProvider {
    pub fn new(data_dir: PathBuf, name: String) -> Self {
        Self { data_dir, name }
    }

    pub fn from_params(params: &HashMap<String, serde_yml::Value>) -> anyhow::Result<Self> {
        let params: EtcdDirParams = parse_params(params).context("invalid configuration")?;
        Ok(Self::new(params.data_dir, "local".to_string()))
    }

    fn db_path(&self) -> PathBuf {
        self.data_dir.join("member/snap/db")
    }
}

#[async_trait]
impl Provider for EtcdDirProvider {
    async fn save(
        &self,
        _stream: &mut (dyn AsyncRead + Send + Unpin),
        _metadata: &mut Metadata,
    ) -> Result<(), SnapshotError> {
        Err(SnapshotError::Other(anyhow!(
            "the etcd data-dir store is read-only"
        )))
    }

    async fn info(&self) -> Result<Metadata, SnapshotError> {
        let db_path = self.db_path();
        if !db_path.exists() {
            return Err(SnapshotError::NoSnapshot);
        }

        let status = snapshot_db_status(&db_path)
            .await
            .context("failed to read data-dir snapshot status")
            .map_err(SnapshotError::Other)?;

        let mut meta = Metadata::new(self.name.clone(), status.revision);
        meta.size = status.total_size;
        Ok(meta)
    }

    async fn get(&self, _metadata: &Metadata) -> Result<(PathBuf, bool), SnapshotError> {
        let db_path = self.db_path();
        if !db_path.exists() {
            return Err(SnapshotError::NoSnapshot);
        }

        // Copy the boltdb out of the data directory: the restore wipes the
        // directory that contains it.
        let path = tempfile::NamedTempFile::new()
            .context("failed to create temporary file")
            .and_then(|f| {
                f.into_temp_path()
                    .keep()
                    .context("failed to keep temporary file")
            })
            .map_err(SnapshotError::Other)?;

        if let Err(e) = tokio::fs::copy(&db_path, &path).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(SnapshotError::Other(
                anyhow!(e).context(format!("failed to copy {:?}", db_path)),
            ));
        }

        Ok((path, true))
    }

    async fn purge(&self, _ttl: Duration) -> Result<(), SnapshotError> {
        Err(SnapshotError::Other(anyhow!(
            "the etcd data-dir store is read-only"
        )))
    }
}

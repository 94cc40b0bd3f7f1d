//! Filesystem snapshot store
//!
//! Backups live as flat files under a configured directory, mode 0600 with a
//! 0700 parent. Saves are atomic: stream to a temporary file in the same
//! directory, fsync, then rename.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;

use super::{latest_from_names, Metadata, Provider, SnapshotError};
use crate::providers::parse_params;

const FILE_MODE: u32 = 0o600;
const DIR_MODE: u32 = 0o700;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct FileParams {
    dir: PathBuf,
}

impl Default for FileParams {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/snapshots"),
        }
    }
}

/// Snapshot store backed by a local directory.
pub struct FileProvider {
    dir: PathBuf,
}

impl FileProvider {
    pub fn new(params: &HashMap<String, serde_yml::Value>) -> anyhow::Result<Self> {
        let params: FileParams = parse_params(params).context("invalid configuration")?;

        std::fs::create_dir_all(&params.dir).with_context(|| {
            format!(
                "invalid configuration: failed to create directory {:?}",
                params.dir
            )
        })?;
        std::fs::set_permissions(&params.dir, std::fs::Permissions::from_mode(DIR_MODE))
            .with_context(|| format!("failed to set permissions on {:?}", params.dir))?;

        Ok(Self { dir: params.dir })
    }

    async fn list_filenames(&self) -> Result<Vec<String>, SnapshotError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to list dir {:?}", self.dir))
            .map_err(SnapshotError::Other)?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to read dir entry")
            .map_err(SnapshotError::Other)?
        {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }

        Ok(names)
    }
}

#[async_trait]
impl Provider for FileProvider {
    async fn save(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &mut Metadata,
    ) -> Result<(), SnapshotError> {
        let final_path = self.dir.join(metadata.filename());
        let tmp_path = self.dir.join(format!(".{}.tmp", metadata.filename()));

        let mut tmp = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .mode(FILE_MODE)
            .open(&tmp_path)
            .await
            .with_context(|| format!("failed to create temporary file {:?}", tmp_path))
            .map_err(SnapshotError::Other)?;

        let written = match tokio::io::copy(stream, &mut tmp).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(SnapshotError::Other(
                    anyhow!(e).context("failed to write snapshot"),
                ));
            }
        };

        if let Err(e) = tmp.sync_all().await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SnapshotError::Other(anyhow!(e).context("failed to sync snapshot")));
        }
        drop(tmp);

        if let Err(e) = tokio::fs::rename(&tmp_path, &final_path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(SnapshotError::Other(
                anyhow!(e).context(format!("failed to rename snapshot to {:?}", final_path)),
            ));
        }

        metadata.size = written as i64;
        Ok(())
    }

    async fn info(&self) -> Result<Metadata, SnapshotError> {
        let names = self.list_filenames().await?;
        let mut meta = latest_from_names(&names)?;

        if let Ok(st) = tokio::fs::metadata(self.dir.join(meta.filename())).await {
            meta.size = st.len() as i64;
        }

        Ok(meta)
    }

    async fn get(&self, metadata: &Metadata) -> Result<(PathBuf, bool), SnapshotError> {
        let path = self.dir.join(metadata.filename());
        if !path.exists() {
            return Err(SnapshotError::NoSnapshot);
        }
        Ok((path, false))
    }

    async fn purge(&self, ttl: Duration) -> Result<(), SnapshotError> {
        let names = self.list_filenames().await?;

        for name in names {
            let path = self.dir.join(&name);
            let modified = match tokio::fs::metadata(&path)
                .await
                .and_then(|st| st.modified())
            {
                Ok(modified) => modified,
                Err(_) => continue,
            };

            let age = modified.elapsed().unwrap_or_default();
            if age > ttl {
                tracing::info!(file = %name, ttl = ?ttl, "purging snapshot file older than ttl");
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(file = %name, error = %e, "failed to remove snapshot file");
                }
            }
        }

        Ok(())
    }
}

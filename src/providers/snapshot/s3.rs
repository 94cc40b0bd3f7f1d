//! S3 snapshot store
//!
//! Backups are stored at the bucket root, one object per snapshot, keyed by
//! the shared filename grammar. A single `PutObject` is atomic at the key
//! level, so concurrent saves of the same revision are idempotent.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncRead;

use super::{latest_from_names, Metadata, Provider, SnapshotError};
use crate::providers::parse_params;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
struct S3Params {
    bucket: String,
}

/// Snapshot store backed by an S3 bucket.
pub struct S3Provider {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Provider {
    pub async fn new(params: &HashMap<String, serde_yml::Value>) -> anyhow::Result<Self> {
        let params: S3Params = parse_params(params).context("invalid configuration")?;
        if params.bucket.is_empty() {
            return Err(anyhow!("invalid configuration: bucket name is missing"));
        }

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&sdk_config);

        let provider = Self {
            client,
            bucket: params.bucket,
        };

        // Probe the bucket once so misconfiguration is fatal at startup.
        if let Err(SnapshotError::Other(e)) = provider.info().await {
            return Err(e.context("failed to validate s3 configuration"));
        }

        Ok(provider)
    }

}

#[async_trait]
impl Provider for S3Provider {
    async fn save(
        &self,
        stream: &mut (dyn AsyncRead + Send + Unpin),
        metadata: &mut Metadata,
    ) -> Result<(), SnapshotError> {
        let key = metadata.filename();

        // Spool to a local file first: the upload needs a known length, and a
        // failed stream must not leave a partial object behind.
        let spool = tempfile::NamedTempFile::new()
            .context("failed to create spool file")
            .map_err(SnapshotError::Other)?
            .into_temp_path();

        let mut file = tokio::fs::File::create(&spool)
            .await
            .context("failed to open spool file")
            .map_err(SnapshotError::Other)?;
        let written = tokio::io::copy(stream, &mut file)
            .await
            .context("failed to spool snapshot")
            .map_err(SnapshotError::Other)?;
        file.sync_all()
            .await
            .context("failed to sync spool file")
            .map_err(SnapshotError::Other)?;
        drop(file);

        let body = ByteStream::from_path(&spool)
            .await
            .context("failed to read spool file")
            .map_err(SnapshotError::Other)?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("failed to upload s3 object {:?}", key))
            .map_err(SnapshotError::Other)?;

        metadata.size = written as i64;
        Ok(())
    }

    async fn info(&self) -> Result<Metadata, SnapshotError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("failed to list s3 objects in {:?}", self.bucket))
            .map_err(SnapshotError::Other)?;

        let keys: Vec<String> = resp
            .contents()
            .iter()
            .filter_map(|object| object.key().map(String::from))
            .collect();

        let mut meta = latest_from_names(&keys)?;
        if let Some(object) = resp
            .contents()
            .iter()
            .find(|object| object.key() == Some(meta.filename().as_str()))
        {
            meta.size = object.size().unwrap_or_default();
        }

        Ok(meta)
    }

    async fn get(&self, metadata: &Metadata) -> Result<(PathBuf, bool), SnapshotError> {
        let key = metadata.filename();

        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("failed to get s3 object {:?}", key))
            .map_err(SnapshotError::Other)?;

        let path = tempfile::NamedTempFile::new()
            .context("failed to create temporary file")
            .and_then(|f| f.into_temp_path().keep().context("failed to keep temporary file"))
            .map_err(SnapshotError::Other)?;

        let mut file = tokio::fs::File::create(&path)
            .await
            .context("failed to open temporary file")
            .map_err(SnapshotError::Other)?;
        let mut body = resp.body.into_async_read();
        if let Err(e) = tokio::io::copy(&mut body, &mut file).await {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(SnapshotError::Other(
                anyhow!(e).context(format!("failed to download s3 object {:?}", key)),
            ));
        }

        Ok((path, true))
    }

    async fn purge(&self, ttl: Duration) -> Result<(), SnapshotError> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("failed to list s3 objects in {:?}", self.bucket))
            .map_err(SnapshotError::Other)?;

        let now = chrono::Utc::now().timestamp();
        for object in resp.contents() {
            let (key, modified) = match (object.key(), object.last_modified()) {
                (Some(key), Some(modified)) => (key, modified),
                _ => continue,
            };

            if now.saturating_sub(modified.secs()) > ttl.as_secs() as i64 {
                tracing::info!(key = %key, ttl = ?ttl, "purging snapshot object older than ttl");
                if let Err(e) = self
                    .client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                {
                    tracing::warn!(key = %key, error = %e, "failed to remove s3 object");
                }
            }
        }

        Ok(())
    }
}

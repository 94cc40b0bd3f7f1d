//! Snapshot capture and offline restore
//!
//! Capture streams the boltdb image out of a running member over the
//! maintenance API; restore rebuilds a fresh single-member data directory
//! from a backup file with `etcdutl`.

use anyhow::{anyhow, Context, Result};
use etcd_client::GetOptions;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::client::Client;
use super::{peer_url, EtcdError, SecurityConfig, DEFAULT_SNAPSHOT_TIMEOUT};

/// The engine's default initial-cluster token, matched by the restore so the
/// restored member forms a cluster of its own.
const INITIAL_CLUSTER_TOKEN: &str = "etcd-cluster";

/// Stream a snapshot of the member at `address` into a spool file.
///
/// The member's current revision is read first with a serializable get, so a
/// member that has lost quorum can still be backed up. Returns
/// `EtcdError::RevisionTooOld` without capturing anything when the member has
/// nothing newer than `min_revision`.
pub async fn take(
    address: &str,
    sc: &SecurityConfig,
    min_revision: i64,
) -> Result<(PathBuf, i64), EtcdError> {
    let client = Client::with_request_timeout(
        &[address.to_string()],
        sc,
        false,
        DEFAULT_SNAPSHOT_TIMEOUT,
    )
    .await?;
    let mut raw = client.raw();

    let resp = raw
        .kv_client()
        .get("/", Some(GetOptions::new().with_serializable()))
        .await
        .context("failed to get revision from member")?;
    let revision = resp
        .header()
        .map(|header| header.revision())
        .unwrap_or_default();

    ensure_newer(revision, min_revision)?;

    let mut stream = raw
        .maintenance_client()
        .snapshot()
        .await
        .context("failed to receive snapshot")?;

    let spool = tempfile::NamedTempFile::new()
        .context("failed to create spool file")
        .and_then(|f| {
            f.into_temp_path()
                .keep()
                .context("failed to keep spool file")
        })?;

    let mut file = tokio::fs::File::create(&spool)
        .await
        .context("failed to open spool file")?;

    loop {
        let message = match stream.message().await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                let _ = tokio::fs::remove_file(&spool).await;
                return Err(EtcdError::Other(
                    anyhow!(e).context("failed to receive snapshot"),
                ));
            }
        };
        if let Err(e) = file.write_all(message.blob()).await {
            let _ = tokio::fs::remove_file(&spool).await;
            return Err(EtcdError::Other(
                anyhow!(e).context("failed to write snapshot"),
            ));
        }
    }

    file.sync_all()
        .await
        .context("failed to sync snapshot spool")?;

    Ok((spool, revision))
}

/// Rebuild `data_dir` from the backup file at `snapshot_path`.
///
/// The resulting directory belongs to a brand-new single-member cluster; the
/// member starts with `cluster-state = new` afterwards. Hash checking is
/// skipped because streamed backups carry no integrity footer.
pub async fn restore(
    snapshot_path: &Path,
    name: &str,
    data_dir: &Path,
    private_address: &str,
    peer_sc: &SecurityConfig,
) -> Result<()> {
    let peer = peer_url(private_address, peer_sc.tls_enabled());

    remove_dir_if_exists(data_dir).await?;

    let output = Command::new("etcdutl")
        .arg("snapshot")
        .arg("restore")
        .arg(snapshot_path)
        .arg("--name")
        .arg(name)
        .arg("--initial-cluster")
        .arg(format!("{}={}", name, peer))
        .arg("--initial-cluster-token")
        .arg(INITIAL_CLUSTER_TOKEN)
        .arg("--initial-advertise-peer-urls")
        .arg(&peer)
        .arg("--data-dir")
        .arg(data_dir)
        .arg("--skip-hash-check")
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run etcdutl")?;

    if !output.status.success() {
        return Err(anyhow!(
            "etcdutl failed to restore: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    Ok(())
}

/// Status of an on-disk boltdb file, as reported by `etcdutl`.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DbStatus {
    pub revision: i64,
    #[serde(rename = "totalSize")]
    pub total_size: i64,
}

/// Read the revision and size of an on-disk boltdb file.
pub async fn db_status(db_path: &Path) -> Result<DbStatus> {
    let output = Command::new("etcdutl")
        .arg("snapshot")
        .arg("status")
        .arg(db_path)
        .arg("-w")
        .arg("json")
        .stdin(Stdio::null())
        .output()
        .await
        .context("failed to run etcdutl")?;

    if !output.status.success() {
        return Err(anyhow!(
            "etcdutl failed to read snapshot status: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    serde_json::from_slice(&output.stdout).context("failed to parse etcdutl status output")
}

/// A snapshot is only worth taking when the member has moved past what the
/// store already holds.
fn ensure_newer(revision: i64, min_revision: i64) -> Result<(), EtcdError> {
    if revision <= min_revision {
        return Err(EtcdError::RevisionTooOld);
    }
    Ok(())
}

pub(super) async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow!(e).context(format!("failed to remove {:?}", dir))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_guard() {
        assert!(matches!(ensure_newer(5, 5), Err(EtcdError::RevisionTooOld)));
        assert!(matches!(ensure_newer(4, 5), Err(EtcdError::RevisionTooOld)));
        assert!(matches!(ensure_newer(0, 0), Err(EtcdError::RevisionTooOld)));
        assert!(ensure_newer(6, 5).is_ok());
        assert!(ensure_newer(1, 0).is_ok());
    }

    #[test]
    fn test_db_status_parsing() {
        let out = r#"{"hash":3700121941,"revision":42,"totalKey":3,"totalSize":24576}"#;
        let status: DbStatus = serde_json::from_str(out).unwrap();
        assert_eq!(status.revision, 42);
        assert_eq!(status.total_size, 24576);
    }

    #[tokio::test]
    async fn test_remove_dir_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data");
        std::fs::create_dir(&target).unwrap();
        std::fs::write(target.join("db"), b"x").unwrap();

        remove_dir_if_exists(&target).await.unwrap();
        assert!(!target.exists());

        // Removing a directory that is already gone is fine.
        remove_dir_if_exists(&target).await.unwrap();
    }
}

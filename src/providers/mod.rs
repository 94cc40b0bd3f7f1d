//! Pluggable providers
//!
//! Two provider families exist: auto-scaling group providers (fleet
//! discovery) and snapshot providers (durable backups). Variants are wired
//! into explicit registries built at startup and selected by name from the
//! configuration; an unknown name is fatal.

pub mod asg;
pub mod snapshot;

use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{AsgConfig, SnapshotConfig};

pub const ASG_PROVIDERS: &[&str] = &["aws", "docker", "sts"];
pub const SNAPSHOT_PROVIDERS: &[&str] = &["file", "s3", "etcd"];

/// Build the configured auto-scaling group provider.
pub async fn new_asg_provider(config: &AsgConfig) -> Result<Box<dyn asg::Provider>> {
    if config.provider.is_empty() {
        return Err(anyhow!("no auto-scaling group provider configuration given"));
    }

    match config.provider.as_str() {
        "aws" => Ok(Box::new(asg::aws::AwsProvider::new(&config.params).await?)),
        "docker" => Ok(Box::new(asg::docker::DockerProvider::new(&config.params)?)),
        "sts" => Ok(Box::new(asg::sts::StsProvider::new(&config.params)?)),
        other => Err(anyhow!(
            "unknown auto-scaling group provider {:?}, available providers: {:?}",
            other,
            ASG_PROVIDERS
        )),
    }
}

/// Build the configured snapshot provider, if any.
pub async fn new_snapshot_provider(
    config: &SnapshotConfig,
) -> Result<Option<Arc<dyn snapshot::Provider>>> {
    if config.provider.is_empty() {
        return Ok(None);
    }

    let provider: Arc<dyn snapshot::Provider> = match config.provider.as_str() {
        "file" => Arc::new(snapshot::file::FileProvider::new(&config.params)?),
        "s3" => Arc::new(snapshot::s3::S3Provider::new(&config.params).await?),
        "etcd" => Arc::new(snapshot::etcd::EtcdDirProvider::from_params(&config.params)?),
        other => {
            return Err(anyhow!(
                "unknown snapshot provider {:?}, available providers: {:?}",
                other,
                SNAPSHOT_PROVIDERS
            ))
        }
    };

    Ok(Some(provider))
}

/// Re-parse the free-form provider params into a typed config.
pub fn parse_params<T: DeserializeOwned>(params: &HashMap<String, serde_yml::Value>) -> Result<T> {
    let value = serde_yml::to_value(params).context("failed to serialize provider params")?;
    serde_yml::from_value(value).context("failed to parse provider params")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "kebab-case", default)]
    struct TestParams {
        size: usize,
        name_filter: String,
    }

    impl Default for TestParams {
        fn default() -> Self {
            Self {
                size: 3,
                name_filter: "eco-".to_string(),
            }
        }
    }

    #[test]
    fn test_parse_params() {
        let mut params = HashMap::new();
        params.insert("size".to_string(), serde_yml::Value::from(5));
        let parsed: TestParams = parse_params(&params).unwrap();
        assert_eq!(parsed.size, 5);
        assert_eq!(parsed.name_filter, "eco-");
    }

    #[tokio::test]
    async fn test_unknown_asg_provider() {
        let config = AsgConfig {
            provider: "gce".to_string(),
            params: HashMap::new(),
        };
        let err = new_asg_provider(&config).await.unwrap_err().to_string();
        assert!(err.contains("unknown auto-scaling group provider"));
        assert!(err.contains("aws"));
    }

    #[tokio::test]
    async fn test_missing_asg_provider() {
        assert!(new_asg_provider(&AsgConfig::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_provider_disabled() {
        let config = SnapshotConfig::default();
        assert!(new_snapshot_provider(&config).await.unwrap().is_none());
    }
}

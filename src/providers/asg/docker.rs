//! Docker auto-scaling group provider
//!
//! Emulates an elastic group out of local containers whose name matches a
//! prefix filter. The local instance is the container whose ID contains the
//! hostname; the desired size comes from static configuration.

#![allow(deprecated)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::Docker;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{GroupStatus, Instance, Provider};
use crate::providers::parse_params;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct DockerParams {
    size: usize,
    name_filter: String,
    socket_path: PathBuf,
}

impl Default for DockerParams {
    fn default() -> Self {
        Self {
            size: 3,
            name_filter: "eco-".to_string(),
            socket_path: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

pub struct DockerProvider {
    client: Docker,
    size: usize,
    name_filter: String,
}

impl DockerProvider {
    pub fn new(params: &HashMap<String, serde_yml::Value>) -> Result<Self> {
        let params: DockerParams = parse_params(params).context("invalid configuration")?;

        let client = Docker::connect_with_unix(
            &params.socket_path.to_string_lossy(),
            120,
            bollard::API_DEFAULT_VERSION,
        )
        .with_context(|| format!("failed to connect to Docker at {:?}", params.socket_path))?;

        Ok(Self {
            client,
            size: params.size,
            name_filter: params.name_filter,
        })
    }

    async fn inspect(&self, name: &str) -> Result<(String, Instance)> {
        let info = self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("failed to inspect container {:?}", name))?;

        let id = info
            .id
            .ok_or_else(|| anyhow!("container {:?} has no id", name))?;
        let container_name = info
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .ok_or_else(|| anyhow!("container {:?} has no name", name))?;

        let settings = info
            .network_settings
            .ok_or_else(|| anyhow!("container {:?} has no network settings", name))?;
        let from_networks = settings
            .networks
            .as_ref()
            .and_then(|networks| networks.values().find_map(|n| n.ip_address.clone()))
            .filter(|ip| !ip.is_empty());
        let address = from_networks
            .or(settings.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| anyhow!("container {:?} has no ip address", name))?;

        Ok((
            id,
            Instance {
                name: container_name,
                address,
            },
        ))
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn group_status(&self) -> Result<GroupStatus> {
        let hostname = nix::unistd::gethostname()
            .context("failed to read hostname")?
            .to_string_lossy()
            .to_string();

        let mut filters = HashMap::new();
        filters.insert("name", vec![self.name_filter.as_str()]);

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                filters,
                ..Default::default()
            }))
            .await
            .context("failed to list containers")?;

        let names: Vec<String> = containers
            .into_iter()
            .filter_map(|c| c.names)
            .flatten()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect();

        let mut instances = Vec::new();
        let mut self_instance = None;

        for name in names {
            let (id, instance) = self.inspect(&name).await?;
            if id.contains(&hostname) {
                self_instance = Some(instance.clone());
            }
            instances.push(instance);
        }

        tracing::debug!(
            discovered = instances.len(),
            desired = self.size,
            "discovered group replicas"
        );

        let self_instance = self_instance
            .ok_or_else(|| anyhow!("no container matches the local hostname {:?}", hostname))?;

        Ok(GroupStatus {
            instances,
            self_instance,
            size: self.size,
        })
    }
}

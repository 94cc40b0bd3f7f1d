//! Stateful-set auto-scaling group provider
//!
//! Discovers the fleet through the Kubernetes API: the desired size is the
//! stateful set's replica count and the instances are its pods. The local
//! instance is identified by the pod hostname.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use serde::Deserialize;
use std::collections::HashMap;

use super::{GroupStatus, Instance, Provider};
use crate::providers::parse_params;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
struct StsParams {
    statefulset_name: Option<String>,
    namespace: Option<String>,
}

pub struct StsProvider {
    statefulset_name: String,
    namespace: String,
    self_name: String,
    self_address: String,
}

impl StsProvider {
    pub fn new(params: &HashMap<String, serde_yml::Value>) -> Result<Self> {
        let params: StsParams = parse_params(params).context("invalid configuration")?;

        Ok(Self {
            statefulset_name: match params.statefulset_name {
                Some(name) => name,
                None => env_or_err("STATEFULSET_NAME")?,
            },
            namespace: match params.namespace {
                Some(namespace) => namespace,
                None => env_or_err("STATEFULSET_NAMESPACE")?,
            },
            self_name: env_or_err("HOSTNAME")?,
            self_address: env_or_err("POD_IP")?,
        })
    }
}

#[async_trait]
impl Provider for StsProvider {
    async fn group_status(&self) -> Result<GroupStatus> {
        let client = Client::try_default()
            .await
            .context("failed to build in-cluster kubernetes client")?;

        tracing::debug!(
            pod = %self.self_name,
            statefulset = %self.statefulset_name,
            namespace = %self.namespace,
            "resolving group from statefulset"
        );

        let statefulsets: Api<StatefulSet> = Api::namespaced(client.clone(), &self.namespace);
        let statefulset = statefulsets
            .get(&self.statefulset_name)
            .await
            .with_context(|| format!("failed to get statefulset {:?}", self.statefulset_name))?;

        let spec = statefulset
            .spec
            .as_ref()
            .ok_or_else(|| anyhow!("statefulset {:?} has no spec", self.statefulset_name))?;
        let size = spec.replicas.unwrap_or(0).max(0) as usize;

        let selector = spec
            .selector
            .match_labels
            .as_ref()
            .map(|labels| {
                labels
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .ok_or_else(|| anyhow!("statefulset {:?} has no label selector", self.statefulset_name))?;

        let pods: Api<Pod> = Api::namespaced(client, &self.namespace);
        let replicas = pods
            .list(&ListParams::default().labels(&selector))
            .await
            .context("failed to list statefulset pods")?;

        let mut instances = Vec::new();
        for pod in replicas.items {
            let name = match pod.metadata.name {
                Some(name) => name,
                None => continue,
            };
            let address = match pod.status.as_ref().and_then(|s| s.pod_ip.clone()) {
                Some(address) => address,
                None => continue,
            };

            tracing::debug!(peer = %name, ip = %address, "identified peer");
            instances.push(Instance { name, address });
        }

        let self_instance = Instance {
            name: self.self_name.clone(),
            address: self.self_address.clone(),
        };

        Ok(GroupStatus {
            instances,
            self_instance,
            size,
        })
    }
}

fn env_or_err(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("required environment variable {} was not set", key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_err() {
        std::env::set_var("ECO_STS_TEST_VAR", "value");
        assert_eq!(env_or_err("ECO_STS_TEST_VAR").unwrap(), "value");
        assert!(env_or_err("ECO_STS_TEST_MISSING").is_err());
    }

    #[test]
    fn test_params_override_env() {
        let mut params = HashMap::new();
        params.insert(
            "statefulset-name".to_string(),
            serde_yml::Value::String("etcd".to_string()),
        );
        params.insert(
            "namespace".to_string(),
            serde_yml::Value::String("kv".to_string()),
        );
        std::env::set_var("HOSTNAME", "etcd-0");
        std::env::set_var("POD_IP", "10.1.0.7");

        let provider = StsProvider::new(&params).unwrap();
        assert_eq!(provider.statefulset_name, "etcd");
        assert_eq!(provider.namespace, "kv");
        assert_eq!(provider.self_name, "etcd-0");
        assert_eq!(provider.self_address, "10.1.0.7");
    }
}

//! Auto-scaling group providers
//!
//! A provider enumerates the elastic group the operator runs in: the fleet's
//! instances, the local instance, and the desired group size. Providers are
//! purely observational; they never mutate the fleet.

pub mod aws;
pub mod docker;
pub mod sts;

use anyhow::Result;
use async_trait::async_trait;

/// One member of the elastic group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Stable name, unique within the group
    pub name: String,
    /// Routable address of the instance
    pub address: String,
}

/// Snapshot of the group as seen by the provider at one poll.
#[derive(Debug, Clone)]
pub struct GroupStatus {
    pub instances: Vec<Instance>,
    pub self_instance: Instance,
    /// Desired size of the group, which may differ from the number of
    /// currently visible instances
    pub size: usize,
}

#[async_trait]
pub trait Provider: Send + Sync {
    async fn group_status(&self) -> Result<GroupStatus>;
}

pub(crate) fn instances_addresses(instances: &[Instance]) -> Vec<String> {
    instances
        .iter()
        .map(|instance| instance.address.clone())
        .collect()
}

//! AWS auto-scaling group provider
//!
//! Identity comes from the EC2 instance metadata service; the fleet is the
//! set of `running` instances tagged with the group name, and the desired
//! size is the group's configured capacity.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, InstanceStateName};
use std::collections::HashMap;

use super::{GroupStatus, Instance, Provider};

pub struct AwsProvider {
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
    instance_id: String,
    asg_name: String,
}

impl AwsProvider {
    /// Discover the local instance and its auto-scaling group once; failing
    /// here means the operator is not running inside an ASG, which is fatal.
    pub async fn new(_params: &HashMap<String, serde_yml::Value>) -> Result<Self> {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;

        let imds = aws_config::imds::Client::builder().build();
        let instance_id = imds
            .get("/latest/meta-data/instance-id")
            .await
            .map_err(|e| anyhow!("failed to retrieve ec2 instance identity: {}", e))?
            .as_ref()
            .to_string();

        let autoscaling = aws_sdk_autoscaling::Client::new(&sdk_config);
        let ec2 = aws_sdk_ec2::Client::new(&sdk_config);

        let described = autoscaling
            .describe_auto_scaling_instances()
            .instance_ids(&instance_id)
            .send()
            .await
            .context("failed to retrieve auto-scaling group")?;
        let asg_name = described
            .auto_scaling_instances()
            .first()
            .map(|details| details.auto_scaling_group_name().to_string())
            .ok_or_else(|| {
                anyhow!("application is not running inside an ec2 auto-scaling group")
            })?;

        Ok(Self {
            autoscaling,
            ec2,
            instance_id,
            asg_name,
        })
    }
}

#[async_trait]
impl Provider for AwsProvider {
    async fn group_status(&self) -> Result<GroupStatus> {
        let groups = self
            .autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.asg_name)
            .send()
            .await
            .context("failed to describe auto-scaling group")?;
        let group = groups
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| anyhow!("auto-scaling group {:?} not found", self.asg_name))?;
        let size = group.desired_capacity().max(0) as usize;

        let reservations = self
            .ec2
            .describe_instances()
            .filters(
                Filter::builder()
                    .name("tag:aws:autoscaling:groupName")
                    .values(&self.asg_name)
                    .build(),
            )
            .send()
            .await
            .context("failed to describe auto-scaling group's instances")?;

        let mut instances = Vec::new();
        let mut self_instance = None;

        for reservation in reservations.reservations() {
            for described in reservation.instances() {
                let running = matches!(
                    described.state().and_then(|state| state.name()),
                    Some(InstanceStateName::Running)
                );
                if !running {
                    continue;
                }

                let (id, address) = match (described.instance_id(), described.private_ip_address())
                {
                    (Some(id), Some(address)) => (id, address),
                    _ => continue,
                };

                let instance = Instance {
                    name: id.to_string(),
                    address: address.to_string(),
                };
                if instance.name == self.instance_id {
                    self_instance = Some(instance.clone());
                }
                instances.push(instance);
            }
        }

        let self_instance = self_instance.ok_or_else(|| {
            anyhow!(
                "local instance {:?} is not part of the running group",
                self.instance_id
            )
        })?;

        Ok(GroupStatus {
            instances,
            self_instance,
            size,
        })
    }
}

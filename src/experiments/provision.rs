// CIRRUS: Orchestration of Ephemeral Cloud Testbeds for Network Measurement Experiments
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! The per-region provisioning engine.
//!
//! Resources are created in a strict order because later steps need the ids
//! produced by earlier ones. Every step blocks until the resource is
//! confirmed ready, not merely accepted. A failure after partial creation
//! surfaces the partial [`ResourceGraph`] and leaves cleanup to the caller;
//! the engine never tries to self-heal. Different regions may run this
//! engine concurrently without any coordination.

use std::net::Ipv4Addr;
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::cloud::{
    CloudError, CloudProvider, IngressRule, LaunchSpec, ResourceKind, ResourceState, RouteTarget,
};
use crate::records::{InstanceRecord, ResourceGraph, SubnetRecord};
use crate::topology::RegionAllocation;
use crate::util::CancelToken;

use super::{ExperimentId, OrchestrationError};

/// Image looked up in every region when no override is given.
pub const DEFAULT_IMAGE_NAME: &str = "ubuntu-jammy-22.04-amd64-server";

/// The ordered provisioning steps, used to pinpoint where a partial failure
/// happened.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionStep {
    Vpc,
    Dns,
    InternetGateway,
    AttachInternetGateway,
    RouteTable,
    SecurityGroup,
    IngressRule,
    DefaultRoute,
    Subnets,
    Instances,
    SecurityGroupBinding,
    AddressReadback,
}

/// Tunables of the provisioning engine.
#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Image name resolved per region via the provider's image lookup.
    pub image_name: String,
    /// Key pair installed on the launched instances.
    pub key_pair: Option<String>,
    /// How long a single resource may take to become ready.
    pub ready_timeout: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            image_name: DEFAULT_IMAGE_NAME.to_string(),
            key_pair: None,
            ready_timeout: Duration::from_secs(600),
        }
    }
}

/// The wide-open ingress rule applied to the measurement security group.
/// Intentionally permissive: the hosts exchange arbitrary probe traffic and
/// live only for the duration of one experiment.
pub fn measurement_ingress() -> IngressRule {
    IngressRule {
        protocol: "-1".to_string(),
        from_port: 0,
        to_port: 65535,
        source: Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
    }
}

fn partial(
    region: &str,
    step: ProvisionStep,
    graph: &ResourceGraph,
    source: CloudError,
) -> OrchestrationError {
    OrchestrationError::PartialProvisioningFailure {
        region: region.to_string(),
        step,
        graph: Box::new(graph.clone()),
        source,
    }
}

fn checkpoint(
    cancel: &CancelToken,
    region: &str,
    graph: &ResourceGraph,
) -> Result<(), OrchestrationError> {
    if cancel.is_cancelled() {
        Err(OrchestrationError::Cancelled {
            region: region.to_string(),
            graph: Some(Box::new(graph.clone())),
        })
    } else {
        Ok(())
    }
}

/// Provision all resources for one region of an experiment.
///
/// Quota preconditions run before anything is created: if they fail, the
/// region is guaranteed untouched and no graph is returned.
pub async fn provision_region(
    provider: &dyn CloudProvider,
    config: &ProvisionConfig,
    experiment: &ExperimentId,
    allocation: &RegionAllocation,
    cancel: &CancelToken,
) -> Result<ResourceGraph, OrchestrationError> {
    let region = allocation.region.as_str();
    let tag = experiment.as_str();

    // preconditions, before any mutation
    let quota_error = |kind: ResourceKind, needed: usize| {
        move |e: CloudError| match e {
            CloudError::QuotaDenied { .. } => OrchestrationError::QuotaExceeded {
                region: region.to_string(),
                kind,
                needed,
                source: e,
            },
            other => OrchestrationError::Cloud(other),
        }
    };
    provider
        .check_quota(region, ResourceKind::Vpc, 1)
        .await
        .map_err(quota_error(ResourceKind::Vpc, 1))?;
    provider
        .check_quota(region, ResourceKind::Instance, allocation.azs.len())
        .await
        .map_err(quota_error(ResourceKind::Instance, allocation.azs.len()))?;
    let image = provider.lookup_image(region, &config.image_name).await?;

    let mut graph = ResourceGraph::new(tag, region, allocation.vpc_cidr);
    log::info!(
        "[{region}] provisioning {} AZ(s) for experiment {experiment}",
        allocation.azs.len()
    );

    // VPC
    checkpoint(cancel, region, &graph)?;
    let vpc = provider
        .create_vpc(region, allocation.vpc_cidr, tag)
        .await
        .map_err(|e| partial(region, ProvisionStep::Vpc, &graph, e))?;
    graph.vpc = Some(vpc.clone());
    provider
        .wait(
            region,
            ResourceKind::Vpc,
            &vpc,
            ResourceState::Available,
            config.ready_timeout,
        )
        .await
        .map_err(|e| partial(region, ProvisionStep::Vpc, &graph, e))?;

    checkpoint(cancel, region, &graph)?;
    provider
        .enable_vpc_dns(region, &vpc)
        .await
        .map_err(|e| partial(region, ProvisionStep::Dns, &graph, e))?;

    // internet gateway
    checkpoint(cancel, region, &graph)?;
    let igw = provider
        .create_internet_gateway(region, tag)
        .await
        .map_err(|e| partial(region, ProvisionStep::InternetGateway, &graph, e))?;
    graph.internet_gateway = Some(igw.clone());
    provider
        .attach_internet_gateway(region, &igw, &vpc)
        .await
        .map_err(|e| partial(region, ProvisionStep::AttachInternetGateway, &graph, e))?;

    // route table
    checkpoint(cancel, region, &graph)?;
    let route_table = provider
        .create_route_table(region, &vpc, tag)
        .await
        .map_err(|e| partial(region, ProvisionStep::RouteTable, &graph, e))?;
    graph.route_table = Some(route_table.clone());

    // security group with the wide-open measurement rule
    checkpoint(cancel, region, &graph)?;
    let security_group = provider
        .create_security_group(region, &vpc, &format!("{tag}-measurement"), tag)
        .await
        .map_err(|e| partial(region, ProvisionStep::SecurityGroup, &graph, e))?;
    graph.security_group = Some(security_group.clone());
    provider
        .authorize_ingress(region, &security_group, &measurement_ingress())
        .await
        .map_err(|e| partial(region, ProvisionStep::IngressRule, &graph, e))?;

    // default route towards the internet gateway
    checkpoint(cancel, region, &graph)?;
    provider
        .create_route(
            region,
            &route_table,
            Ipv4Net::new(Ipv4Addr::UNSPECIFIED, 0).unwrap(),
            &RouteTarget::InternetGateway(igw.clone()),
        )
        .await
        .map_err(|e| partial(region, ProvisionStep::DefaultRoute, &graph, e))?;

    // one subnet per planned AZ, associated and with public addressing
    for az in &allocation.azs {
        checkpoint(cancel, region, &graph)?;
        let subnet = provider
            .create_subnet(region, &vpc, &az.az, az.subnet, tag)
            .await
            .map_err(|e| partial(region, ProvisionStep::Subnets, &graph, e))?;
        graph.subnets.push(SubnetRecord {
            id: subnet.clone(),
            az: az.az.clone(),
            cidr: az.subnet,
            route_table_association: None,
        });
        let association = provider
            .associate_route_table(region, &route_table, &subnet)
            .await
            .map_err(|e| partial(region, ProvisionStep::Subnets, &graph, e))?;
        if let Some(record) = graph.subnets.last_mut() {
            record.route_table_association = Some(association);
        }
        provider
            .map_public_ip_on_launch(region, &subnet, true)
            .await
            .map_err(|e| partial(region, ProvisionStep::Subnets, &graph, e))?;
    }

    // one instance per subnet
    for i in 0..graph.subnets.len() {
        checkpoint(cancel, region, &graph)?;
        let subnet = graph.subnets[i].clone();
        let spec = LaunchSpec {
            subnet: subnet.id.clone(),
            image: image.clone(),
            machine_type: allocation.machine_type.clone(),
            security_group: security_group.clone(),
            key_pair: config.key_pair.clone(),
            az: subnet.az.clone(),
            tag: tag.to_string(),
        };
        let instance = provider
            .run_instance(region, &spec)
            .await
            .map_err(|e| partial(region, ProvisionStep::Instances, &graph, e))?;
        graph.instances.push(InstanceRecord {
            id: instance.clone(),
            az: subnet.az.clone(),
            subnet: subnet.id.clone(),
            machine_type: allocation.machine_type.clone(),
            key_pair: config.key_pair.clone(),
            public_ip: None,
            private_ip: None,
        });
        provider
            .wait(
                region,
                ResourceKind::Instance,
                &instance,
                ResourceState::Running,
                config.ready_timeout,
            )
            .await
            .map_err(|e| partial(region, ProvisionStep::Instances, &graph, e))?;
    }

    // the launch API may not bind custom groups atomically with the launch,
    // so re-apply the measurement group to every instance
    checkpoint(cancel, region, &graph)?;
    for i in 0..graph.instances.len() {
        let instance = graph.instances[i].id.clone();
        provider
            .assign_security_groups(region, &instance, &[security_group.clone()])
            .await
            .map_err(|e| partial(region, ProvisionStep::SecurityGroupBinding, &graph, e))?;
    }

    // read back the assigned addresses
    for i in 0..graph.instances.len() {
        let instance = graph.instances[i].id.clone();
        let description = provider
            .describe_instance(region, &instance)
            .await
            .map_err(|e| partial(region, ProvisionStep::AddressReadback, &graph, e))?;
        graph.instances[i].public_ip = description.public_ip;
        graph.instances[i].private_ip = description.private_ip;
    }

    log::info!(
        "[{region}] provisioned vpc {vpc} with {} instance(s)",
        graph.instances.len()
    );
    Ok(graph)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::SimCloud;
    use crate::topology::{plan, TopologyRequest};

    async fn allocation_for(sim: &SimCloud, regions: &[&str]) -> Vec<RegionAllocation> {
        let request = TopologyRequest {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            cidr: "10.0.0.0/16".parse().unwrap(),
            ..Default::default()
        };
        plan(sim, &request).await.unwrap().allocations
    }

    #[tokio::test]
    async fn provisions_a_complete_graph() {
        let sim = SimCloud::new();
        let allocations = allocation_for(&sim, &["eu-central-1"]).await;
        let id = ExperimentId::from("cm-test-provision");
        let graph = provision_region(
            &sim,
            &ProvisionConfig::default(),
            &id,
            &allocations[0],
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert!(graph.is_complete(1));
        assert_eq!(graph.subnets.len(), 1);
        assert_eq!(graph.instances.len(), 1);
        let instance = &graph.instances[0];
        assert!(instance.public_ip.is_some());
        assert_eq!(
            instance.private_ip,
            Some("10.0.0.10".parse().unwrap()),
            "first host address within the subnet"
        );
        assert!(graph.subnets[0].route_table_association.is_some());
    }

    #[tokio::test]
    async fn quota_failure_creates_nothing() {
        let sim = SimCloud::new().instance_quota(0);
        let allocations = allocation_for(&sim, &["eu-central-1"]).await;
        let id = ExperimentId::from("cm-test-quota");
        let err = provision_region(
            &sim,
            &ProvisionConfig::default(),
            &id,
            &allocations[0],
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            OrchestrationError::QuotaExceeded {
                kind: ResourceKind::Instance,
                needed: 1,
                ..
            }
        ));
        assert_eq!(sim.create_call_count(), 0, "no create call before quota ok");
    }

    #[tokio::test]
    async fn failure_surfaces_the_partial_graph() {
        let sim = SimCloud::new().fail_on("run_instance");
        let allocations = allocation_for(&sim, &["eu-central-1"]).await;
        let id = ExperimentId::from("cm-test-partial");
        let err = provision_region(
            &sim,
            &ProvisionConfig::default(),
            &id,
            &allocations[0],
            &CancelToken::new(),
        )
        .await
        .unwrap_err();

        let OrchestrationError::PartialProvisioningFailure { step, graph, .. } = err else {
            panic!("expected a partial provisioning failure, got {err}");
        };
        assert_eq!(step, ProvisionStep::Instances);
        assert!(graph.vpc.is_some());
        assert!(graph.security_group.is_some());
        assert_eq!(graph.subnets.len(), 1);
        assert!(graph.instances.is_empty());
    }

    #[tokio::test]
    async fn cancellation_between_steps_returns_the_graph_so_far() {
        let sim = SimCloud::new();
        let allocations = allocation_for(&sim, &["eu-central-1"]).await;
        let id = ExperimentId::from("cm-test-cancel");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = provision_region(
            &sim,
            &ProvisionConfig::default(),
            &id,
            &allocations[0],
            &cancel,
        )
        .await
        .unwrap_err();

        let OrchestrationError::Cancelled { graph, .. } = err else {
            panic!("expected cancellation, got {err}");
        };
        let graph = graph.unwrap();
        assert!(graph.vpc.is_none(), "cancelled before the first mutation");
    }
}

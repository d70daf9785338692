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
//! Capability interface towards the cloud provider.
//!
//! Everything the orchestrator knows about the cloud goes through the
//! [`CloudProvider`] trait: region/AZ discovery, resource CRUD, readiness
//! waits, quota and image lookups. The trait is intentionally free of any
//! provider SDK types so that the orchestration logic can be driven against
//! the in-memory simulator ([`crate::sim::SimCloud`]) exactly like against a
//! real provider binding.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider-opaque resource identifier (e.g. `vpc-0f3a90c1`).
pub type ResourceId = String;

/// The resource types the orchestrator creates, queries, or deletes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum_macros::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    RouteTable,
    InternetGateway,
    NatGateway,
    SecurityGroup,
    Instance,
    PeeringConnection,
    VpcEndpoint,
    NetworkAcl,
    NetworkInterface,
    DhcpOptions,
    Image,
}

/// Lifecycle states a provider resource can report.
///
/// The union over all resource types; each type only ever reports a subset
/// (instances: pending/running/shutting-down/terminated, peering
/// connections: pending-acceptance/active/rejected, ...).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum ResourceState {
    Pending,
    Available,
    Running,
    ShuttingDown,
    Terminated,
    Deleting,
    Deleted,
    PendingAcceptance,
    Active,
    Rejected,
    Failed,
}

/// A single ingress rule of a security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    /// Protocol number, or `"-1"` for all protocols.
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    /// Source address range the rule applies to.
    pub source: Ipv4Net,
}

/// Target of a route entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteTarget {
    InternetGateway(ResourceId),
    PeeringConnection(ResourceId),
}

/// Everything needed to launch one measurement instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub subnet: ResourceId,
    pub image: ResourceId,
    pub machine_type: String,
    pub security_group: ResourceId,
    pub key_pair: Option<String>,
    pub az: String,
    /// Experiment id, attached as a tag to correlate all resources of a run.
    pub tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub id: ResourceId,
    pub state: ResourceState,
    pub az: String,
    pub public_ip: Option<Ipv4Addr>,
    pub private_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeringDescription {
    pub id: ResourceId,
    pub state: ResourceState,
    pub requester_vpc: ResourceId,
    pub requester_cidr: Ipv4Net,
    pub accepter_vpc: ResourceId,
    pub accepter_cidr: Ipv4Net,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatGatewayDescription {
    pub id: ResourceId,
    pub state: ResourceState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableAssociation {
    pub id: ResourceId,
    /// The implicit association of the VPC's main route table.
    pub main: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTableDescription {
    pub id: ResourceId,
    pub main: bool,
    pub associations: Vec<RouteTableAssociation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupDescription {
    pub id: ResourceId,
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkAclDescription {
    pub id: ResourceId,
    pub is_default: bool,
}

/// Errors reported by a [`CloudProvider`] implementation.
///
/// Every variant carries enough context (region, resource kind, id) to drive
/// manual or automated cleanup without re-querying the provider.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("unknown region {0}")]
    UnknownRegion(String),
    #[error("{region}: {kind} API error: {msg}")]
    Api {
        region: String,
        kind: ResourceKind,
        msg: String,
    },
    #[error("{region}: {kind} {id} not found")]
    NotFound {
        region: String,
        kind: ResourceKind,
        id: ResourceId,
    },
    #[error("{region}: quota denied for {needed} additional {kind}(s), {available} available")]
    QuotaDenied {
        region: String,
        kind: ResourceKind,
        needed: usize,
        available: usize,
    },
    #[error("{region}: timed out waiting for {kind} {id} to reach state {target}")]
    WaitTimeout {
        region: String,
        kind: ResourceKind,
        id: ResourceId,
        target: ResourceState,
    },
    #[error("{region}: no image matching {name}")]
    ImageNotFound { region: String, name: String },
}

/// The cloud capability consumed by the orchestrator.
///
/// Deletion calls are delete-if-exists: removing a resource that is already
/// gone succeeds, so that an interrupted teardown can simply be re-run from
/// the persisted resource graph.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    // -------------------- discovery --------------------

    async fn list_regions(&self) -> Result<Vec<String>, CloudError>;

    /// List the availability zones of `region`, in the provider's order.
    async fn list_azs(&self, region: &str) -> Result<Vec<String>, CloudError>;

    async fn lookup_image(&self, region: &str, name: &str) -> Result<ResourceId, CloudError>;

    /// Check that `needed` more resources of `kind` fit into the remaining
    /// quota of `region`. Returns `QuotaDenied` otherwise.
    async fn check_quota(
        &self,
        region: &str,
        kind: ResourceKind,
        needed: usize,
    ) -> Result<(), CloudError>;

    // -------------------- creation / configuration --------------------

    async fn create_vpc(
        &self,
        region: &str,
        cidr: Ipv4Net,
        tag: &str,
    ) -> Result<ResourceId, CloudError>;

    /// Enable DNS support and DNS hostnames on the VPC.
    async fn enable_vpc_dns(&self, region: &str, vpc: &str) -> Result<(), CloudError>;

    async fn create_internet_gateway(
        &self,
        region: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError>;

    async fn attach_internet_gateway(
        &self,
        region: &str,
        igw: &str,
        vpc: &str,
    ) -> Result<(), CloudError>;

    async fn create_route_table(
        &self,
        region: &str,
        vpc: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError>;

    async fn create_security_group(
        &self,
        region: &str,
        vpc: &str,
        name: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError>;

    async fn authorize_ingress(
        &self,
        region: &str,
        security_group: &str,
        rule: &IngressRule,
    ) -> Result<(), CloudError>;

    async fn create_route(
        &self,
        region: &str,
        route_table: &str,
        destination: Ipv4Net,
        target: &RouteTarget,
    ) -> Result<(), CloudError>;

    async fn create_subnet(
        &self,
        region: &str,
        vpc: &str,
        az: &str,
        cidr: Ipv4Net,
        tag: &str,
    ) -> Result<ResourceId, CloudError>;

    /// Associate a subnet with a route table; returns the association id.
    async fn associate_route_table(
        &self,
        region: &str,
        route_table: &str,
        subnet: &str,
    ) -> Result<ResourceId, CloudError>;

    /// Configure whether instances launched into the subnet get a public
    /// address assigned automatically.
    async fn map_public_ip_on_launch(
        &self,
        region: &str,
        subnet: &str,
        enable: bool,
    ) -> Result<(), CloudError>;

    async fn run_instance(
        &self,
        region: &str,
        spec: &LaunchSpec,
    ) -> Result<ResourceId, CloudError>;

    /// Re-apply the given security groups to an instance. The launch API is
    /// not guaranteed to bind custom groups atomically with the launch.
    async fn assign_security_groups(
        &self,
        region: &str,
        instance: &str,
        groups: &[ResourceId],
    ) -> Result<(), CloudError>;

    // -------------------- describe / wait --------------------

    async fn describe_instance(
        &self,
        region: &str,
        instance: &str,
    ) -> Result<InstanceDescription, CloudError>;

    /// Block until the resource reports `target`, or fail with `WaitTimeout`
    /// after `timeout`.
    async fn wait(
        &self,
        region: &str,
        kind: ResourceKind,
        id: &str,
        target: ResourceState,
        timeout: Duration,
    ) -> Result<(), CloudError>;

    // -------------------- peering --------------------

    /// Request a peering connection from `vpc` in `region` towards
    /// `peer_vpc` in `peer_region`. The id is returned immediately; the
    /// accepter side may not see the connection yet.
    async fn create_peering(
        &self,
        region: &str,
        vpc: &str,
        peer_region: &str,
        peer_vpc: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError>;

    /// Describe a peering connection as seen from `region`. Returns
    /// `Ok(None)` while the connection is not (yet) visible there.
    async fn describe_peering(
        &self,
        region: &str,
        id: &str,
    ) -> Result<Option<PeeringDescription>, CloudError>;

    async fn accept_peering(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn main_route_table(&self, region: &str, vpc: &str) -> Result<ResourceId, CloudError>;

    // -------------------- listings scoped to one VPC --------------------

    async fn list_nat_gateways(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<NatGatewayDescription>, CloudError>;

    async fn list_route_tables(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<RouteTableDescription>, CloudError>;

    async fn list_vpc_endpoints(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<ResourceId>, CloudError>;

    async fn list_security_groups(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<SecurityGroupDescription>, CloudError>;

    /// Peering connections that were requested by `vpc`.
    async fn list_peerings_requested_by(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<ResourceId>, CloudError>;

    async fn list_network_acls(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<NetworkAclDescription>, CloudError>;

    async fn list_network_interfaces(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<ResourceId>, CloudError>;

    /// All live resources in `region` tagged with the given experiment id.
    async fn list_tagged(
        &self,
        region: &str,
        tag: &str,
    ) -> Result<Vec<(ResourceKind, ResourceId)>, CloudError>;

    // -------------------- deletion --------------------

    /// Re-associate the VPC with the provider's default DHCP options.
    async fn associate_default_dhcp_options(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<(), CloudError>;

    async fn terminate_instance(&self, region: &str, instance: &str) -> Result<(), CloudError>;

    async fn delete_nat_gateway(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn detach_internet_gateway(
        &self,
        region: &str,
        igw: &str,
        vpc: &str,
    ) -> Result<(), CloudError>;

    async fn delete_internet_gateway(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn disassociate_route_table(
        &self,
        region: &str,
        association: &str,
    ) -> Result<(), CloudError>;

    async fn delete_route_table(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_vpc_endpoint(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_security_group(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_peering(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_network_acl(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_network_interface(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_subnet(&self, region: &str, id: &str) -> Result<(), CloudError>;

    async fn delete_vpc(&self, region: &str, id: &str) -> Result<(), CloudError>;
}

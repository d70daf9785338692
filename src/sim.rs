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
//! An in-memory cloud used to exercise the orchestration logic without
//! touching a real provider.
//!
//! The simulator is deterministic (ids are handed out from a counter) and
//! models the behaviors the orchestrator has to survive: per-region quotas,
//! the eventual-consistency lag between requesting a peering connection and
//! it becoming visible in the accepter region, dependency-checked VPC
//! deletion, asynchronous NAT-gateway deletion, and injectable API failures.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::cloud::{
    CloudError, CloudProvider, IngressRule, InstanceDescription, LaunchSpec,
    NatGatewayDescription, NetworkAclDescription, PeeringDescription, ResourceId, ResourceKind,
    ResourceState, RouteTableAssociation, RouteTableDescription, RouteTarget,
    SecurityGroupDescription,
};

const DEFAULT_REGIONS: &[(&str, &[&str])] = &[
    ("ca-central-1", &["ca-central-1a", "ca-central-1b"]),
    (
        "eu-central-1",
        &["eu-central-1a", "eu-central-1b", "eu-central-1c"],
    ),
    ("eu-west-2", &["eu-west-2a", "eu-west-2b", "eu-west-2c"]),
    ("us-east-1", &["us-east-1a", "us-east-1b", "us-east-1c"]),
];

#[derive(Debug, Clone)]
struct SimVpc {
    region: String,
    cidr: Ipv4Net,
    tag: Option<String>,
    dns_enabled: bool,
    dhcp_options: String,
}

#[derive(Debug, Clone)]
struct SimIgw {
    region: String,
    tag: Option<String>,
    attached_to: Option<ResourceId>,
}

#[derive(Debug, Clone)]
struct SimAssociation {
    id: ResourceId,
    /// `None` for the implicit main-route-table association.
    subnet: Option<ResourceId>,
}

#[derive(Debug, Clone)]
struct SimRouteTable {
    region: String,
    vpc: ResourceId,
    main: bool,
    tag: Option<String>,
    routes: Vec<(Ipv4Net, RouteTarget)>,
    associations: Vec<SimAssociation>,
}

#[derive(Debug, Clone)]
struct SimSecurityGroup {
    region: String,
    vpc: ResourceId,
    is_default: bool,
    #[allow(dead_code)]
    name: String,
    tag: Option<String>,
    ingress: Vec<IngressRule>,
}

#[derive(Debug, Clone)]
struct SimSubnet {
    region: String,
    vpc: ResourceId,
    az: String,
    cidr: Ipv4Net,
    tag: Option<String>,
    map_public_ip: bool,
}

#[derive(Debug, Clone)]
struct SimInstance {
    region: String,
    vpc: ResourceId,
    subnet: ResourceId,
    az: String,
    #[allow(dead_code)]
    machine_type: String,
    security_groups: Vec<ResourceId>,
    state: ResourceState,
    public_ip: Option<Ipv4Addr>,
    private_ip: Ipv4Addr,
    eni: ResourceId,
    tag: Option<String>,
}

#[derive(Debug, Clone)]
struct SimNatGateway {
    region: String,
    vpc: ResourceId,
    state: ResourceState,
    /// Listings observed before a deleting gateway reports `deleted`.
    polls_until_deleted: u32,
    tag: Option<String>,
}

#[derive(Debug, Clone)]
struct SimPeering {
    requester_region: String,
    requester_vpc: ResourceId,
    accepter_region: String,
    accepter_vpc: ResourceId,
    state: ResourceState,
    /// Accepter-side describe calls answered with "not found" before the
    /// connection becomes visible there.
    visibility_countdown: u32,
    tag: Option<String>,
}

#[derive(Debug, Clone)]
struct SimAcl {
    region: String,
    vpc: ResourceId,
    is_default: bool,
}

#[derive(Debug, Clone)]
struct SimEni {
    region: String,
    vpc: ResourceId,
    attached_instance: Option<ResourceId>,
}

#[derive(Debug, Clone)]
struct SimEndpoint {
    region: String,
    vpc: ResourceId,
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    create_calls: usize,
    vpcs: HashMap<ResourceId, SimVpc>,
    igws: HashMap<ResourceId, SimIgw>,
    route_tables: HashMap<ResourceId, SimRouteTable>,
    security_groups: HashMap<ResourceId, SimSecurityGroup>,
    subnets: HashMap<ResourceId, SimSubnet>,
    instances: HashMap<ResourceId, SimInstance>,
    nat_gateways: HashMap<ResourceId, SimNatGateway>,
    peerings: HashMap<ResourceId, SimPeering>,
    network_acls: HashMap<ResourceId, SimAcl>,
    network_interfaces: HashMap<ResourceId, SimEni>,
    endpoints: HashMap<ResourceId, SimEndpoint>,
}

impl SimState {
    fn id(&mut self, prefix: &str) -> ResourceId {
        self.next_id += 1;
        format!("{prefix}-{:08x}", self.next_id)
    }
}

/// The simulated cloud provider.
pub struct SimCloud {
    regions: BTreeMap<String, Vec<String>>,
    vpc_quota: usize,
    instance_quota: usize,
    peering_visibility_lag: u32,
    peerings_start_accepted: bool,
    nat_deletion_hangs: bool,
    failing_ops: Mutex<HashSet<String>>,
    state: Mutex<SimState>,
}

impl Default for SimCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCloud {
    pub fn new() -> Self {
        Self::with_regions(
            DEFAULT_REGIONS
                .iter()
                .map(|(r, azs)| (r.to_string(), azs.iter().map(|a| a.to_string()).collect())),
        )
    }

    pub fn with_regions(regions: impl IntoIterator<Item = (String, Vec<String>)>) -> Self {
        Self {
            regions: regions.into_iter().collect(),
            vpc_quota: 5,
            instance_quota: 20,
            peering_visibility_lag: 0,
            peerings_start_accepted: false,
            nat_deletion_hangs: false,
            failing_ops: Mutex::new(HashSet::new()),
            state: Mutex::new(SimState::default()),
        }
    }

    /// Maximum number of VPCs per region.
    pub fn vpc_quota(mut self, quota: usize) -> Self {
        self.vpc_quota = quota;
        self
    }

    /// Maximum number of live instances per region.
    pub fn instance_quota(mut self, quota: usize) -> Self {
        self.instance_quota = quota;
        self
    }

    /// Number of accepter-side describe calls before a freshly requested
    /// peering connection becomes visible there. `u32::MAX` never shows it.
    pub fn peering_visibility_lag(mut self, lag: u32) -> Self {
        self.peering_visibility_lag = lag;
        self
    }

    /// Fresh peering connections appear already accepted, as if a racing
    /// actor accepted them before the coordinator saw them.
    pub fn peerings_start_accepted(mut self) -> Self {
        self.peerings_start_accepted = true;
        self
    }

    /// Deleting NAT gateways get stuck in `deleting` forever.
    pub fn nat_deletion_hangs(mut self) -> Self {
        self.nat_deletion_hangs = true;
        self
    }

    /// Make the named API call fail with an injected error from now on.
    pub fn fail_on(self, op: &str) -> Self {
        self.failing_ops.lock().unwrap().insert(op.to_string());
        self
    }

    /// Stop failing the named API call.
    pub fn recover(&self, op: &str) {
        self.failing_ops.lock().unwrap().remove(op);
    }

    /// Number of mutating create calls observed so far.
    pub fn create_call_count(&self) -> usize {
        self.state.lock().unwrap().create_calls
    }

    /// Drop a NAT gateway into a VPC, as if some earlier run left it there.
    pub fn inject_nat_gateway(&self, region: &str, vpc: &str, tag: Option<&str>) -> ResourceId {
        let mut state = self.state.lock().unwrap();
        let id = state.id("nat");
        state.nat_gateways.insert(
            id.clone(),
            SimNatGateway {
                region: region.to_string(),
                vpc: vpc.to_string(),
                state: ResourceState::Available,
                polls_until_deleted: 0,
                tag: tag.map(|t| t.to_string()),
            },
        );
        id
    }

    /// Drop a provider-managed endpoint into a VPC.
    pub fn inject_vpc_endpoint(&self, region: &str, vpc: &str) -> ResourceId {
        let mut state = self.state.lock().unwrap();
        let id = state.id("vpce");
        state.endpoints.insert(
            id.clone(),
            SimEndpoint {
                region: region.to_string(),
                vpc: vpc.to_string(),
            },
        );
        id
    }

    /// Number of routes via peering connections in any route table of `vpc`.
    pub fn routes_via_peering(&self, vpc: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .route_tables
            .values()
            .filter(|rt| rt.vpc == vpc)
            .flat_map(|rt| rt.routes.iter())
            .filter(|(_, target)| matches!(target, RouteTarget::PeeringConnection(_)))
            .count()
    }

    fn check_region(&self, region: &str) -> Result<(), CloudError> {
        if self.regions.contains_key(region) {
            Ok(())
        } else {
            Err(CloudError::UnknownRegion(region.to_string()))
        }
    }

    fn check_injected(&self, op: &str, region: &str, kind: ResourceKind) -> Result<(), CloudError> {
        if self.failing_ops.lock().unwrap().contains(op) {
            Err(CloudError::Api {
                region: region.to_string(),
                kind,
                msg: format!("injected {op} failure"),
            })
        } else {
            Ok(())
        }
    }
}

fn api_error(region: &str, kind: ResourceKind, msg: impl Into<String>) -> CloudError {
    CloudError::Api {
        region: region.to_string(),
        kind,
        msg: msg.into(),
    }
}

fn not_found(region: &str, kind: ResourceKind, id: &str) -> CloudError {
    CloudError::NotFound {
        region: region.to_string(),
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl CloudProvider for SimCloud {
    async fn list_regions(&self) -> Result<Vec<String>, CloudError> {
        Ok(self.regions.keys().cloned().collect())
    }

    async fn list_azs(&self, region: &str) -> Result<Vec<String>, CloudError> {
        self.regions
            .get(region)
            .cloned()
            .ok_or_else(|| CloudError::UnknownRegion(region.to_string()))
    }

    async fn lookup_image(&self, region: &str, name: &str) -> Result<ResourceId, CloudError> {
        self.check_region(region)?;
        if name.is_empty() {
            return Err(CloudError::ImageNotFound {
                region: region.to_string(),
                name: name.to_string(),
            });
        }
        let mut hasher = DefaultHasher::new();
        (region, name).hash(&mut hasher);
        Ok(format!("ami-{:08x}", hasher.finish() as u32))
    }

    async fn check_quota(
        &self,
        region: &str,
        kind: ResourceKind,
        needed: usize,
    ) -> Result<(), CloudError> {
        self.check_region(region)?;
        let state = self.state.lock().unwrap();
        let (used, quota) = match kind {
            ResourceKind::Vpc => (
                state.vpcs.values().filter(|v| v.region == region).count(),
                self.vpc_quota,
            ),
            ResourceKind::Instance => (
                state
                    .instances
                    .values()
                    .filter(|i| i.region == region && i.state != ResourceState::Terminated)
                    .count(),
                self.instance_quota,
            ),
            _ => return Ok(()),
        };
        if used + needed > quota {
            Err(CloudError::QuotaDenied {
                region: region.to_string(),
                kind,
                needed,
                available: quota.saturating_sub(used),
            })
        } else {
            Ok(())
        }
    }

    async fn create_vpc(
        &self,
        region: &str,
        cidr: Ipv4Net,
        tag: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_region(region)?;
        self.check_injected("create_vpc", region, ResourceKind::Vpc)?;
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let vpc = state.id("vpc");
        state.vpcs.insert(
            vpc.clone(),
            SimVpc {
                region: region.to_string(),
                cidr,
                tag: Some(tag.to_string()),
                dns_enabled: false,
                dhcp_options: "default".to_string(),
            },
        );
        // every VPC comes with a main route table, a default security group
        // and a default network ACL
        let main_rt = state.id("rtb");
        let main_assoc = state.id("rtbassoc");
        state.route_tables.insert(
            main_rt,
            SimRouteTable {
                region: region.to_string(),
                vpc: vpc.clone(),
                main: true,
                tag: None,
                routes: Vec::new(),
                associations: vec![SimAssociation {
                    id: main_assoc,
                    subnet: None,
                }],
            },
        );
        let default_sg = state.id("sg");
        state.security_groups.insert(
            default_sg,
            SimSecurityGroup {
                region: region.to_string(),
                vpc: vpc.clone(),
                is_default: true,
                name: "default".to_string(),
                tag: None,
                ingress: Vec::new(),
            },
        );
        let default_acl = state.id("acl");
        state.network_acls.insert(
            default_acl,
            SimAcl {
                region: region.to_string(),
                vpc: vpc.clone(),
                is_default: true,
            },
        );
        Ok(vpc)
    }

    async fn enable_vpc_dns(&self, region: &str, vpc: &str) -> Result<(), CloudError> {
        self.check_injected("enable_vpc_dns", region, ResourceKind::Vpc)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .vpcs
            .get_mut(vpc)
            .ok_or_else(|| not_found(region, ResourceKind::Vpc, vpc))?;
        entry.dns_enabled = true;
        Ok(())
    }

    async fn create_internet_gateway(
        &self,
        region: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_region(region)?;
        self.check_injected("create_internet_gateway", region, ResourceKind::InternetGateway)?;
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let igw = state.id("igw");
        state.igws.insert(
            igw.clone(),
            SimIgw {
                region: region.to_string(),
                tag: Some(tag.to_string()),
                attached_to: None,
            },
        );
        Ok(igw)
    }

    async fn attach_internet_gateway(
        &self,
        region: &str,
        igw: &str,
        vpc: &str,
    ) -> Result<(), CloudError> {
        self.check_injected("attach_internet_gateway", region, ResourceKind::InternetGateway)?;
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(vpc) {
            return Err(not_found(region, ResourceKind::Vpc, vpc));
        }
        let entry = state
            .igws
            .get_mut(igw)
            .ok_or_else(|| not_found(region, ResourceKind::InternetGateway, igw))?;
        entry.attached_to = Some(vpc.to_string());
        Ok(())
    }

    async fn create_route_table(
        &self,
        region: &str,
        vpc: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_injected("create_route_table", region, ResourceKind::RouteTable)?;
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(vpc) {
            return Err(not_found(region, ResourceKind::Vpc, vpc));
        }
        state.create_calls += 1;
        let rt = state.id("rtb");
        state.route_tables.insert(
            rt.clone(),
            SimRouteTable {
                region: region.to_string(),
                vpc: vpc.to_string(),
                main: false,
                tag: Some(tag.to_string()),
                routes: Vec::new(),
                associations: Vec::new(),
            },
        );
        Ok(rt)
    }

    async fn create_security_group(
        &self,
        region: &str,
        vpc: &str,
        name: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_injected("create_security_group", region, ResourceKind::SecurityGroup)?;
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(vpc) {
            return Err(not_found(region, ResourceKind::Vpc, vpc));
        }
        state.create_calls += 1;
        let sg = state.id("sg");
        state.security_groups.insert(
            sg.clone(),
            SimSecurityGroup {
                region: region.to_string(),
                vpc: vpc.to_string(),
                is_default: false,
                name: name.to_string(),
                tag: Some(tag.to_string()),
                ingress: Vec::new(),
            },
        );
        Ok(sg)
    }

    async fn authorize_ingress(
        &self,
        region: &str,
        security_group: &str,
        rule: &IngressRule,
    ) -> Result<(), CloudError> {
        self.check_injected("authorize_ingress", region, ResourceKind::SecurityGroup)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .security_groups
            .get_mut(security_group)
            .ok_or_else(|| not_found(region, ResourceKind::SecurityGroup, security_group))?;
        entry.ingress.push(rule.clone());
        Ok(())
    }

    async fn create_route(
        &self,
        region: &str,
        route_table: &str,
        destination: Ipv4Net,
        target: &RouteTarget,
    ) -> Result<(), CloudError> {
        self.check_injected("create_route", region, ResourceKind::RouteTable)?;
        let mut state = self.state.lock().unwrap();
        if let RouteTarget::PeeringConnection(id) = target {
            if !state.peerings.contains_key(id) {
                return Err(not_found(region, ResourceKind::PeeringConnection, id));
            }
        }
        let entry = state
            .route_tables
            .get_mut(route_table)
            .ok_or_else(|| not_found(region, ResourceKind::RouteTable, route_table))?;
        entry.routes.push((destination, target.clone()));
        Ok(())
    }

    async fn create_subnet(
        &self,
        region: &str,
        vpc: &str,
        az: &str,
        cidr: Ipv4Net,
        tag: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_injected("create_subnet", region, ResourceKind::Subnet)?;
        if !self
            .regions
            .get(region)
            .is_some_and(|azs| azs.iter().any(|a| a == az))
        {
            return Err(api_error(
                region,
                ResourceKind::Subnet,
                format!("no availability zone {az}"),
            ));
        }
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(vpc) {
            return Err(not_found(region, ResourceKind::Vpc, vpc));
        }
        state.create_calls += 1;
        let subnet = state.id("subnet");
        state.subnets.insert(
            subnet.clone(),
            SimSubnet {
                region: region.to_string(),
                vpc: vpc.to_string(),
                az: az.to_string(),
                cidr,
                tag: Some(tag.to_string()),
                map_public_ip: false,
            },
        );
        Ok(subnet)
    }

    async fn associate_route_table(
        &self,
        region: &str,
        route_table: &str,
        subnet: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_injected("associate_route_table", region, ResourceKind::RouteTable)?;
        let mut state = self.state.lock().unwrap();
        if !state.subnets.contains_key(subnet) {
            return Err(not_found(region, ResourceKind::Subnet, subnet));
        }
        let assoc = state.id("rtbassoc");
        let entry = state
            .route_tables
            .get_mut(route_table)
            .ok_or_else(|| not_found(region, ResourceKind::RouteTable, route_table))?;
        entry.associations.push(SimAssociation {
            id: assoc.clone(),
            subnet: Some(subnet.to_string()),
        });
        Ok(assoc)
    }

    async fn map_public_ip_on_launch(
        &self,
        region: &str,
        subnet: &str,
        enable: bool,
    ) -> Result<(), CloudError> {
        self.check_injected("map_public_ip_on_launch", region, ResourceKind::Subnet)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .subnets
            .get_mut(subnet)
            .ok_or_else(|| not_found(region, ResourceKind::Subnet, subnet))?;
        entry.map_public_ip = enable;
        Ok(())
    }

    async fn run_instance(
        &self,
        region: &str,
        spec: &LaunchSpec,
    ) -> Result<ResourceId, CloudError> {
        self.check_injected("run_instance", region, ResourceKind::Instance)?;
        let mut state = self.state.lock().unwrap();
        let (vpc, subnet_cidr, map_public_ip) = {
            let subnet = state
                .subnets
                .get(&spec.subnet)
                .ok_or_else(|| not_found(region, ResourceKind::Subnet, &spec.subnet))?;
            (subnet.vpc.clone(), subnet.cidr, subnet.map_public_ip)
        };
        if !state.security_groups.contains_key(&spec.security_group) {
            return Err(not_found(
                region,
                ResourceKind::SecurityGroup,
                &spec.security_group,
            ));
        }
        state.create_calls += 1;

        let hosts_in_subnet = state
            .instances
            .values()
            .filter(|i| i.subnet == spec.subnet && i.state != ResourceState::Terminated)
            .count() as u32;
        let private_ip = Ipv4Addr::from(u32::from(subnet_cidr.network()) + 10 + hosts_in_subnet);
        let instance = state.id("i");
        let public_ip = map_public_ip
            .then(|| Ipv4Addr::from(0x3400_0000u32 + state.next_id as u32));
        let eni = state.id("eni");
        state.network_interfaces.insert(
            eni.clone(),
            SimEni {
                region: region.to_string(),
                vpc: vpc.clone(),
                attached_instance: Some(instance.clone()),
            },
        );
        state.instances.insert(
            instance.clone(),
            SimInstance {
                region: region.to_string(),
                vpc,
                subnet: spec.subnet.clone(),
                az: spec.az.clone(),
                machine_type: spec.machine_type.clone(),
                // the launch API binds only the default group at first; the
                // requested group must be re-applied afterwards
                security_groups: Vec::new(),
                state: ResourceState::Pending,
                public_ip,
                private_ip,
                eni,
                tag: Some(spec.tag.clone()),
            },
        );
        Ok(instance)
    }

    async fn assign_security_groups(
        &self,
        region: &str,
        instance: &str,
        groups: &[ResourceId],
    ) -> Result<(), CloudError> {
        self.check_injected("assign_security_groups", region, ResourceKind::Instance)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .instances
            .get_mut(instance)
            .ok_or_else(|| not_found(region, ResourceKind::Instance, instance))?;
        entry.security_groups = groups.to_vec();
        Ok(())
    }

    async fn describe_instance(
        &self,
        region: &str,
        instance: &str,
    ) -> Result<InstanceDescription, CloudError> {
        let state = self.state.lock().unwrap();
        let entry = state
            .instances
            .get(instance)
            .ok_or_else(|| not_found(region, ResourceKind::Instance, instance))?;
        Ok(InstanceDescription {
            id: instance.to_string(),
            state: entry.state,
            az: entry.az.clone(),
            public_ip: entry.public_ip,
            private_ip: Some(entry.private_ip),
        })
    }

    async fn wait(
        &self,
        region: &str,
        kind: ResourceKind,
        id: &str,
        target: ResourceState,
        _timeout: Duration,
    ) -> Result<(), CloudError> {
        let timeout_error = || CloudError::WaitTimeout {
            region: region.to_string(),
            kind,
            id: id.to_string(),
            target,
        };
        let mut state = self.state.lock().unwrap();
        match (kind, target) {
            (ResourceKind::Instance, ResourceState::Running) => {
                let entry = state.instances.get_mut(id).ok_or_else(timeout_error)?;
                match entry.state {
                    ResourceState::Pending | ResourceState::Running => {
                        entry.state = ResourceState::Running;
                        Ok(())
                    }
                    _ => Err(timeout_error()),
                }
            }
            (ResourceKind::Instance, ResourceState::Terminated) => {
                // a fully cleaned-up instance is a successful wait
                let Some(entry) = state.instances.get_mut(id) else {
                    return Ok(());
                };
                let eni = {
                    match entry.state {
                        ResourceState::ShuttingDown | ResourceState::Terminated => {
                            entry.state = ResourceState::Terminated;
                            entry.eni.clone()
                        }
                        _ => return Err(timeout_error()),
                    }
                };
                state.network_interfaces.remove(&eni);
                Ok(())
            }
            (ResourceKind::Vpc, ResourceState::Available) => {
                if state.vpcs.contains_key(id) {
                    Ok(())
                } else {
                    Err(timeout_error())
                }
            }
            (ResourceKind::PeeringConnection, ResourceState::Active) => {
                match state.peerings.get(id).map(|p| p.state) {
                    Some(ResourceState::Active) => Ok(()),
                    _ => Err(timeout_error()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn create_peering(
        &self,
        region: &str,
        vpc: &str,
        peer_region: &str,
        peer_vpc: &str,
        tag: &str,
    ) -> Result<ResourceId, CloudError> {
        self.check_region(peer_region)?;
        self.check_injected("create_peering", region, ResourceKind::PeeringConnection)?;
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(vpc) {
            return Err(not_found(region, ResourceKind::Vpc, vpc));
        }
        if !state.vpcs.contains_key(peer_vpc) {
            return Err(not_found(peer_region, ResourceKind::Vpc, peer_vpc));
        }
        state.create_calls += 1;
        let id = state.id("pcx");
        state.peerings.insert(
            id.clone(),
            SimPeering {
                requester_region: region.to_string(),
                requester_vpc: vpc.to_string(),
                accepter_region: peer_region.to_string(),
                accepter_vpc: peer_vpc.to_string(),
                state: if self.peerings_start_accepted {
                    ResourceState::Active
                } else {
                    ResourceState::PendingAcceptance
                },
                visibility_countdown: self.peering_visibility_lag,
                tag: Some(tag.to_string()),
            },
        );
        Ok(id)
    }

    async fn describe_peering(
        &self,
        region: &str,
        id: &str,
    ) -> Result<Option<PeeringDescription>, CloudError> {
        self.check_region(region)?;
        let mut state = self.state.lock().unwrap();
        let Some(peering) = state.peerings.get_mut(id) else {
            return Ok(None);
        };
        // the freshly requested connection becomes visible in the accepter
        // region only after the replication lag has passed
        if region == peering.accepter_region && peering.visibility_countdown > 0 {
            peering.visibility_countdown = peering.visibility_countdown.saturating_sub(1);
            return Ok(None);
        }
        let peering = peering.clone();
        let requester_cidr = state
            .vpcs
            .get(&peering.requester_vpc)
            .map(|v| v.cidr)
            .ok_or_else(|| not_found(region, ResourceKind::Vpc, &peering.requester_vpc))?;
        let accepter_cidr = state
            .vpcs
            .get(&peering.accepter_vpc)
            .map(|v| v.cidr)
            .ok_or_else(|| not_found(region, ResourceKind::Vpc, &peering.accepter_vpc))?;
        Ok(Some(PeeringDescription {
            id: id.to_string(),
            state: peering.state,
            requester_vpc: peering.requester_vpc,
            requester_cidr,
            accepter_vpc: peering.accepter_vpc,
            accepter_cidr,
        }))
    }

    async fn accept_peering(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("accept_peering", region, ResourceKind::PeeringConnection)?;
        let mut state = self.state.lock().unwrap();
        let entry = state
            .peerings
            .get_mut(id)
            .ok_or_else(|| not_found(region, ResourceKind::PeeringConnection, id))?;
        if region != entry.accepter_region {
            return Err(api_error(
                region,
                ResourceKind::PeeringConnection,
                format!("{id} cannot be accepted from the requester side"),
            ));
        }
        if entry.state != ResourceState::PendingAcceptance {
            return Err(api_error(
                region,
                ResourceKind::PeeringConnection,
                format!("{id} is in state {}", entry.state),
            ));
        }
        entry.state = ResourceState::Active;
        Ok(())
    }

    async fn main_route_table(&self, region: &str, vpc: &str) -> Result<ResourceId, CloudError> {
        let state = self.state.lock().unwrap();
        state
            .route_tables
            .iter()
            .find(|(_, rt)| rt.vpc == vpc && rt.main)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| not_found(region, ResourceKind::RouteTable, vpc))
    }

    async fn list_nat_gateways(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<NatGatewayDescription>, CloudError> {
        let mut state = self.state.lock().unwrap();
        let mut result = Vec::new();
        for (id, nat) in state.nat_gateways.iter_mut() {
            if nat.region != region || nat.vpc != vpc {
                continue;
            }
            if nat.state == ResourceState::Deleting {
                if nat.polls_until_deleted > 0 {
                    nat.polls_until_deleted -= 1;
                } else if !self.nat_deletion_hangs {
                    nat.state = ResourceState::Deleted;
                }
            }
            result.push(NatGatewayDescription {
                id: id.clone(),
                state: nat.state,
            });
        }
        Ok(result)
    }

    async fn list_route_tables(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<RouteTableDescription>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .route_tables
            .iter()
            .filter(|(_, rt)| rt.region == region && rt.vpc == vpc)
            .map(|(id, rt)| RouteTableDescription {
                id: id.clone(),
                main: rt.main,
                associations: rt
                    .associations
                    .iter()
                    .map(|a| RouteTableAssociation {
                        id: a.id.clone(),
                        main: a.subnet.is_none(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn list_vpc_endpoints(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<ResourceId>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .endpoints
            .iter()
            .filter(|(_, e)| e.region == region && e.vpc == vpc)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn list_security_groups(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<SecurityGroupDescription>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .security_groups
            .iter()
            .filter(|(_, sg)| sg.region == region && sg.vpc == vpc)
            .map(|(id, sg)| SecurityGroupDescription {
                id: id.clone(),
                is_default: sg.is_default,
            })
            .collect())
    }

    async fn list_peerings_requested_by(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<ResourceId>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .peerings
            .iter()
            .filter(|(_, p)| p.requester_region == region && p.requester_vpc == vpc)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn list_network_acls(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<NetworkAclDescription>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .network_acls
            .iter()
            .filter(|(_, acl)| acl.region == region && acl.vpc == vpc)
            .map(|(id, acl)| NetworkAclDescription {
                id: id.clone(),
                is_default: acl.is_default,
            })
            .collect())
    }

    async fn list_network_interfaces(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<Vec<ResourceId>, CloudError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .network_interfaces
            .iter()
            .filter(|(_, eni)| eni.region == region && eni.vpc == vpc)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn list_tagged(
        &self,
        region: &str,
        tag: &str,
    ) -> Result<Vec<(ResourceKind, ResourceId)>, CloudError> {
        self.check_region(region)?;
        let state = self.state.lock().unwrap();
        let tag = Some(tag.to_string());
        let mut result = Vec::new();
        result.extend(
            state
                .vpcs
                .iter()
                .filter(|(_, v)| v.region == region && v.tag == tag)
                .map(|(id, _)| (ResourceKind::Vpc, id.clone())),
        );
        result.extend(
            state
                .subnets
                .iter()
                .filter(|(_, s)| s.region == region && s.tag == tag)
                .map(|(id, _)| (ResourceKind::Subnet, id.clone())),
        );
        result.extend(
            state
                .route_tables
                .iter()
                .filter(|(_, rt)| rt.region == region && rt.tag == tag)
                .map(|(id, _)| (ResourceKind::RouteTable, id.clone())),
        );
        result.extend(
            state
                .security_groups
                .iter()
                .filter(|(_, sg)| sg.region == region && sg.tag == tag)
                .map(|(id, _)| (ResourceKind::SecurityGroup, id.clone())),
        );
        result.extend(
            state
                .igws
                .iter()
                .filter(|(_, igw)| igw.region == region && igw.tag == tag)
                .map(|(id, _)| (ResourceKind::InternetGateway, id.clone())),
        );
        result.extend(
            state
                .instances
                .iter()
                .filter(|(_, i)| {
                    i.region == region && i.tag == tag && i.state != ResourceState::Terminated
                })
                .map(|(id, _)| (ResourceKind::Instance, id.clone())),
        );
        result.extend(
            state
                .nat_gateways
                .iter()
                .filter(|(_, n)| {
                    n.region == region && n.tag == tag && n.state != ResourceState::Deleted
                })
                .map(|(id, _)| (ResourceKind::NatGateway, id.clone())),
        );
        result.extend(
            state
                .peerings
                .iter()
                .filter(|(_, p)| p.requester_region == region && p.tag == tag)
                .map(|(id, _)| (ResourceKind::PeeringConnection, id.clone())),
        );
        Ok(result)
    }

    async fn associate_default_dhcp_options(
        &self,
        region: &str,
        vpc: &str,
    ) -> Result<(), CloudError> {
        self.check_injected("associate_default_dhcp_options", region, ResourceKind::DhcpOptions)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.vpcs.get_mut(vpc) {
            entry.dhcp_options = "default".to_string();
        }
        Ok(())
    }

    async fn terminate_instance(&self, region: &str, instance: &str) -> Result<(), CloudError> {
        self.check_injected("terminate_instance", region, ResourceKind::Instance)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.instances.get_mut(instance) {
            if entry.state != ResourceState::Terminated {
                entry.state = ResourceState::ShuttingDown;
            }
        }
        Ok(())
    }

    async fn delete_nat_gateway(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_nat_gateway", region, ResourceKind::NatGateway)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.nat_gateways.get_mut(id) {
            if entry.state != ResourceState::Deleted {
                entry.state = ResourceState::Deleting;
                entry.polls_until_deleted = 1;
            }
        }
        Ok(())
    }

    async fn detach_internet_gateway(
        &self,
        region: &str,
        igw: &str,
        _vpc: &str,
    ) -> Result<(), CloudError> {
        self.check_injected("detach_internet_gateway", region, ResourceKind::InternetGateway)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.igws.get_mut(igw) {
            entry.attached_to = None;
        }
        Ok(())
    }

    async fn delete_internet_gateway(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_internet_gateway", region, ResourceKind::InternetGateway)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.igws.get(id) {
            if entry.attached_to.is_some() {
                return Err(api_error(
                    region,
                    ResourceKind::InternetGateway,
                    format!("{id} is still attached"),
                ));
            }
            state.igws.remove(id);
        }
        Ok(())
    }

    async fn disassociate_route_table(
        &self,
        region: &str,
        association: &str,
    ) -> Result<(), CloudError> {
        self.check_injected("disassociate_route_table", region, ResourceKind::RouteTable)?;
        let mut state = self.state.lock().unwrap();
        for rt in state.route_tables.values_mut() {
            if let Some(pos) = rt.associations.iter().position(|a| a.id == association) {
                if rt.associations[pos].subnet.is_none() {
                    return Err(api_error(
                        region,
                        ResourceKind::RouteTable,
                        "cannot disassociate the main route table",
                    ));
                }
                rt.associations.remove(pos);
                return Ok(());
            }
        }
        Ok(())
    }

    async fn delete_route_table(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_route_table", region, ResourceKind::RouteTable)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.route_tables.get(id) {
            if entry.main {
                return Err(api_error(
                    region,
                    ResourceKind::RouteTable,
                    format!("{id} is the main route table"),
                ));
            }
            if !entry.associations.is_empty() {
                return Err(api_error(
                    region,
                    ResourceKind::RouteTable,
                    format!("{id} still has associations"),
                ));
            }
            state.route_tables.remove(id);
        }
        Ok(())
    }

    async fn delete_vpc_endpoint(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_vpc_endpoint", region, ResourceKind::VpcEndpoint)?;
        self.state.lock().unwrap().endpoints.remove(id);
        Ok(())
    }

    async fn delete_security_group(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_security_group", region, ResourceKind::SecurityGroup)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.security_groups.get(id) {
            if entry.is_default {
                return Err(api_error(
                    region,
                    ResourceKind::SecurityGroup,
                    format!("{id} is the default group"),
                ));
            }
            let in_use = state.instances.values().any(|i| {
                i.state != ResourceState::Terminated && i.security_groups.iter().any(|g| g == id)
            });
            if in_use {
                return Err(api_error(
                    region,
                    ResourceKind::SecurityGroup,
                    format!("{id} is still in use"),
                ));
            }
            state.security_groups.remove(id);
        }
        Ok(())
    }

    async fn delete_peering(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_peering", region, ResourceKind::PeeringConnection)?;
        self.state.lock().unwrap().peerings.remove(id);
        Ok(())
    }

    async fn delete_network_acl(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_network_acl", region, ResourceKind::NetworkAcl)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.network_acls.get(id) {
            if entry.is_default {
                return Err(api_error(
                    region,
                    ResourceKind::NetworkAcl,
                    format!("{id} is the default ACL"),
                ));
            }
            state.network_acls.remove(id);
        }
        Ok(())
    }

    async fn delete_network_interface(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_network_interface", region, ResourceKind::NetworkInterface)?;
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.network_interfaces.get(id) {
            if entry.attached_instance.is_some() {
                return Err(api_error(
                    region,
                    ResourceKind::NetworkInterface,
                    format!("{id} is still attached"),
                ));
            }
            state.network_interfaces.remove(id);
        }
        Ok(())
    }

    async fn delete_subnet(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_subnet", region, ResourceKind::Subnet)?;
        let mut state = self.state.lock().unwrap();
        if state.subnets.contains_key(id) {
            let occupied = state
                .instances
                .values()
                .any(|i| i.subnet == id && i.state != ResourceState::Terminated);
            if occupied {
                return Err(api_error(
                    region,
                    ResourceKind::Subnet,
                    format!("{id} still contains instances"),
                ));
            }
            state.subnets.remove(id);
        }
        Ok(())
    }

    async fn delete_vpc(&self, region: &str, id: &str) -> Result<(), CloudError> {
        self.check_injected("delete_vpc", region, ResourceKind::Vpc)?;
        let mut state = self.state.lock().unwrap();
        if !state.vpcs.contains_key(id) {
            return Ok(());
        }
        let dependency = |what: &str| {
            Err(api_error(
                region,
                ResourceKind::Vpc,
                format!("{id} has a dependent {what}"),
            ))
        };
        if state.subnets.values().any(|s| s.vpc == id) {
            return dependency("subnet");
        }
        if state
            .instances
            .values()
            .any(|i| i.vpc == id && i.state != ResourceState::Terminated)
        {
            return dependency("instance");
        }
        if state
            .igws
            .values()
            .any(|igw| igw.attached_to.as_deref() == Some(id))
        {
            return dependency("internet gateway");
        }
        if state
            .nat_gateways
            .values()
            .any(|n| n.vpc == id && n.state != ResourceState::Deleted)
        {
            return dependency("nat gateway");
        }
        if state
            .route_tables
            .values()
            .any(|rt| rt.vpc == id && !rt.main)
        {
            return dependency("route table");
        }
        if state
            .security_groups
            .values()
            .any(|sg| sg.vpc == id && !sg.is_default)
        {
            return dependency("security group");
        }
        if state.network_interfaces.values().any(|e| e.vpc == id) {
            return dependency("network interface");
        }
        if state.endpoints.values().any(|e| e.vpc == id) {
            return dependency("endpoint");
        }
        // the implicit main route table, default security group and default
        // ACL go away together with the VPC
        state.route_tables.retain(|_, rt| rt.vpc != id);
        state.security_groups.retain(|_, sg| sg.vpc != id);
        state.network_acls.retain(|_, acl| acl.vpc != id);
        state.vpcs.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn regions_and_azs_are_listed_in_order() {
        let sim = SimCloud::new();
        let regions = sim.list_regions().await.unwrap();
        assert!(regions.windows(2).all(|w| w[0] < w[1]));
        let azs = sim.list_azs("eu-central-1").await.unwrap();
        assert_eq!(azs[0], "eu-central-1a");
        assert!(sim.list_azs("atlantis-1").await.is_err());
    }

    #[tokio::test]
    async fn image_lookup_is_deterministic() {
        let sim = SimCloud::new();
        let a = sim.lookup_image("eu-central-1", "ubuntu-22.04").await.unwrap();
        let b = sim.lookup_image("eu-central-1", "ubuntu-22.04").await.unwrap();
        assert_eq!(a, b);
        let c = sim.lookup_image("eu-west-2", "ubuntu-22.04").await.unwrap();
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn vpc_deletion_requires_empty_vpc() {
        let sim = SimCloud::new();
        let vpc = sim
            .create_vpc("eu-central-1", "10.0.0.0/24".parse().unwrap(), "cm-x")
            .await
            .unwrap();
        let subnet = sim
            .create_subnet(
                "eu-central-1",
                &vpc,
                "eu-central-1a",
                "10.0.0.0/24".parse().unwrap(),
                "cm-x",
            )
            .await
            .unwrap();

        assert!(sim.delete_vpc("eu-central-1", &vpc).await.is_err());
        sim.delete_subnet("eu-central-1", &subnet).await.unwrap();
        sim.delete_vpc("eu-central-1", &vpc).await.unwrap();
        // idempotent
        sim.delete_vpc("eu-central-1", &vpc).await.unwrap();
    }

    #[tokio::test]
    async fn peering_becomes_visible_after_lag() {
        let sim = SimCloud::new().peering_visibility_lag(2);
        let a = sim
            .create_vpc("eu-central-1", "10.0.0.0/24".parse().unwrap(), "cm-x")
            .await
            .unwrap();
        let b = sim
            .create_vpc("eu-west-2", "10.0.1.0/24".parse().unwrap(), "cm-x")
            .await
            .unwrap();
        let pcx = sim
            .create_peering("eu-central-1", &a, "eu-west-2", &b, "cm-x")
            .await
            .unwrap();

        // immediately visible from the requester side
        assert!(sim
            .describe_peering("eu-central-1", &pcx)
            .await
            .unwrap()
            .is_some());
        // the accepter side needs two failed lookups first
        assert!(sim.describe_peering("eu-west-2", &pcx).await.unwrap().is_none());
        assert!(sim.describe_peering("eu-west-2", &pcx).await.unwrap().is_none());
        let desc = sim
            .describe_peering("eu-west-2", &pcx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(desc.state, ResourceState::PendingAcceptance);
    }

    #[tokio::test]
    async fn quota_counts_live_resources() {
        let sim = SimCloud::new().vpc_quota(1);
        sim.check_quota("eu-central-1", ResourceKind::Vpc, 1)
            .await
            .unwrap();
        sim.create_vpc("eu-central-1", "10.0.0.0/24".parse().unwrap(), "cm-x")
            .await
            .unwrap();
        assert!(matches!(
            sim.check_quota("eu-central-1", ResourceKind::Vpc, 1).await,
            Err(CloudError::QuotaDenied { .. })
        ));
        // other regions are unaffected
        sim.check_quota("eu-west-2", ResourceKind::Vpc, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn injected_failures_can_recover() {
        let sim = SimCloud::new().fail_on("create_vpc");
        assert!(sim
            .create_vpc("eu-central-1", "10.0.0.0/24".parse().unwrap(), "cm-x")
            .await
            .is_err());
        sim.recover("create_vpc");
        assert!(sim
            .create_vpc("eu-central-1", "10.0.0.0/24".parse().unwrap(), "cm-x")
            .await
            .is_ok());
    }
}

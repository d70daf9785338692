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
//! Module defining the record data types describing provisioned cloud
//! resources. These records are what teardown operates on: with the
//! exception of asynchronously deleted resources (NAT gateways, route-table
//! associations), teardown never re-discovers state from the provider.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::cloud::{ResourceId, ResourceKind};
use crate::Region;

/// One subnet of a resource graph, bound to a single availability zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetRecord {
    pub id: ResourceId,
    pub az: String,
    pub cidr: Ipv4Net,
    /// Association binding the subnet to the experiment's route table.
    pub route_table_association: Option<ResourceId>,
}

/// One launched measurement instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: ResourceId,
    pub az: String,
    pub subnet: ResourceId,
    pub machine_type: String,
    pub key_pair: Option<String>,
    pub public_ip: Option<Ipv4Addr>,
    pub private_ip: Option<Ipv4Addr>,
}

/// All resources provisioned for one experiment in one region.
///
/// The graph is built incrementally while provisioning: each field is set
/// exactly once and never mutated afterwards. A graph whose later fields are
/// still `None`/empty describes a partially provisioned region and is a
/// valid input to teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGraph {
    pub experiment_id: String,
    pub region: Region,
    /// The address block assigned to this region's VPC.
    pub vpc_cidr: Ipv4Net,
    pub vpc: Option<ResourceId>,
    pub internet_gateway: Option<ResourceId>,
    pub route_table: Option<ResourceId>,
    pub security_group: Option<ResourceId>,
    pub subnets: Vec<SubnetRecord>,
    pub instances: Vec<InstanceRecord>,
}

impl ResourceGraph {
    pub fn new(
        experiment_id: impl Into<String>,
        region: impl Into<Region>,
        vpc_cidr: Ipv4Net,
    ) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            region: region.into(),
            vpc_cidr,
            vpc: None,
            internet_gateway: None,
            route_table: None,
            security_group: None,
            subnets: Vec::new(),
            instances: Vec::new(),
        }
    }

    /// Whether every resource for `expected_azs` availability zones exists.
    pub fn is_complete(&self, expected_azs: usize) -> bool {
        self.vpc.is_some()
            && self.internet_gateway.is_some()
            && self.route_table.is_some()
            && self.security_group.is_some()
            && self.subnets.len() == expected_azs
            && self.instances.len() == expected_azs
    }

    /// All resource ids recorded in the graph, leaves first.
    pub fn resource_ids(&self) -> Vec<(ResourceKind, ResourceId)> {
        let mut ids: Vec<(ResourceKind, ResourceId)> = Vec::new();
        ids.extend(
            self.instances
                .iter()
                .map(|i| (ResourceKind::Instance, i.id.clone())),
        );
        ids.extend(
            self.subnets
                .iter()
                .map(|s| (ResourceKind::Subnet, s.id.clone())),
        );
        if let Some(sg) = &self.security_group {
            ids.push((ResourceKind::SecurityGroup, sg.clone()));
        }
        if let Some(rt) = &self.route_table {
            ids.push((ResourceKind::RouteTable, rt.clone()));
        }
        if let Some(igw) = &self.internet_gateway {
            ids.push((ResourceKind::InternetGateway, igw.clone()));
        }
        if let Some(vpc) = &self.vpc {
            ids.push((ResourceKind::Vpc, vpc.clone()));
        }
        ids
    }

    /// Public addresses of all recorded instances.
    pub fn public_ips(&self) -> Vec<Ipv4Addr> {
        self.instances.iter().filter_map(|i| i.public_ip).collect()
    }
}

/// One endpoint of a peering link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringSide {
    pub region: Region,
    pub vpc: ResourceId,
    pub cidr: Ipv4Net,
}

/// A route installed into a main route table for a peering link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub region: Region,
    pub route_table: ResourceId,
    pub destination: Ipv4Net,
}

/// An established peering link between two regional VPCs, including the
/// routes installed on both sides. Never persisted in a half-built state: a
/// failed link is reported as an error and cleaned up by teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeeringLink {
    pub id: ResourceId,
    pub requester: PeeringSide,
    pub accepter: PeeringSide,
    pub routes: Vec<RouteEntry>,
}

#[cfg(test)]
mod test {
    use super::*;

    fn cidr(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn fresh_graph_is_incomplete_but_valid_for_teardown() {
        let graph = ResourceGraph::new("cm-test", "eu-central-1", cidr("10.0.0.0/24"));
        assert!(!graph.is_complete(1));
        assert!(graph.resource_ids().is_empty());
        assert!(graph.public_ips().is_empty());
    }

    #[test]
    fn resource_ids_list_leaves_first() {
        let mut graph = ResourceGraph::new("cm-test", "eu-central-1", cidr("10.0.0.0/24"));
        graph.vpc = Some("vpc-1".to_string());
        graph.internet_gateway = Some("igw-1".to_string());
        graph.route_table = Some("rtb-1".to_string());
        graph.security_group = Some("sg-1".to_string());
        graph.subnets.push(SubnetRecord {
            id: "subnet-1".to_string(),
            az: "eu-central-1a".to_string(),
            cidr: cidr("10.0.0.0/24"),
            route_table_association: Some("rtbassoc-1".to_string()),
        });
        graph.instances.push(InstanceRecord {
            id: "i-1".to_string(),
            az: "eu-central-1a".to_string(),
            subnet: "subnet-1".to_string(),
            machine_type: "t3.small".to_string(),
            key_pair: None,
            public_ip: Some("52.0.0.1".parse().unwrap()),
            private_ip: Some("10.0.0.10".parse().unwrap()),
        });

        assert!(graph.is_complete(1));
        let ids = graph.resource_ids();
        assert_eq!(ids.first().unwrap().0, ResourceKind::Instance);
        assert_eq!(ids.last().unwrap().0, ResourceKind::Vpc);
        assert_eq!(
            graph.public_ips(),
            vec!["52.0.0.1".parse::<Ipv4Addr>().unwrap()]
        );
    }

    #[test]
    fn graph_serializes_roundtrip() {
        let mut graph = ResourceGraph::new("cm-test", "eu-west-2", cidr("10.0.1.0/24"));
        graph.vpc = Some("vpc-2".to_string());
        let json = serde_json::to_string(&graph).unwrap();
        let parsed: ResourceGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(graph, parsed);
    }
}

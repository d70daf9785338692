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
//! The topology planner: turns a list of regions plus optional AZ and
//! machine-type overrides into a concrete per-region allocation of
//! availability zones, machine types, and disjoint /24 subnets carved out of
//! the experiment's CIDR block.
//!
//! Planning has no side effects and is deterministic for identical inputs
//! and identical provider region/AZ listings. A "regional" experiment is
//! simply a plan with a single region.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::{CloudError, CloudProvider};
use crate::Region;

/// Machine type used when neither a per-region nor a global override is given.
pub const DEFAULT_MACHINE_TYPE: &str = "t3.small";

/// Prefix length of the per-AZ subnets.
pub const SUBNET_PREFIX_LEN: u8 = 24;

lazy_static! {
    /// AZ names are the region name plus a single letter suffix,
    /// e.g. `eu-central-1a`.
    static ref AZ_NAME: Regex = Regex::new(r"^(?P<region>.+\d)(?P<az>[a-z])$").unwrap();
}

#[derive(Debug, Error)]
pub enum TopologyError {
    /// Bad region / AZ / machine-type input. Not retried.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),
    /// The CIDR block cannot hold a /24 subnet for every requested AZ.
    #[error("address space {cidr} exhausted while allocating subnets in {region}")]
    AddressSpaceExhausted { cidr: Ipv4Net, region: Region },
    #[error(transparent)]
    Provider(#[from] CloudError),
}

/// Machine-type resolution: explicit per-region value, else the global
/// override, else [`DEFAULT_MACHINE_TYPE`]. Keys for unknown regions are
/// ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineTypes {
    pub global: Option<String>,
    pub per_region: HashMap<Region, String>,
}

impl MachineTypes {
    pub fn resolve(&self, region: &str) -> &str {
        self.per_region
            .get(region)
            .map(String::as_str)
            .or(self.global.as_deref())
            .unwrap_or(DEFAULT_MACHINE_TYPE)
    }
}

/// The input to [`plan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequest {
    /// Regions to span, in request order. Must be unique.
    pub regions: Vec<Region>,
    /// Preferred AZ(s) per region. Regions without an entry get the first AZ
    /// the provider reports.
    pub az_mapping: HashMap<Region, Vec<String>>,
    pub machine_types: MachineTypes,
    /// The experiment's address block; partitioned into /24 subnets.
    pub cidr: Ipv4Net,
}

impl Default for TopologyRequest {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            az_mapping: HashMap::new(),
            machine_types: MachineTypes::default(),
            cidr: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 16).unwrap(),
        }
    }
}

/// One availability zone with its assigned subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AzAllocation {
    pub az: String,
    pub subnet: Ipv4Net,
}

/// The planned assignment for one region. Immutable once provisioning for
/// the region has begun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAllocation {
    pub region: Region,
    /// Aligned block covering all of the region's subnets; becomes the
    /// region's VPC CIDR. Blocks of different regions never overlap.
    pub vpc_cidr: Ipv4Net,
    pub azs: Vec<AzAllocation>,
    pub machine_type: String,
}

/// A fully resolved topology, one allocation per requested region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub cidr: Ipv4Net,
    pub allocations: Vec<RegionAllocation>,
}

impl Topology {
    /// Total number of instances this topology will launch.
    pub fn num_instances(&self) -> usize {
        self.allocations.iter().map(|a| a.azs.len()).sum()
    }
}

/// Resolve a [`TopologyRequest`] into a concrete [`Topology`].
pub async fn plan(
    provider: &dyn CloudProvider,
    request: &TopologyRequest,
) -> Result<Topology, TopologyError> {
    if request.regions.is_empty() {
        return Err(TopologyError::InvalidTopology(
            "at least one region is required".to_string(),
        ));
    }
    if !request.regions.iter().all_unique() {
        return Err(TopologyError::InvalidTopology(format!(
            "duplicate region in {:?}",
            request.regions
        )));
    }

    let known_regions = provider.list_regions().await?;
    for region in &request.regions {
        if !known_regions.contains(region) {
            return Err(TopologyError::InvalidTopology(format!(
                "unknown region {region}"
            )));
        }
    }

    // Subnets are assigned in request order. Each region's run of /24s is
    // aligned to the next power of two so that the covering VPC blocks of
    // different regions never overlap (peering routes target the whole
    // block of the other VPC).
    let total_subnets = if request.cidr.prefix_len() > SUBNET_PREFIX_LEN {
        0usize
    } else {
        1usize << (SUBNET_PREFIX_LEN - request.cidr.prefix_len())
    };
    let mut cursor = 0usize;

    let mut allocations = Vec::with_capacity(request.regions.len());
    for region in &request.regions {
        let available = provider.list_azs(region).await?;
        let azs = resolve_azs(region, request.az_mapping.get(region), &available)?;

        let span = azs.len().next_power_of_two();
        let start = (cursor + span - 1) / span * span;
        if start + azs.len() > total_subnets {
            return Err(TopologyError::AddressSpaceExhausted {
                cidr: request.cidr,
                region: region.clone(),
            });
        }

        let base = u32::from(request.cidr.network()) + ((start as u32) << 8);
        let vpc_prefix = SUBNET_PREFIX_LEN - span.trailing_zeros() as u8;
        let vpc_cidr = Ipv4Net::new(Ipv4Addr::from(base), vpc_prefix).unwrap();

        let azs = azs
            .into_iter()
            .enumerate()
            .map(|(i, az)| AzAllocation {
                az,
                subnet: Ipv4Net::new(Ipv4Addr::from(base + ((i as u32) << 8)), SUBNET_PREFIX_LEN)
                    .unwrap(),
            })
            .collect();

        allocations.push(RegionAllocation {
            region: region.clone(),
            vpc_cidr,
            azs,
            machine_type: request.machine_types.resolve(region).to_string(),
        });
        // reserve the whole aligned block: the next region must not land
        // inside this region's VPC CIDR
        cursor = start + span;
    }

    Ok(Topology {
        cidr: request.cidr,
        allocations,
    })
}

/// Resolve the AZs for one region: validated preferences, or the first AZ
/// the provider reports.
fn resolve_azs(
    region: &str,
    preferred: Option<&Vec<String>>,
    available: &[String],
) -> Result<Vec<String>, TopologyError> {
    match preferred {
        None => Ok(vec![available
            .first()
            .ok_or_else(|| {
                TopologyError::InvalidTopology(format!("region {region} reports no AZ"))
            })?
            .clone()]),
        Some(list) if list.is_empty() => Err(TopologyError::InvalidTopology(format!(
            "empty AZ list for region {region}"
        ))),
        Some(list) => {
            for az in list {
                let captures = AZ_NAME.captures(az).ok_or_else(|| {
                    TopologyError::InvalidTopology(format!("malformed AZ name {az}"))
                })?;
                if &captures["region"] != region {
                    return Err(TopologyError::InvalidTopology(format!(
                        "AZ {az} does not belong to region {region}"
                    )));
                }
                if !available.iter().any(|a| a == az) {
                    return Err(TopologyError::InvalidTopology(format!(
                        "AZ {az} does not exist in region {region}"
                    )));
                }
            }
            if !list.iter().all_unique() {
                return Err(TopologyError::InvalidTopology(format!(
                    "duplicate AZ for region {region}"
                )));
            }
            Ok(list.clone())
        }
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::*;
    use crate::sim::SimCloud;

    fn cidr(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn request(regions: &[&str], block: &str) -> TopologyRequest {
        TopologyRequest {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            cidr: cidr(block),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn two_regions_get_sequential_slash_24_subnets() {
        let sim = SimCloud::new();
        let topo = plan(&sim, &request(&["eu-central-1", "eu-west-2"], "10.0.0.0/16"))
            .await
            .unwrap();

        assert_eq!(topo.allocations.len(), 2);
        assert_eq!(topo.allocations[0].azs[0].subnet, cidr("10.0.0.0/24"));
        assert_eq!(topo.allocations[1].azs[0].subnet, cidr("10.0.1.0/24"));
        // without an AZ preference, the first reported AZ is used
        assert_eq!(topo.allocations[0].azs[0].az, "eu-central-1a");
        assert_eq!(topo.num_instances(), 2);
    }

    #[tokio::test]
    async fn subnets_are_pairwise_disjoint_and_within_the_block() {
        let sim = SimCloud::new();
        let mut req = request(&["eu-central-1", "eu-west-2", "us-east-1"], "10.8.0.0/16");
        req.az_mapping.insert(
            "eu-central-1".to_string(),
            vec![
                "eu-central-1a".to_string(),
                "eu-central-1b".to_string(),
                "eu-central-1c".to_string(),
            ],
        );
        req.az_mapping.insert(
            "us-east-1".to_string(),
            vec!["us-east-1a".to_string(), "us-east-1b".to_string()],
        );
        let topo = plan(&sim, &req).await.unwrap();

        let subnets = topo
            .allocations
            .iter()
            .flat_map(|a| a.azs.iter().map(|az| az.subnet))
            .collect_vec();
        assert_eq!(subnets.len(), 6);
        for (a, b) in subnets.iter().tuple_combinations() {
            assert!(!a.contains(b) && !b.contains(a), "{a} overlaps {b}");
        }
        for s in &subnets {
            assert!(topo.cidr.contains(s));
        }
        // the covering VPC blocks must not overlap either
        for (a, b) in topo.allocations.iter().tuple_combinations() {
            assert!(
                !a.vpc_cidr.contains(&b.vpc_cidr) && !b.vpc_cidr.contains(&a.vpc_cidr),
                "{} overlaps {}",
                a.vpc_cidr,
                b.vpc_cidr
            );
        }
    }

    #[tokio::test]
    async fn planning_is_deterministic() {
        let sim = SimCloud::new();
        let req = request(&["eu-central-1", "us-east-1"], "10.0.0.0/16");
        let a = plan(&sim, &req).await.unwrap();
        let b = plan(&sim, &req).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn machine_type_override_applies_per_region() {
        let sim = SimCloud::new();
        let mut req = request(&["eu-central-1", "eu-west-2"], "10.0.0.0/16");
        req.machine_types
            .per_region
            .insert("eu-central-1".to_string(), "m5.large".to_string());
        // unknown-region keys are ignored
        req.machine_types
            .per_region
            .insert("mars-north-1".to_string(), "x1.32xlarge".to_string());
        let topo = plan(&sim, &req).await.unwrap();

        assert_eq!(topo.allocations[0].machine_type, "m5.large");
        assert_eq!(topo.allocations[1].machine_type, DEFAULT_MACHINE_TYPE);
    }

    #[tokio::test]
    async fn global_machine_type_loses_to_per_region() {
        let types = MachineTypes {
            global: Some("c5.large".to_string()),
            per_region: HashMap::from_iter([("eu-west-2".to_string(), "m5.large".to_string())]),
        };
        assert_eq!(types.resolve("eu-west-2"), "m5.large");
        assert_eq!(types.resolve("eu-central-1"), "c5.large");
    }

    #[tokio::test]
    async fn unknown_region_is_rejected() {
        let sim = SimCloud::new();
        let err = plan(&sim, &request(&["atlantis-1"], "10.0.0.0/16"))
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn duplicate_region_is_rejected() {
        let sim = SimCloud::new();
        let err = plan(
            &sim,
            &request(&["eu-central-1", "eu-central-1"], "10.0.0.0/16"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TopologyError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn foreign_az_preference_is_rejected() {
        let sim = SimCloud::new();
        let mut req = request(&["eu-central-1"], "10.0.0.0/16");
        req.az_mapping.insert(
            "eu-central-1".to_string(),
            vec!["eu-west-2a".to_string()],
        );
        let err = plan(&sim, &req).await.unwrap_err();
        assert!(matches!(err, TopologyError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn nonexistent_az_preference_is_rejected() {
        let sim = SimCloud::new();
        let mut req = request(&["eu-central-1"], "10.0.0.0/16");
        req.az_mapping.insert(
            "eu-central-1".to_string(),
            vec!["eu-central-1z".to_string()],
        );
        let err = plan(&sim, &req).await.unwrap_err();
        assert!(matches!(err, TopologyError::InvalidTopology(_)));
    }

    #[tokio::test]
    async fn small_block_exhausts() {
        let sim = SimCloud::new();
        let err = plan(&sim, &request(&["eu-central-1", "eu-west-2"], "10.0.0.0/24"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TopologyError::AddressSpaceExhausted { region, .. } if region == "eu-west-2"
        ));
    }

    #[tokio::test]
    async fn block_narrower_than_a_subnet_exhausts_immediately() {
        let sim = SimCloud::new();
        let err = plan(&sim, &request(&["eu-central-1"], "10.0.0.0/26"))
            .await
            .unwrap_err();
        assert!(matches!(err, TopologyError::AddressSpaceExhausted { .. }));
    }
}

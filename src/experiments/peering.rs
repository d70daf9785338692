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
//! The peering coordinator.
//!
//! A peering connection is requested from one side and accepted from the
//! other. The accepter region's view of a freshly created connection can lag
//! behind the requester's (the provider replicates the object eventually),
//! so the coordinator polls the accepter region with a bounded retry budget
//! before giving up. This is the only place in the orchestrator where a
//! bounded wait-then-retry loop is required rather than advisory.

use std::time::Duration;

use crate::cloud::{CloudProvider, ResourceKind, ResourceState, RouteTarget};
use crate::records::{PeeringLink, PeeringSide, ResourceGraph, RouteEntry};
use crate::util::Backoff;

use super::{ExperimentId, OrchestrationError};

/// Tunables of the peering coordinator.
#[derive(Debug, Clone)]
pub struct PeeringConfig {
    /// Maximum accepter-side lookups before declaring the connection lost.
    pub visibility_attempts: usize,
    /// Initial delay between lookups; doubles (with jitter) up to the max.
    pub visibility_base_delay: Duration,
    pub visibility_max_delay: Duration,
    /// How long the accepted connection may take to become active.
    pub activation_timeout: Duration,
}

impl Default for PeeringConfig {
    fn default() -> Self {
        Self {
            visibility_attempts: 12,
            visibility_base_delay: Duration::from_secs(2),
            visibility_max_delay: Duration::from_secs(30),
            activation_timeout: Duration::from_secs(120),
        }
    }
}

fn require_vpc(graph: &ResourceGraph) -> Result<&str, OrchestrationError> {
    graph
        .vpc
        .as_deref()
        .ok_or_else(|| OrchestrationError::IncompleteResourceGraph {
            region: graph.region.clone(),
            kind: ResourceKind::Vpc,
        })
}

/// Establish a peering link between two regional VPCs and install the cross
/// routes on both main route tables.
///
/// On a visibility timeout, nothing has been accepted and no route has been
/// installed on either side; the dangling request is removed by teardown
/// (it lists peering connections initiated by the VPC).
pub async fn establish_peering(
    provider: &dyn CloudProvider,
    config: &PeeringConfig,
    experiment: &ExperimentId,
    requester: &ResourceGraph,
    accepter: &ResourceGraph,
) -> Result<PeeringLink, OrchestrationError> {
    let requester_vpc = require_vpc(requester)?;
    let accepter_vpc = require_vpc(accepter)?;
    let requester_region = requester.region.as_str();
    let accepter_region = accepter.region.as_str();

    log::info!(
        "peering {requester_region}/{requester_vpc} -> {accepter_region}/{accepter_vpc} \
         for experiment {experiment}"
    );
    let peering_id = provider
        .create_peering(
            requester_region,
            requester_vpc,
            accepter_region,
            accepter_vpc,
            experiment.as_str(),
        )
        .await?;

    // wait for the connection to replicate into the accepter region
    let mut backoff = Backoff::new(config.visibility_base_delay, config.visibility_max_delay)
        .with_budget(
            config
                .visibility_max_delay
                .saturating_mul(config.visibility_attempts as u32),
        );
    let mut description = None;
    for attempt in 1..=config.visibility_attempts {
        match provider.describe_peering(accepter_region, &peering_id).await? {
            Some(found) => {
                log::debug!(
                    "peering {peering_id} visible in {accepter_region} after {attempt} attempt(s)"
                );
                description = Some(found);
                break;
            }
            None if attempt == config.visibility_attempts || backoff.expired() => break,
            None => backoff.wait().await,
        }
    }
    let Some(description) = description else {
        return Err(OrchestrationError::PeeringPropagationTimeout {
            peering_id,
            accepter_region: accepter_region.to_string(),
            attempts: config.visibility_attempts,
        });
    };

    // the connection may have been accepted or rejected behind our back
    if description.state != ResourceState::PendingAcceptance {
        return Err(OrchestrationError::UnexpectedPeeringState {
            peering_id,
            state: description.state,
        });
    }

    provider.accept_peering(accepter_region, &peering_id).await?;
    provider
        .wait(
            accepter_region,
            ResourceKind::PeeringConnection,
            &peering_id,
            ResourceState::Active,
            config.activation_timeout,
        )
        .await?;

    // cross routes on both main route tables
    let mut routes = Vec::with_capacity(2);
    for (region, vpc, destination) in [
        (requester_region, requester_vpc, accepter.vpc_cidr),
        (accepter_region, accepter_vpc, requester.vpc_cidr),
    ] {
        let main_rt = provider.main_route_table(region, vpc).await?;
        provider
            .create_route(
                region,
                &main_rt,
                destination,
                &RouteTarget::PeeringConnection(peering_id.clone()),
            )
            .await?;
        routes.push(RouteEntry {
            region: region.to_string(),
            route_table: main_rt,
            destination,
        });
    }

    Ok(PeeringLink {
        id: peering_id,
        requester: PeeringSide {
            region: requester_region.to_string(),
            vpc: requester_vpc.to_string(),
            cidr: requester.vpc_cidr,
        },
        accepter: PeeringSide {
            region: accepter_region.to_string(),
            vpc: accepter_vpc.to_string(),
            cidr: accepter.vpc_cidr,
        },
        routes,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::experiments::provision::{provision_region, ProvisionConfig};
    use crate::sim::SimCloud;
    use crate::topology::{plan, TopologyRequest};
    use crate::util::CancelToken;

    fn fast_config() -> PeeringConfig {
        PeeringConfig {
            visibility_attempts: 4,
            visibility_base_delay: Duration::from_millis(1),
            visibility_max_delay: Duration::from_millis(2),
            activation_timeout: Duration::from_millis(10),
        }
    }

    async fn two_graphs(sim: &SimCloud, id: &ExperimentId) -> (ResourceGraph, ResourceGraph) {
        let request = TopologyRequest {
            regions: vec!["eu-central-1".to_string(), "eu-west-2".to_string()],
            cidr: "10.0.0.0/16".parse().unwrap(),
            ..Default::default()
        };
        let topo = plan(sim, &request).await.unwrap();
        let cancel = CancelToken::new();
        let config = ProvisionConfig::default();
        let a = provision_region(sim, &config, id, &topo.allocations[0], &cancel)
            .await
            .unwrap();
        let b = provision_region(sim, &config, id, &topo.allocations[1], &cancel)
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn establishes_the_link_and_installs_both_routes() {
        let sim = SimCloud::new().peering_visibility_lag(2);
        let id = ExperimentId::from("cm-test-peer");
        let (a, b) = two_graphs(&sim, &id).await;

        let link = establish_peering(&sim, &fast_config(), &id, &a, &b)
            .await
            .unwrap();

        assert_eq!(link.routes.len(), 2);
        assert_eq!(link.routes[0].destination, b.vpc_cidr);
        assert_eq!(link.routes[1].destination, a.vpc_cidr);
        assert_eq!(sim.routes_via_peering(a.vpc.as_deref().unwrap()), 1);
        assert_eq!(sim.routes_via_peering(b.vpc.as_deref().unwrap()), 1);
    }

    #[tokio::test]
    async fn visibility_timeout_installs_no_routes() {
        let sim = SimCloud::new().peering_visibility_lag(u32::MAX);
        let id = ExperimentId::from("cm-test-peer-timeout");
        let (a, b) = two_graphs(&sim, &id).await;

        let err = establish_peering(&sim, &fast_config(), &id, &a, &b)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            OrchestrationError::PeeringPropagationTimeout { attempts: 4, .. }
        ));
        assert_eq!(sim.routes_via_peering(a.vpc.as_deref().unwrap()), 0);
        assert_eq!(sim.routes_via_peering(b.vpc.as_deref().unwrap()), 0);
    }

    #[tokio::test]
    async fn externally_accepted_connection_is_rejected() {
        // somebody accepts the connection before the coordinator sees it
        let sim = SimCloud::new().peerings_start_accepted();
        let id = ExperimentId::from("cm-test-peer-state");
        let (a, b) = two_graphs(&sim, &id).await;

        let err = establish_peering(&sim, &fast_config(), &id, &a, &b)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::UnexpectedPeeringState {
                state: ResourceState::Active,
                ..
            }
        ));
        assert_eq!(sim.routes_via_peering(a.vpc.as_deref().unwrap()), 0);
    }

    #[tokio::test]
    async fn incomplete_graph_is_refused() {
        let sim = SimCloud::new();
        let id = ExperimentId::from("cm-test-peer-incomplete");
        let (a, _) = two_graphs(&sim, &id).await;
        let empty = ResourceGraph::new(id.as_str(), "eu-west-2", "10.0.1.0/24".parse().unwrap());

        let err = establish_peering(&sim, &fast_config(), &id, &a, &empty)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::IncompleteResourceGraph { .. }
        ));
    }
}

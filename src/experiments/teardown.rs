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
//! The per-region teardown engine.
//!
//! Deletion runs as an explicit ordered list of typed steps, each idempotent
//! (delete-if-exists) so that teardown can be resumed after a crash using
//! only the persisted [`ResourceGraph`]. Within one step, independent
//! resources are deleted independently and individual failures are recorded
//! rather than aborting the batch; a resource that never reaches the deleted
//! state aborts everything that depends on it, since leaving orphaned
//! billable resources behind is the worst failure mode of the whole system.
//!
//! The step order (DHCP options first, VPC last) follows the provider's
//! dependency rules; parts of it are operational folklore kept as a safe
//! default.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use strum::IntoEnumIterator;

use crate::cloud::{CloudError, CloudProvider, ResourceId, ResourceKind, ResourceState};
use crate::records::ResourceGraph;
use crate::util::CancelToken;
use crate::Region;

use super::OrchestrationError;

/// Tunables of the teardown engine.
#[derive(Debug, Clone)]
pub struct TeardownConfig {
    /// Sleep between polls for asynchronous deletions.
    pub poll_interval: Duration,
    /// Wait budget for a dependent resource to reach the deleted state.
    pub deletion_timeout: Duration,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            deletion_timeout: Duration::from_secs(600),
        }
    }
}

/// The ordered teardown steps. Later steps depend on earlier ones having
/// completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum TeardownStep {
    DhcpOptions,
    Instances,
    NatGateways,
    InternetGateway,
    RouteTableAssociations,
    RouteTables,
    VpcEndpoints,
    SecurityGroups,
    PeeringConnections,
    NetworkAcls,
    NetworkInterfaces,
    Subnets,
    Vpc,
}

/// A single resource that could not be deleted.
#[derive(Debug, Clone)]
pub struct TeardownFailure {
    pub kind: ResourceKind,
    pub id: ResourceId,
    pub error: String,
}

/// What one region's teardown did.
#[derive(Debug, Clone, Default)]
pub struct TeardownReport {
    pub region: Region,
    /// Public addresses the terminated instances held, for reporting.
    pub released_public_ips: Vec<Ipv4Addr>,
    pub deleted: Vec<(ResourceKind, ResourceId)>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..Default::default()
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn mark_deleted(&mut self, kind: ResourceKind, id: impl Into<ResourceId>) {
        self.deleted.push((kind, id.into()));
    }

    fn record_failure(&mut self, kind: ResourceKind, id: impl Into<ResourceId>, error: &CloudError) {
        let id = id.into();
        log::warn!("failed to delete {kind} {id}: {error}");
        self.failures.push(TeardownFailure {
            kind,
            id,
            error: error.to_string(),
        });
    }
}

/// Tear down all resources recorded in `graph`, in dependency order.
///
/// Partial graphs (from failed or cancelled provisioning) are fine: every
/// step skips resources the graph does not record.
pub async fn teardown_region(
    provider: &dyn CloudProvider,
    config: &TeardownConfig,
    graph: &ResourceGraph,
    cancel: &CancelToken,
) -> Result<TeardownReport, OrchestrationError> {
    let region = graph.region.as_str();
    let mut report = TeardownReport::new(region);
    log::info!(
        "[{region}] tearing down experiment {} ({} recorded resources)",
        graph.experiment_id,
        graph.resource_ids().len()
    );

    for step in TeardownStep::iter() {
        if cancel.is_cancelled() {
            return Err(OrchestrationError::Cancelled {
                region: region.to_string(),
                graph: None,
            });
        }
        log::debug!("[{region}] teardown step {step}");
        match step {
            TeardownStep::DhcpOptions => dhcp_options(provider, graph, &mut report).await,
            TeardownStep::Instances => instances(provider, config, graph, &mut report).await?,
            TeardownStep::NatGateways => nat_gateways(provider, config, graph, &mut report).await?,
            TeardownStep::InternetGateway => internet_gateway(provider, graph, &mut report).await,
            TeardownStep::RouteTableAssociations => {
                route_table_associations(provider, graph, &mut report).await?
            }
            TeardownStep::RouteTables => route_tables(provider, graph, &mut report).await?,
            TeardownStep::VpcEndpoints => vpc_endpoints(provider, graph, &mut report).await?,
            TeardownStep::SecurityGroups => security_groups(provider, graph, &mut report).await?,
            TeardownStep::PeeringConnections => peerings(provider, graph, &mut report).await?,
            TeardownStep::NetworkAcls => network_acls(provider, graph, &mut report).await?,
            TeardownStep::NetworkInterfaces => {
                network_interfaces(provider, graph, &mut report).await?
            }
            TeardownStep::Subnets => subnets(provider, graph, &mut report).await,
            TeardownStep::Vpc => vpc(provider, graph, &mut report).await,
        }
    }

    if report.is_clean() {
        log::info!("[{region}] teardown complete, {} resources deleted", report.deleted.len());
    } else {
        log::warn!(
            "[{region}] teardown finished with {} unresolved resource(s)",
            report.failures.len()
        );
    }
    Ok(report)
}

async fn dhcp_options(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) {
    let Some(vpc) = &graph.vpc else { return };
    if let Err(e) = provider
        .associate_default_dhcp_options(&graph.region, vpc)
        .await
    {
        report.record_failure(ResourceKind::DhcpOptions, vpc.clone(), &e);
    }
}

/// Terminate every recorded instance and wait until all of them are gone.
/// Instances that never reach `terminated` block all later steps.
async fn instances(
    provider: &dyn CloudProvider,
    config: &TeardownConfig,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let region = graph.region.as_str();
    report.released_public_ips = graph.public_ips();

    let mut requested = Vec::new();
    let mut blocked = Vec::new();
    for instance in &graph.instances {
        match provider.terminate_instance(region, &instance.id).await {
            Ok(()) => requested.push(instance.id.clone()),
            Err(e) => {
                report.record_failure(ResourceKind::Instance, instance.id.clone(), &e);
                blocked.push(instance.id.clone());
            }
        }
    }
    for id in &requested {
        match provider
            .wait(
                region,
                ResourceKind::Instance,
                id,
                ResourceState::Terminated,
                config.deletion_timeout,
            )
            .await
        {
            Ok(()) => report.mark_deleted(ResourceKind::Instance, id.clone()),
            Err(e) => {
                report.record_failure(ResourceKind::Instance, id.clone(), &e);
                blocked.push(id.clone());
            }
        }
    }
    if blocked.is_empty() {
        Ok(())
    } else {
        Err(OrchestrationError::TeardownIncomplete {
            region: region.to_string(),
            kind: ResourceKind::Instance,
            remaining: blocked,
        })
    }
}

/// Delete NAT gateways and poll until the provider lists none that are not
/// `deleted`. NAT gateways are not recorded in the graph; they are
/// re-discovered from the provider.
async fn nat_gateways(
    provider: &dyn CloudProvider,
    config: &TeardownConfig,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();

    let live: Vec<ResourceId> = provider
        .list_nat_gateways(region, vpc)
        .await?
        .into_iter()
        .filter(|nat| nat.state != ResourceState::Deleted)
        .map(|nat| nat.id)
        .collect();
    if live.is_empty() {
        return Ok(());
    }
    for id in &live {
        if let Err(e) = provider.delete_nat_gateway(region, id).await {
            report.record_failure(ResourceKind::NatGateway, id.clone(), &e);
        }
    }

    let deadline = Instant::now() + config.deletion_timeout;
    loop {
        let remaining: Vec<ResourceId> = provider
            .list_nat_gateways(region, vpc)
            .await?
            .into_iter()
            .filter(|nat| nat.state != ResourceState::Deleted)
            .map(|nat| nat.id)
            .collect();
        if remaining.is_empty() {
            for id in live {
                report.mark_deleted(ResourceKind::NatGateway, id);
            }
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(OrchestrationError::TeardownIncomplete {
                region: region.to_string(),
                kind: ResourceKind::NatGateway,
                remaining,
            });
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

async fn internet_gateway(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) {
    let (Some(igw), Some(vpc)) = (&graph.internet_gateway, &graph.vpc) else {
        return;
    };
    let region = graph.region.as_str();
    if let Err(e) = provider.detach_internet_gateway(region, igw, vpc).await {
        report.record_failure(ResourceKind::InternetGateway, igw.clone(), &e);
        return;
    }
    match provider.delete_internet_gateway(region, igw).await {
        Ok(()) => report.mark_deleted(ResourceKind::InternetGateway, igw.clone()),
        Err(e) => report.record_failure(ResourceKind::InternetGateway, igw.clone(), &e),
    }
}

/// Associations are re-discovered from the provider: a crashed provisioning
/// run may have created associations the graph never recorded.
async fn route_table_associations(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for table in provider.list_route_tables(region, vpc).await? {
        for association in table.associations.iter().filter(|a| !a.main) {
            if let Err(e) = provider.disassociate_route_table(region, &association.id).await {
                report.record_failure(ResourceKind::RouteTable, association.id.clone(), &e);
            }
        }
    }
    Ok(())
}

async fn route_tables(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for table in provider.list_route_tables(region, vpc).await? {
        if table.main {
            continue;
        }
        match provider.delete_route_table(region, &table.id).await {
            Ok(()) => report.mark_deleted(ResourceKind::RouteTable, table.id),
            Err(e) => report.record_failure(ResourceKind::RouteTable, table.id, &e),
        }
    }
    Ok(())
}

async fn vpc_endpoints(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for endpoint in provider.list_vpc_endpoints(region, vpc).await? {
        match provider.delete_vpc_endpoint(region, &endpoint).await {
            Ok(()) => report.mark_deleted(ResourceKind::VpcEndpoint, endpoint),
            Err(e) => report.record_failure(ResourceKind::VpcEndpoint, endpoint, &e),
        }
    }
    Ok(())
}

async fn security_groups(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for group in provider.list_security_groups(region, vpc).await? {
        if group.is_default {
            continue;
        }
        match provider.delete_security_group(region, &group.id).await {
            Ok(()) => report.mark_deleted(ResourceKind::SecurityGroup, group.id),
            Err(e) => report.record_failure(ResourceKind::SecurityGroup, group.id, &e),
        }
    }
    Ok(())
}

async fn peerings(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for peering in provider.list_peerings_requested_by(region, vpc).await? {
        match provider.delete_peering(region, &peering).await {
            Ok(()) => report.mark_deleted(ResourceKind::PeeringConnection, peering),
            Err(e) => report.record_failure(ResourceKind::PeeringConnection, peering, &e),
        }
    }
    Ok(())
}

async fn network_acls(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for acl in provider.list_network_acls(region, vpc).await? {
        if acl.is_default {
            continue;
        }
        match provider.delete_network_acl(region, &acl.id).await {
            Ok(()) => report.mark_deleted(ResourceKind::NetworkAcl, acl.id),
            Err(e) => report.record_failure(ResourceKind::NetworkAcl, acl.id, &e),
        }
    }
    Ok(())
}

async fn network_interfaces(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) -> Result<(), OrchestrationError> {
    let Some(vpc) = &graph.vpc else { return Ok(()) };
    let region = graph.region.as_str();
    for eni in provider.list_network_interfaces(region, vpc).await? {
        match provider.delete_network_interface(region, &eni).await {
            Ok(()) => report.mark_deleted(ResourceKind::NetworkInterface, eni),
            Err(e) => report.record_failure(ResourceKind::NetworkInterface, eni, &e),
        }
    }
    Ok(())
}

async fn subnets(
    provider: &dyn CloudProvider,
    graph: &ResourceGraph,
    report: &mut TeardownReport,
) {
    let region = graph.region.as_str();
    for subnet in &graph.subnets {
        match provider.delete_subnet(region, &subnet.id).await {
            Ok(()) => report.mark_deleted(ResourceKind::Subnet, subnet.id.clone()),
            Err(e) => report.record_failure(ResourceKind::Subnet, subnet.id.clone(), &e),
        }
    }
}

async fn vpc(provider: &dyn CloudProvider, graph: &ResourceGraph, report: &mut TeardownReport) {
    let Some(vpc) = &graph.vpc else { return };
    let region = graph.region.as_str();
    match provider.delete_vpc(region, vpc).await {
        Ok(()) => report.mark_deleted(ResourceKind::Vpc, vpc.clone()),
        Err(e) => report.record_failure(ResourceKind::Vpc, vpc.clone(), &e),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::experiments::provision::{provision_region, ProvisionConfig};
    use crate::experiments::ExperimentId;
    use crate::sim::SimCloud;
    use crate::topology::{plan, RegionAllocation, TopologyRequest};

    fn fast_config() -> TeardownConfig {
        TeardownConfig {
            poll_interval: Duration::from_millis(1),
            deletion_timeout: Duration::from_millis(20),
        }
    }

    async fn allocations_for(sim: &SimCloud, regions: &[&str]) -> Vec<RegionAllocation> {
        let request = TopologyRequest {
            regions: regions.iter().map(|r| r.to_string()).collect(),
            cidr: "10.0.0.0/16".parse().unwrap(),
            ..Default::default()
        };
        plan(sim, &request).await.unwrap().allocations
    }

    #[tokio::test]
    async fn provision_then_teardown_is_a_roundtrip_to_empty() {
        let sim = SimCloud::new();
        let id = ExperimentId::from("cm-test-roundtrip");
        let cancel = CancelToken::new();
        for allocation in allocations_for(&sim, &["eu-central-1", "eu-west-2"]).await {
            let graph =
                provision_region(&sim, &ProvisionConfig::default(), &id, &allocation, &cancel)
                    .await
                    .unwrap();
            let report = teardown_region(&sim, &fast_config(), &graph, &cancel)
                .await
                .unwrap();
            assert!(report.is_clean(), "failures: {:?}", report.failures);
            assert_eq!(report.released_public_ips.len(), 1);

            let leftovers = sim.list_tagged(&allocation.region, id.as_str()).await.unwrap();
            assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
        }
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let sim = SimCloud::new();
        let id = ExperimentId::from("cm-test-idem");
        let cancel = CancelToken::new();
        let allocation = &allocations_for(&sim, &["eu-central-1"]).await[0];
        let graph = provision_region(&sim, &ProvisionConfig::default(), &id, allocation, &cancel)
            .await
            .unwrap();

        let first = teardown_region(&sim, &fast_config(), &graph, &cancel)
            .await
            .unwrap();
        assert!(first.is_clean());
        // a second run over the same graph finds nothing left and succeeds
        let second = teardown_region(&sim, &fast_config(), &graph, &cancel)
            .await
            .unwrap();
        assert!(second.is_clean());
    }

    #[tokio::test]
    async fn partial_graph_from_failed_provisioning_is_cleaned_up() {
        let sim = SimCloud::new().fail_on("run_instance");
        let id = ExperimentId::from("cm-test-partial-clean");
        let cancel = CancelToken::new();
        let allocation = &allocations_for(&sim, &["eu-central-1"]).await[0];
        let err = provision_region(&sim, &ProvisionConfig::default(), &id, allocation, &cancel)
            .await
            .unwrap_err();
        let graph = err.partial_graph().unwrap().clone();

        let report = teardown_region(&sim, &fast_config(), &graph, &cancel)
            .await
            .unwrap();
        assert!(report.is_clean(), "failures: {:?}", report.failures);
        assert!(sim
            .list_tagged("eu-central-1", id.as_str())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn leftover_nat_gateway_is_drained_before_the_vpc_goes() {
        let sim = SimCloud::new();
        let id = ExperimentId::from("cm-test-nat");
        let cancel = CancelToken::new();
        let allocation = &allocations_for(&sim, &["eu-central-1"]).await[0];
        let graph = provision_region(&sim, &ProvisionConfig::default(), &id, allocation, &cancel)
            .await
            .unwrap();
        sim.inject_nat_gateway(
            "eu-central-1",
            graph.vpc.as_deref().unwrap(),
            Some(id.as_str()),
        );
        sim.inject_vpc_endpoint("eu-central-1", graph.vpc.as_deref().unwrap());

        let report = teardown_region(&sim, &fast_config(), &graph, &cancel)
            .await
            .unwrap();
        assert!(report.is_clean(), "failures: {:?}", report.failures);
        assert!(report
            .deleted
            .iter()
            .any(|(kind, _)| *kind == ResourceKind::NatGateway));
        assert!(report
            .deleted
            .iter()
            .any(|(kind, _)| *kind == ResourceKind::VpcEndpoint));
        assert!(sim
            .list_tagged("eu-central-1", id.as_str())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn hanging_nat_deletion_aborts_with_teardown_incomplete() {
        let sim = SimCloud::new().nat_deletion_hangs();
        let id = ExperimentId::from("cm-test-nat-hang");
        let cancel = CancelToken::new();
        let allocation = &allocations_for(&sim, &["eu-central-1"]).await[0];
        let graph = provision_region(&sim, &ProvisionConfig::default(), &id, allocation, &cancel)
            .await
            .unwrap();
        sim.inject_nat_gateway("eu-central-1", graph.vpc.as_deref().unwrap(), None);

        let err = teardown_region(&sim, &fast_config(), &graph, &cancel)
            .await
            .unwrap_err();
        let OrchestrationError::TeardownIncomplete {
            kind, remaining, ..
        } = err
        else {
            panic!("expected TeardownIncomplete, got {err}");
        };
        assert_eq!(kind, ResourceKind::NatGateway);
        assert_eq!(remaining.len(), 1);
        // dependent steps did not run: the VPC is still there
        assert!(!sim
            .list_tagged("eu-central-1", id.as_str())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancelled_teardown_stops_between_steps() {
        let sim = SimCloud::new();
        let id = ExperimentId::from("cm-test-teardown-cancel");
        let cancel = CancelToken::new();
        let allocation = &allocations_for(&sim, &["eu-central-1"]).await[0];
        let graph = provision_region(&sim, &ProvisionConfig::default(), &id, allocation, &cancel)
            .await
            .unwrap();

        cancel.cancel();
        let err = teardown_region(&sim, &fast_config(), &graph, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Cancelled { .. }));
    }
}

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
//! The orchestrator: drives experiments through their whole lifecycle.
//!
//! Regions carry no shared mutable state, so region-level provisioning and
//! teardown run as concurrent tasks, one per region. Within a region, all
//! steps are strictly ordered. Every graph — including partial graphs from
//! failed or cancelled region tasks — is persisted before an error is
//! surfaced, so a crash never leaves resources the store does not know
//! about.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use itertools::Itertools;

use crate::cloud::CloudProvider;
use crate::inventory::{InventoryConfiguration, RemoteExecutor, DEFAULT_ANSIBLE_USER};
use crate::records::ResourceGraph;
use crate::store::ExperimentStore;
use crate::topology::{plan, Topology, TopologyRequest};
use crate::util::CancelToken;
use crate::Region;

use super::peering::{establish_peering, PeeringConfig};
use super::provision::{provision_region, ProvisionConfig};
use super::teardown::{teardown_region, TeardownConfig, TeardownReport};
use super::{Experiment, ExperimentId, LifecycleState, OrchestrationError};

/// Ties the cloud capability and the store together and owns the tunables.
pub struct Orchestrator {
    provider: Arc<dyn CloudProvider>,
    store: Arc<dyn ExperimentStore>,
    provision_config: ProvisionConfig,
    peering_config: PeeringConfig,
    teardown_config: TeardownConfig,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn CloudProvider>, store: Arc<dyn ExperimentStore>) -> Self {
        Self {
            provider,
            store,
            provision_config: ProvisionConfig::default(),
            peering_config: PeeringConfig::default(),
            teardown_config: TeardownConfig::default(),
        }
    }

    pub fn provision_config(mut self, config: ProvisionConfig) -> Self {
        self.provision_config = config;
        self
    }

    pub fn peering_config(mut self, config: PeeringConfig) -> Self {
        self.peering_config = config;
        self
    }

    pub fn teardown_config(mut self, config: TeardownConfig) -> Self {
        self.teardown_config = config;
        self
    }

    pub fn store(&self) -> &dyn ExperimentStore {
        self.store.as_ref()
    }

    /// Plan the topology and persist a fresh experiment in state `PLANNED`.
    pub async fn create_experiment(
        &self,
        request: &TopologyRequest,
        peered: bool,
    ) -> Result<(Experiment, Topology), OrchestrationError> {
        let topology = plan(self.provider.as_ref(), request).await?;
        let experiment = Experiment::new(request.regions.clone(), request.cidr, peered);
        self.store.add_experiment(&experiment)?;
        for allocation in &topology.allocations {
            self.store.add_allocation(&experiment.id, allocation)?;
        }
        log::info!(
            "created {} experiment {} over {:?}",
            experiment.kind,
            experiment.id,
            experiment.regions
        );
        Ok((experiment, topology))
    }

    /// Provision every region of the experiment concurrently, then establish
    /// the peering mesh if private addressing was requested.
    ///
    /// On a partial failure the experiment stays in `PROVISIONING` with all
    /// partial graphs persisted; `teardown` cleans them up.
    pub async fn provision(
        &self,
        id: &ExperimentId,
        cancel: &CancelToken,
    ) -> Result<Vec<ResourceGraph>, OrchestrationError> {
        let mut experiment = self.store.get_experiment(id)?;
        experiment.advance(LifecycleState::Provisioning)?;
        self.store.update_experiment(&experiment)?;

        let allocations = self.store.get_allocations(id)?;
        let results: Vec<(Region, Result<ResourceGraph, OrchestrationError>)> = {
            let mut scope = unsafe { async_scoped::TokioScope::create() };
            for allocation in allocations {
                let provider = Arc::clone(&self.provider);
                let config = self.provision_config.clone();
                let id = id.clone();
                let cancel = cancel.clone();
                scope.spawn(async move {
                    let result =
                        provision_region(provider.as_ref(), &config, &id, &allocation, &cancel)
                            .await;
                    (allocation.region.clone(), result)
                });
            }
            scope
                .collect()
                .await
                .into_iter()
                .map(|joined| joined.expect("region provisioning task panicked"))
                .collect()
        };

        let mut graphs = Vec::new();
        let mut first_error = None;
        for (region, result) in results {
            match result {
                Ok(graph) => {
                    self.store.put_graph(id, &graph)?;
                    graphs.push(graph);
                }
                Err(error) => {
                    // record whatever was created, so teardown can find it
                    if let Some(graph) = error.partial_graph() {
                        self.store.put_graph(id, graph)?;
                    }
                    log::error!("[{region}] provisioning failed: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        if experiment.peered && graphs.len() > 1 {
            // sequential: the links share main route tables
            for (i, j) in (0..graphs.len()).tuple_combinations() {
                let link = establish_peering(
                    self.provider.as_ref(),
                    &self.peering_config,
                    id,
                    &graphs[i],
                    &graphs[j],
                )
                .await?;
                self.store.add_peering(id, &link)?;
            }
        }

        experiment.advance(LifecycleState::Provisioned)?;
        self.store.update_experiment(&experiment)?;
        Ok(graphs)
    }

    /// Probe every host over the remote-execution capability until the whole
    /// fleet answers, then mark the experiment `INSTANCES_READY`.
    pub async fn wait_instances_ready(
        &self,
        id: &ExperimentId,
        remote: &dyn RemoteExecutor,
        forks: usize,
    ) -> Result<(), OrchestrationError> {
        let mut experiment = self.store.get_experiment(id)?;
        experiment.advance(LifecycleState::InstancesReady)?;
        remote.run("all", "ping", "", forks).await?;
        self.store.update_experiment(&experiment)?;
        Ok(())
    }

    /// Run the measurement module on all hosts and mark the experiment
    /// `RUNNING`. Sets the start timestamp exactly once.
    pub async fn start(
        &self,
        id: &ExperimentId,
        remote: &dyn RemoteExecutor,
        module: &str,
        args: &str,
        forks: usize,
    ) -> Result<(), OrchestrationError> {
        let mut experiment = self.store.get_experiment(id)?;
        experiment.advance(LifecycleState::Running)?;
        remote.run("all", module, args, forks).await?;
        experiment.started_at = Some(Utc::now());
        self.store.update_experiment(&experiment)?;
        Ok(())
    }

    /// Fetch the measurement output from all hosts into `destination` and
    /// mark the experiment `RETRIEVED`.
    pub async fn retrieve(
        &self,
        id: &ExperimentId,
        remote: &dyn RemoteExecutor,
        source: &str,
        destination: &Path,
        forks: usize,
    ) -> Result<(), OrchestrationError> {
        let mut experiment = self.store.get_experiment(id)?;
        experiment.advance(LifecycleState::Retrieved)?;
        remote
            .run(
                "all",
                "fetch",
                &format!("src={source} dest={} flat=no", destination.display()),
                forks,
            )
            .await?;
        self.store.update_experiment(&experiment)?;
        Ok(())
    }

    /// Tear down every region concurrently and verify that nothing tagged
    /// with the experiment id is left, then delete the stored rows.
    ///
    /// Valid from any non-terminal state; re-runnable after a failure since
    /// all deletion steps are idempotent.
    pub async fn teardown(
        &self,
        id: &ExperimentId,
        cancel: &CancelToken,
    ) -> Result<Vec<TeardownReport>, OrchestrationError> {
        let mut experiment = self.store.get_experiment(id)?;
        experiment.advance(LifecycleState::Deleting)?;
        self.store.update_experiment(&experiment)?;

        let graphs = self.store.get_graphs(id)?;
        let results: Vec<Result<TeardownReport, OrchestrationError>> = {
            let mut scope = unsafe { async_scoped::TokioScope::create() };
            for graph in &graphs {
                let provider = Arc::clone(&self.provider);
                let config = self.teardown_config.clone();
                let cancel = cancel.clone();
                scope.spawn(async move {
                    teardown_region(provider.as_ref(), &config, graph, &cancel).await
                });
            }
            scope
                .collect()
                .await
                .into_iter()
                .map(|joined| joined.expect("region teardown task panicked"))
                .collect()
        };

        let mut reports = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(error) => {
                    log::error!("teardown failed: {error}");
                    first_error.get_or_insert(error);
                }
            }
        }
        if let Some(error) = first_error {
            // experiment stays in DELETING; a later run picks it up again
            return Err(error);
        }

        // nothing tagged with the experiment id may survive
        for graph in &graphs {
            let leftovers = self
                .provider
                .list_tagged(&graph.region, id.as_str())
                .await?;
            if let Some((kind, _)) = leftovers.first() {
                return Err(OrchestrationError::TeardownIncomplete {
                    region: graph.region.clone(),
                    kind: *kind,
                    remaining: leftovers.into_iter().map(|(_, id)| id).collect(),
                });
            }
        }

        self.store.remove_experiment_rows(id)?;
        experiment.ended_at = Some(Utc::now());
        experiment.advance(LifecycleState::Deleted)?;
        self.store.update_experiment(&experiment)?;
        Ok(reports)
    }

    /// Tear down all experiments that are not yet deleted, then wipe the
    /// store.
    pub async fn purge(&self, cancel: &CancelToken) -> Result<(), OrchestrationError> {
        for experiment in self.store.get_experiments()? {
            if experiment.state.is_terminal() {
                continue;
            }
            log::info!("purging experiment {}", experiment.id);
            self.teardown(&experiment.id, cancel).await?;
        }
        self.store.purge()?;
        Ok(())
    }

    pub fn state(&self, id: &ExperimentId) -> Result<LifecycleState, OrchestrationError> {
        Ok(self.store.get_experiment(id)?.state)
    }

    /// Write the ansible-style inventory for the experiment's hosts.
    pub fn write_inventory(
        &self,
        id: &ExperimentId,
        path: PathBuf,
    ) -> Result<InventoryConfiguration, OrchestrationError> {
        let mut inventory = InventoryConfiguration::new(path);
        for (region, instance) in self.store.get_instances(id)? {
            if let Some(public_ip) = instance.public_ip {
                inventory.add_host(
                    &instance.id,
                    &region,
                    &public_ip.to_string(),
                    Some(DEFAULT_ANSIBLE_USER),
                    None,
                );
            }
        }
        inventory
            .make_inventory()
            .map_err(crate::inventory::RemoteError::from)?;
        Ok(inventory)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::experiments::peering::PeeringConfig;
    use crate::experiments::teardown::TeardownConfig;
    use crate::inventory::{RemoteError, RemoteOutput};
    use crate::sim::SimCloud;
    use crate::store::JsonFileStore;
    use async_trait::async_trait;

    fn temp_store(name: &str) -> Arc<JsonFileStore> {
        let path = std::env::temp_dir().join(format!(
            "cirrus-runner-{name}-{}.json",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        Arc::new(JsonFileStore::open(path).unwrap())
    }

    fn orchestrator(sim: SimCloud, store_name: &str) -> Orchestrator {
        Orchestrator::new(Arc::new(sim), temp_store(store_name))
            .peering_config(PeeringConfig {
                visibility_attempts: 4,
                visibility_base_delay: Duration::from_millis(1),
                visibility_max_delay: Duration::from_millis(2),
                activation_timeout: Duration::from_millis(10),
            })
            .teardown_config(TeardownConfig {
                poll_interval: Duration::from_millis(1),
                deletion_timeout: Duration::from_millis(20),
            })
    }

    fn two_region_request() -> TopologyRequest {
        TopologyRequest {
            regions: vec!["eu-central-1".to_string(), "eu-west-2".to_string()],
            cidr: "10.0.0.0/16".parse().unwrap(),
            ..Default::default()
        }
    }

    struct SilentRemote;

    #[async_trait]
    impl RemoteExecutor for SilentRemote {
        async fn run(
            &self,
            _host_pattern: &str,
            _module: &str,
            _args: &str,
            _forks: usize,
        ) -> Result<RemoteOutput, RemoteError> {
            Ok(RemoteOutput {
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn full_lifecycle_roundtrip() {
        let orchestrator = orchestrator(SimCloud::new(), "lifecycle");
        let cancel = CancelToken::new();
        let (experiment, topology) = orchestrator
            .create_experiment(&two_region_request(), true)
            .await
            .unwrap();
        assert_eq!(topology.allocations.len(), 2);
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Planned
        );

        let graphs = orchestrator.provision(&experiment.id, &cancel).await.unwrap();
        assert_eq!(graphs.len(), 2);
        assert!(graphs.iter().all(|g| g.is_complete(1)));
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Provisioned
        );
        assert_eq!(orchestrator.store().get_peerings(&experiment.id).unwrap().len(), 1);

        let remote = SilentRemote;
        orchestrator
            .wait_instances_ready(&experiment.id, &remote, 4)
            .await
            .unwrap();
        orchestrator
            .start(&experiment.id, &remote, "shell", "scamper -c trace", 4)
            .await
            .unwrap();
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Running
        );
        orchestrator
            .retrieve(
                &experiment.id,
                &remote,
                "/home/ubuntu/out",
                Path::new("/tmp/data"),
                4,
            )
            .await
            .unwrap();

        let reports = orchestrator.teardown(&experiment.id, &cancel).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.is_clean()));
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Deleted
        );
        assert!(orchestrator
            .store()
            .get_graphs(&experiment.id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn start_requires_instances_ready() {
        let orchestrator = orchestrator(SimCloud::new(), "early-start");
        let cancel = CancelToken::new();
        let (experiment, _) = orchestrator
            .create_experiment(&two_region_request(), false)
            .await
            .unwrap();
        orchestrator.provision(&experiment.id, &cancel).await.unwrap();

        let err = orchestrator
            .start(&experiment.id, &SilentRemote, "shell", "", 4)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidLifecycleTransition {
                from: LifecycleState::Provisioned,
                to: LifecycleState::Running,
            }
        ));
        // the stored state is untouched
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Provisioned
        );
    }

    #[tokio::test]
    async fn failed_region_keeps_its_partial_graph_for_teardown() {
        let sim = SimCloud::new().fail_on("run_instance");
        let orchestrator = orchestrator(sim, "partial");
        let cancel = CancelToken::new();
        let (experiment, _) = orchestrator
            .create_experiment(&two_region_request(), false)
            .await
            .unwrap();

        let err = orchestrator.provision(&experiment.id, &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::PartialProvisioningFailure { .. }
        ));
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Provisioning
        );
        // both regions recorded their partial graphs; force teardown works
        let graphs = orchestrator.store().get_graphs(&experiment.id).unwrap();
        assert_eq!(graphs.len(), 2);
        let reports = orchestrator.teardown(&experiment.id, &cancel).await.unwrap();
        assert!(reports.iter().all(|r| r.is_clean()));
        assert_eq!(
            orchestrator.state(&experiment.id).unwrap(),
            LifecycleState::Deleted
        );
    }

    #[tokio::test]
    async fn purge_tears_down_everything() {
        let orchestrator = orchestrator(SimCloud::new(), "purge");
        let cancel = CancelToken::new();
        let (a, _) = orchestrator
            .create_experiment(&two_region_request(), false)
            .await
            .unwrap();
        orchestrator.provision(&a.id, &cancel).await.unwrap();
        let (b, _) = orchestrator
            .create_experiment(
                &TopologyRequest {
                    regions: vec!["us-east-1".to_string()],
                    cidr: "10.1.0.0/16".parse().unwrap(),
                    ..Default::default()
                },
                false,
            )
            .await
            .unwrap();
        orchestrator.provision(&b.id, &cancel).await.unwrap();

        orchestrator.purge(&cancel).await.unwrap();
        assert!(orchestrator.store().get_experiments().unwrap().is_empty());
    }
}

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
//! Single-region walkthrough: plan, provision, and tear down one regional
//! trace testbed against the simulated cloud.

use cirrus::cloud::CloudProvider;
use cirrus::experiments::{
    provision_region, teardown_region, ExperimentId, ProvisionConfig, TeardownConfig,
};
use cirrus::sim::SimCloud;
use cirrus::topology::{plan, TopologyRequest};
use cirrus::util::CancelToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sim = SimCloud::new();
    let cancel = CancelToken::new();

    let request = TopologyRequest {
        regions: vec!["eu-central-1".to_string()],
        cidr: "10.0.0.0/16".parse()?,
        ..Default::default()
    };
    let topology = plan(&sim, &request).await?;
    println!("planned: {topology:#?}");

    let experiment = ExperimentId::generate();
    let graph = provision_region(
        &sim,
        &ProvisionConfig::default(),
        &experiment,
        &topology.allocations[0],
        &cancel,
    )
    .await?;
    println!(
        "provisioned vpc {} with instance {}",
        graph.vpc.as_deref().unwrap_or("-"),
        graph.instances[0].id
    );

    let report = teardown_region(&sim, &TeardownConfig::default(), &graph, &cancel).await?;
    println!(
        "deleted {} resources, released {:?}",
        report.deleted.len(),
        report.released_public_ips
    );
    assert!(sim
        .list_tagged("eu-central-1", experiment.as_str())
        .await?
        .is_empty());
    Ok(())
}

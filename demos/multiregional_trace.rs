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
//! Multi-region walkthrough: a peered three-region testbed driven through
//! the whole orchestrator lifecycle against the simulated cloud.

use std::sync::Arc;

use cirrus::experiments::Orchestrator;
use cirrus::sim::SimCloud;
use cirrus::store::{ExperimentStore, JsonFileStore};
use cirrus::topology::TopologyRequest;
use cirrus::util::CancelToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let provider = Arc::new(SimCloud::new());
    let store_path = std::env::temp_dir().join("cirrus-demo-store.json");
    let _ = std::fs::remove_file(&store_path);
    let store = Arc::new(JsonFileStore::open(&store_path)?);
    let orchestrator = Orchestrator::new(provider, store);
    let cancel = CancelToken::new();

    let request = TopologyRequest {
        regions: vec![
            "eu-central-1".to_string(),
            "eu-west-2".to_string(),
            "us-east-1".to_string(),
        ],
        cidr: "10.0.0.0/16".parse()?,
        ..Default::default()
    };

    let (experiment, topology) = orchestrator.create_experiment(&request, true).await?;
    println!("experiment {} spans {} regions", experiment.id, topology.allocations.len());

    let graphs = orchestrator.provision(&experiment.id, &cancel).await?;
    for graph in &graphs {
        for instance in &graph.instances {
            println!(
                "{:<16} {} public {} private {}",
                graph.region,
                instance.id,
                instance.public_ip.map(|ip| ip.to_string()).unwrap_or_default(),
                instance.private_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            );
        }
    }
    println!(
        "peering links: {}",
        orchestrator.store().get_peerings(&experiment.id)?.len()
    );

    let reports = orchestrator.teardown(&experiment.id, &cancel).await?;
    for report in reports {
        println!("{:<16} {} resources deleted", report.region, report.deleted.len());
    }
    println!("final state: {}", orchestrator.state(&experiment.id)?);

    std::fs::remove_file(&store_path)?;
    Ok(())
}

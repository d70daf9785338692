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
//! Library for provisioning, running and tearing down ephemeral multi-region
//! cloud topologies used as network-measurement testbeds.

/// Cloud region name, e.g. `eu-central-1`.
pub type Region = String;

pub mod cloud;
pub mod experiments;
pub mod inventory;
pub mod records;
pub mod sim;
pub mod store;
pub mod topology;
pub mod util;

// pub use to keep dependencies working where stuff was originally defined in this file
pub use cirrus_utils::serde::generic_hashmap as serde_generic_hashmap;

pub mod prelude {
    pub use super::{
        cloud::{CloudError, CloudProvider, ResourceKind, ResourceState},
        experiments::{
            establish_peering, provision_region, teardown_region, Experiment, ExperimentId,
            LifecycleState, OrchestrationError, Orchestrator,
        },
        inventory::{AnsibleRunner, InventoryConfiguration, RemoteExecutor},
        records::{PeeringLink, ResourceGraph},
        sim::SimCloud,
        store::{ExperimentStore, JsonFileStore},
        topology::{plan, Topology, TopologyRequest},
        Region,
    };
}

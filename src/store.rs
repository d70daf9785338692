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
//! Persistent bookkeeping for experiments.
//!
//! The store is the system of record across process restarts: experiments,
//! their planned allocations, the per-region resource graphs, and the
//! peering links. Writes are row-level (keyed by experiment and region) so
//! that concurrent region tasks never lose each other's resource ids.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::experiments::{Experiment, ExperimentId};
use crate::records::{InstanceRecord, PeeringLink, ResourceGraph};
use crate::topology::RegionAllocation;
use crate::Region;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("experiment store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt experiment store: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("csv export failed: {0}")]
    Csv(#[from] csv::Error),
    #[error("unknown experiment {0}")]
    UnknownExperiment(String),
}

/// Read/write contract towards the persistent store.
///
/// Implementations must support concurrent calls from multiple region tasks
/// without corrupting experiment records; per-row writes are sufficient, no
/// multi-row transactions are required.
pub trait ExperimentStore: Send + Sync {
    fn add_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;
    /// Overwrite the experiment row (state, timestamps).
    fn update_experiment(&self, experiment: &Experiment) -> Result<(), StoreError>;
    fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment, StoreError>;
    fn get_experiments(&self) -> Result<Vec<Experiment>, StoreError>;

    fn add_allocation(
        &self,
        id: &ExperimentId,
        allocation: &RegionAllocation,
    ) -> Result<(), StoreError>;
    fn get_allocations(&self, id: &ExperimentId) -> Result<Vec<RegionAllocation>, StoreError>;

    /// Insert or replace the resource graph of one region.
    fn put_graph(&self, id: &ExperimentId, graph: &ResourceGraph) -> Result<(), StoreError>;
    fn get_graphs(&self, id: &ExperimentId) -> Result<Vec<ResourceGraph>, StoreError>;

    fn add_peering(&self, id: &ExperimentId, link: &PeeringLink) -> Result<(), StoreError>;
    fn get_peerings(&self, id: &ExperimentId) -> Result<Vec<PeeringLink>, StoreError>;

    /// All recorded instances of the experiment, with their region.
    fn get_instances(&self, id: &ExperimentId)
        -> Result<Vec<(Region, InstanceRecord)>, StoreError>;

    /// Drop allocations, graphs and peerings; keep the experiment row.
    fn remove_experiment_rows(&self, id: &ExperimentId) -> Result<(), StoreError>;
    /// Drop the experiment and all of its rows.
    fn remove_experiment(&self, id: &ExperimentId) -> Result<(), StoreError>;
    /// Drop everything.
    fn purge(&self) -> Result<(), StoreError>;
}

/// Peering links of one experiment, keyed by (requester, accepter) region.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeeringTable(
    #[serde(with = "cirrus_utils::serde::generic_hashmap")]
    pub  HashMap<(Region, Region), PeeringLink>,
);

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    experiments: BTreeMap<String, Experiment>,
    allocations: BTreeMap<String, Vec<RegionAllocation>>,
    graphs: BTreeMap<String, BTreeMap<Region, ResourceGraph>>,
    peerings: BTreeMap<String, PeeringTable>,
}

/// Write-through JSON store: the whole document is re-serialized on every
/// mutation. Plenty for the handful of concurrently running experiments this
/// tool manages.
pub struct JsonFileStore {
    path: PathBuf,
    file: Mutex<StoreFile>,
}

impl JsonFileStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = if path.is_file() {
            serde_json::from_str(&std::fs::read_to_string(&path)?)?
        } else {
            StoreFile::default()
        };
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut StoreFile) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut file = self.file.lock().unwrap();
        let result = f(&mut file)?;
        let serialized = serde_json::to_string_pretty(&*file)?;
        let mut out = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        out.write_all(serialized.as_bytes())?;
        Ok(result)
    }

    fn read<T>(&self, f: impl FnOnce(&StoreFile) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let file = self.file.lock().unwrap();
        f(&file)
    }

    /// Export the instance table as CSV, mirroring the INSTANCES listing of
    /// the command line.
    pub fn export_instances_csv<W: Write>(&self, writer: W) -> Result<(), StoreError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record([
            "experiment_id",
            "region",
            "availability_zone",
            "instance_id",
            "machine_type",
            "public_ip",
            "private_ip",
            "key_pair",
        ])?;
        self.read(|file| {
            for (experiment_id, regions) in &file.graphs {
                for (region, graph) in regions {
                    for instance in &graph.instances {
                        let public_ip =
                            instance.public_ip.map(|ip| ip.to_string()).unwrap_or_default();
                        let private_ip =
                            instance.private_ip.map(|ip| ip.to_string()).unwrap_or_default();
                        csv_writer.write_record([
                            experiment_id.as_str(),
                            region.as_str(),
                            instance.az.as_str(),
                            instance.id.as_str(),
                            instance.machine_type.as_str(),
                            public_ip.as_str(),
                            private_ip.as_str(),
                            instance.key_pair.as_deref().unwrap_or_default(),
                        ])?;
                    }
                }
            }
            Ok(())
        })?;
        csv_writer.flush()?;
        Ok(())
    }
}

impl ExperimentStore for JsonFileStore {
    fn add_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.mutate(|file| {
            file.experiments
                .insert(experiment.id.to_string(), experiment.clone());
            Ok(())
        })
    }

    fn update_experiment(&self, experiment: &Experiment) -> Result<(), StoreError> {
        self.mutate(|file| {
            let key = experiment.id.to_string();
            if !file.experiments.contains_key(&key) {
                return Err(StoreError::UnknownExperiment(key));
            }
            file.experiments.insert(key, experiment.clone());
            Ok(())
        })
    }

    fn get_experiment(&self, id: &ExperimentId) -> Result<Experiment, StoreError> {
        self.read(|file| {
            file.experiments
                .get(id.as_str())
                .cloned()
                .ok_or_else(|| StoreError::UnknownExperiment(id.to_string()))
        })
    }

    fn get_experiments(&self) -> Result<Vec<Experiment>, StoreError> {
        self.read(|file| Ok(file.experiments.values().cloned().collect()))
    }

    fn add_allocation(
        &self,
        id: &ExperimentId,
        allocation: &RegionAllocation,
    ) -> Result<(), StoreError> {
        self.mutate(|file| {
            file.allocations
                .entry(id.to_string())
                .or_default()
                .push(allocation.clone());
            Ok(())
        })
    }

    fn get_allocations(&self, id: &ExperimentId) -> Result<Vec<RegionAllocation>, StoreError> {
        self.read(|file| Ok(file.allocations.get(id.as_str()).cloned().unwrap_or_default()))
    }

    fn put_graph(&self, id: &ExperimentId, graph: &ResourceGraph) -> Result<(), StoreError> {
        self.mutate(|file| {
            file.graphs
                .entry(id.to_string())
                .or_default()
                .insert(graph.region.clone(), graph.clone());
            Ok(())
        })
    }

    fn get_graphs(&self, id: &ExperimentId) -> Result<Vec<ResourceGraph>, StoreError> {
        self.read(|file| {
            Ok(file
                .graphs
                .get(id.as_str())
                .map(|regions| regions.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn add_peering(&self, id: &ExperimentId, link: &PeeringLink) -> Result<(), StoreError> {
        self.mutate(|file| {
            file.peerings.entry(id.to_string()).or_default().0.insert(
                (link.requester.region.clone(), link.accepter.region.clone()),
                link.clone(),
            );
            Ok(())
        })
    }

    fn get_peerings(&self, id: &ExperimentId) -> Result<Vec<PeeringLink>, StoreError> {
        self.read(|file| {
            Ok(file
                .peerings
                .get(id.as_str())
                .map(|table| table.0.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn get_instances(
        &self,
        id: &ExperimentId,
    ) -> Result<Vec<(Region, InstanceRecord)>, StoreError> {
        self.read(|file| {
            Ok(file
                .graphs
                .get(id.as_str())
                .map(|regions| {
                    regions
                        .iter()
                        .flat_map(|(region, graph)| {
                            graph
                                .instances
                                .iter()
                                .map(|instance| (region.clone(), instance.clone()))
                        })
                        .collect()
                })
                .unwrap_or_default())
        })
    }

    fn remove_experiment_rows(&self, id: &ExperimentId) -> Result<(), StoreError> {
        self.mutate(|file| {
            file.allocations.remove(id.as_str());
            file.graphs.remove(id.as_str());
            file.peerings.remove(id.as_str());
            Ok(())
        })
    }

    fn remove_experiment(&self, id: &ExperimentId) -> Result<(), StoreError> {
        self.mutate(|file| {
            file.experiments.remove(id.as_str());
            file.allocations.remove(id.as_str());
            file.graphs.remove(id.as_str());
            file.peerings.remove(id.as_str());
            Ok(())
        })
    }

    fn purge(&self) -> Result<(), StoreError> {
        self.mutate(|file| {
            *file = StoreFile::default();
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::records::SubnetRecord;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cirrus-store-{name}-{}.json", std::process::id()))
    }

    fn sample_graph(id: &ExperimentId, region: &str) -> ResourceGraph {
        let mut graph = ResourceGraph::new(id.as_str(), region, "10.0.0.0/24".parse().unwrap());
        graph.vpc = Some("vpc-1".to_string());
        graph.subnets.push(SubnetRecord {
            id: "subnet-1".to_string(),
            az: format!("{region}a"),
            cidr: "10.0.0.0/24".parse().unwrap(),
            route_table_association: None,
        });
        graph.instances.push(InstanceRecord {
            id: "i-1".to_string(),
            az: format!("{region}a"),
            subnet: "subnet-1".to_string(),
            machine_type: "t3.small".to_string(),
            key_pair: Some("id_rsa".to_string()),
            public_ip: Some("52.0.0.1".parse().unwrap()),
            private_ip: Some("10.0.0.10".parse().unwrap()),
        });
        graph
    }

    #[test]
    fn experiments_survive_a_reopen() {
        let path = temp_path("reopen");
        let _ = std::fs::remove_file(&path);
        let experiment = Experiment::new(
            vec!["eu-central-1".to_string()],
            "10.0.0.0/16".parse().unwrap(),
            false,
        );
        {
            let store = JsonFileStore::open(&path).unwrap();
            store.add_experiment(&experiment).unwrap();
            store
                .put_graph(&experiment.id, &sample_graph(&experiment.id, "eu-central-1"))
                .unwrap();
        }

        let store = JsonFileStore::open(&path).unwrap();
        let loaded = store.get_experiment(&experiment.id).unwrap();
        assert_eq!(loaded, experiment);
        assert_eq!(store.get_graphs(&experiment.id).unwrap().len(), 1);
        let instances = store.get_instances(&experiment.id).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].0, "eu-central-1");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn unknown_experiment_is_an_error() {
        let path = temp_path("unknown");
        let _ = std::fs::remove_file(&path);
        let store = JsonFileStore::open(&path).unwrap();
        let err = store.get_experiment(&ExperimentId::from("cm-nope")).unwrap_err();
        assert!(matches!(err, StoreError::UnknownExperiment(_)));
        let experiment = Experiment::new(
            vec!["eu-central-1".to_string()],
            "10.0.0.0/16".parse().unwrap(),
            false,
        );
        assert!(matches!(
            store.update_experiment(&experiment),
            Err(StoreError::UnknownExperiment(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn removing_rows_keeps_the_experiment() {
        let path = temp_path("rows");
        let _ = std::fs::remove_file(&path);
        let store = JsonFileStore::open(&path).unwrap();
        let experiment = Experiment::new(
            vec!["eu-central-1".to_string()],
            "10.0.0.0/16".parse().unwrap(),
            false,
        );
        store.add_experiment(&experiment).unwrap();
        store
            .put_graph(&experiment.id, &sample_graph(&experiment.id, "eu-central-1"))
            .unwrap();

        store.remove_experiment_rows(&experiment.id).unwrap();
        assert!(store.get_graphs(&experiment.id).unwrap().is_empty());
        assert!(store.get_experiment(&experiment.id).is_ok());

        store.remove_experiment(&experiment.id).unwrap();
        assert!(store.get_experiment(&experiment.id).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn graphs_are_replaced_per_region() {
        let path = temp_path("replace");
        let _ = std::fs::remove_file(&path);
        let store = JsonFileStore::open(&path).unwrap();
        let id = ExperimentId::from("cm-replace");
        let mut graph = sample_graph(&id, "eu-central-1");
        store.put_graph(&id, &graph).unwrap();
        graph.security_group = Some("sg-1".to_string());
        store.put_graph(&id, &graph).unwrap();

        let graphs = store.get_graphs(&id).unwrap();
        assert_eq!(graphs.len(), 1);
        assert_eq!(graphs[0].security_group.as_deref(), Some("sg-1"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn csv_export_lists_all_instances() {
        let path = temp_path("csv");
        let _ = std::fs::remove_file(&path);
        let store = JsonFileStore::open(&path).unwrap();
        let id = ExperimentId::from("cm-csv");
        store.put_graph(&id, &sample_graph(&id, "eu-central-1")).unwrap();

        let mut out = Vec::new();
        store.export_instances_csv(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "experiment_id,region,availability_zone,instance_id,machine_type,public_ip,private_ip,key_pair"
        );
        assert_eq!(
            lines.next().unwrap(),
            "cm-csv,eu-central-1,eu-central-1a,i-1,t3.small,52.0.0.1,10.0.0.10,id_rsa"
        );
        let _ = std::fs::remove_file(&path);
    }
}

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
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use ipnet::Ipv4Net;

use cirrus::experiments::{ExperimentId, Orchestrator};
use cirrus::inventory::AnsibleRunner;
use cirrus::sim::SimCloud;
use cirrus::store::{ExperimentStore, JsonFileStore};
use cirrus::topology::{MachineTypes, TopologyRequest};
use cirrus::util::{self, CancelToken};
use cirrus_utils::other::notify;

#[derive(Parser, Debug)]
#[command(about = "Create and manage cloud measurement experiments", long_about = None)]
struct Args {
    /// Path of the experiment store.
    #[arg(long, default_value = "./experiments.json")]
    store: PathBuf,
    /// Path of the generated host inventory.
    #[arg(long, default_value = "./inventory.cfg")]
    inventory: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Plan and provision a new experiment.
    Create {
        /// Comma-separated list of regions to use.
        #[arg(short, long, default_value = "eu-central-1")]
        regions: String,
        /// Address block to carve the per-AZ subnets from.
        #[arg(short, long, default_value = "10.0.0.0/16")]
        cidr: Ipv4Net,
        /// Optional JSON object mapping regions to preferred AZ lists.
        #[arg(long)]
        az_mapping: Option<String>,
        /// Optional JSON object mapping regions to machine types.
        #[arg(long)]
        machine_type_mapping: Option<String>,
        /// Machine type for all regions without an explicit mapping.
        #[arg(long)]
        machine_type: Option<String>,
        /// Connect the regional VPCs privately (peering mesh).
        #[arg(long)]
        peered: bool,
        /// Key pair installed on the instances.
        #[arg(short, long, default_value = "id_rsa")]
        key_id: String,
    },
    /// List all experiments.
    List,
    /// List all instances.
    Instances {
        /// Print as CSV instead of a table.
        #[arg(long)]
        csv: bool,
    },
    /// Print the lifecycle state of an experiment.
    State { experiment_id: String },
    /// Wait until every host of the experiment answers remote commands.
    Ready {
        experiment_id: String,
        #[arg(short, long, default_value_t = 10)]
        forks: usize,
    },
    /// Run the measurement module on all hosts.
    Start {
        experiment_id: String,
        /// Remote module to execute.
        #[arg(short, long, default_value = "shell")]
        module: String,
        /// Arguments passed to the module.
        #[arg(short, long, default_value = "")]
        args: String,
        #[arg(short, long, default_value_t = 10)]
        forks: usize,
    },
    /// Retrieve the measurement output from all hosts.
    Retrieve {
        experiment_id: String,
        /// Remote path of the measurement output.
        #[arg(short, long, default_value = "/home/ubuntu/out")]
        source: String,
        /// Local directory for the retrieved data.
        #[arg(short, long, default_value = "./data/")]
        data_root: PathBuf,
        #[arg(short, long, default_value_t = 10)]
        forks: usize,
    },
    /// Tear down an experiment and delete its resources.
    Delete { experiment_id: String },
    /// Tear down all experiments and wipe the store.
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    util::init_logging();
    let args = Args::parse();

    // the orchestrator runs against the simulated provider here; a real
    // provider binding plugs into the same capability interface
    let provider = Arc::new(SimCloud::new());
    let store = Arc::new(
        JsonFileStore::open(&args.store)
            .with_context(|| format!("cannot open store {}", args.store.display()))?,
    );
    let orchestrator =
        Orchestrator::new(provider, Arc::clone(&store) as Arc<dyn ExperimentStore>);
    let cancel = CancelToken::new();

    match args.command {
        Command::Create {
            regions,
            cidr,
            az_mapping,
            machine_type_mapping,
            machine_type,
            peered,
            key_id,
        } => {
            let request = TopologyRequest {
                regions: regions.split(',').map(|r| r.trim().to_string()).collect(),
                az_mapping: parse_json_mapping(az_mapping.as_deref())?,
                machine_types: MachineTypes {
                    global: machine_type,
                    per_region: parse_json_mapping(machine_type_mapping.as_deref())?,
                },
                cidr,
            };
            let orchestrator = orchestrator.provision_config(cirrus::experiments::ProvisionConfig {
                key_pair: Some(key_id),
                ..Default::default()
            });

            let (experiment, topology) = orchestrator.create_experiment(&request, peered).await?;
            println!("created experiment {}", experiment.id);

            let bar = ProgressBar::new(topology.allocations.len() as u64);
            bar.set_style(ProgressStyle::with_template("{wide_bar} {pos}/{len} regions, {elapsed}").unwrap());
            bar.enable_steady_tick(Duration::from_millis(200));
            let graphs = orchestrator.provision(&experiment.id, &cancel).await;
            bar.finish_and_clear();

            match graphs {
                Ok(graphs) => {
                    for graph in &graphs {
                        println!(
                            "{:<16} vpc {:<14} {} instance(s)",
                            graph.region,
                            graph.vpc.as_deref().unwrap_or("-"),
                            graph.instances.len()
                        );
                    }
                    orchestrator.write_inventory(&experiment.id, args.inventory)?;
                }
                Err(e) => {
                    eprintln!(
                        "provisioning failed: {e}\nrun `cm delete {}` to clean up",
                        experiment.id
                    );
                    std::process::exit(1);
                }
            }
        }
        Command::List => {
            println!(
                "{:<36} {:<15} {:<18} {:<7} REGIONS",
                "EXPERIMENT_ID", "KIND", "STATUS", "PEERED"
            );
            for experiment in store.get_experiments()? {
                println!(
                    "{:<36} {:<15} {:<18} {:<7} {}",
                    experiment.id,
                    experiment.kind.to_string(),
                    experiment.state.to_string(),
                    experiment.peered,
                    experiment.regions.join(",")
                );
            }
        }
        Command::Instances { csv } => {
            if csv {
                store.export_instances_csv(std::io::stdout())?;
            } else {
                println!(
                    "{:<36} {:<16} {:<16} {:<14} {:<12} {:<16} PRIVATE_IP",
                    "EXPERIMENT_ID", "REGION", "AZ", "INSTANCE_ID", "MACHINE", "PUBLIC_IP"
                );
                for experiment in store.get_experiments()? {
                    for (region, instance) in store.get_instances(&experiment.id)? {
                        println!(
                            "{:<36} {:<16} {:<16} {:<14} {:<12} {:<16} {}",
                            experiment.id,
                            region,
                            instance.az,
                            instance.id,
                            instance.machine_type,
                            instance
                                .public_ip
                                .map(|ip| ip.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                            instance
                                .private_ip
                                .map(|ip| ip.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                        );
                    }
                }
            }
        }
        Command::State { experiment_id } => {
            let state = orchestrator.state(&ExperimentId::from(experiment_id))?;
            println!("{state}");
        }
        Command::Ready {
            experiment_id,
            forks,
        } => {
            let id = ExperimentId::from(experiment_id);
            orchestrator.write_inventory(&id, args.inventory.clone())?;
            let remote = AnsibleRunner::new(args.inventory);
            orchestrator.wait_instances_ready(&id, &remote, forks).await?;
            println!("all hosts up");
        }
        Command::Start {
            experiment_id,
            module,
            args: module_args,
            forks,
        } => {
            let id = ExperimentId::from(experiment_id);
            let remote = AnsibleRunner::new(args.inventory);
            orchestrator
                .start(&id, &remote, &module, &module_args, forks)
                .await?;
            println!("experiment {id} running");
        }
        Command::Retrieve {
            experiment_id,
            source,
            data_root,
            forks,
        } => {
            let id = ExperimentId::from(experiment_id);
            std::fs::create_dir_all(&data_root)?;
            let remote = AnsibleRunner::new(args.inventory);
            orchestrator
                .retrieve(&id, &remote, &source, &data_root, forks)
                .await?;
            println!("data retrieved to {}", data_root.display());
        }
        Command::Delete { experiment_id } => {
            let id = ExperimentId::from(experiment_id);
            match orchestrator.teardown(&id, &cancel).await {
                Ok(reports) => {
                    for report in reports {
                        println!(
                            "{:<16} {} resource(s) deleted, released {:?}",
                            report.region,
                            report.deleted.len(),
                            report.released_public_ips
                        );
                    }
                }
                Err(e) => {
                    // leftover resources keep billing, make sure someone sees this
                    notify(format!("teardown of {id} incomplete: {e}"));
                    return Err(e.into());
                }
            }
        }
        Command::Purge => {
            orchestrator.purge(&cancel).await?;
            println!("all experiments deleted");
        }
    }
    Ok(())
}

fn parse_json_mapping<T: serde::de::DeserializeOwned>(
    json: Option<&str>,
) -> anyhow::Result<HashMap<String, T>> {
    match json {
        None => Ok(HashMap::new()),
        Some(text) => serde_json::from_str(text).context("cannot parse JSON mapping"),
    }
}

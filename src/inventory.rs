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
//! Host inventory and remote command execution.
//!
//! Provisioned hosts are grouped per region into an ansible-style inventory
//! file; experiment modules then run against host patterns through the
//! [`RemoteExecutor`] capability. The orchestrator itself never interprets
//! module output, it only cares about success or failure.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

/// Login user baked into the measurement images.
pub const DEFAULT_ANSIBLE_USER: &str = "ubuntu";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("module {module} failed with status {status}: {stderr}")]
    ModuleFailed {
        module: String,
        status: i32,
        stderr: String,
    },
}

/// Output of one remote module run.
#[derive(Debug, Clone)]
pub struct RemoteOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Capability to run a module against a host pattern.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(
        &self,
        host_pattern: &str,
        module: &str,
        args: &str,
        forks: usize,
    ) -> Result<RemoteOutput, RemoteError>;
}

/// One host entry of the inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryHost {
    pub host_id: String,
    pub public_ip: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Ansible-style inventory grouped per region.
///
/// The rendered format is one `[region]` section per region (dashes become
/// underscores) with one host line each:
/// `<ip> ansible_user=<user> ansible_password=<password> # host_id=<id>`.
#[derive(Debug)]
pub struct InventoryConfiguration {
    path: PathBuf,
    pub items: BTreeMap<String, Vec<InventoryHost>>,
}

impl InventoryConfiguration {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Add a host to its region group.
    pub fn add_host(
        &mut self,
        host_id: &str,
        region: &str,
        public_ip: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) {
        self.items
            .entry(region.to_string())
            .or_default()
            .push(InventoryHost {
                host_id: host_id.to_string(),
                public_ip: public_ip.to_string(),
                user: user.map(|u| u.to_string()),
                password: password.map(|p| p.to_string()),
            });
    }

    fn render(&self) -> String {
        let mut text = String::new();
        for (region, hosts) in &self.items {
            text.push_str(&format!("\n[{}]\n", region.replace('-', "_")));
            for host in hosts {
                text.push_str(&host.public_ip);
                if let Some(user) = &host.user {
                    text.push_str(&format!(" ansible_user={user}"));
                }
                if let Some(password) = &host.password {
                    text.push_str(&format!(" ansible_password={password}"));
                }
                text.push_str(&format!(" # host_id={}\n", host.host_id));
            }
        }
        text
    }

    /// Write the inventory file, overwriting an existing one.
    pub fn make_inventory(&self) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&self.path)?;
        file.write_all(self.render().as_bytes())
    }
}

/// Runs modules through the `ansible` command-line tool against a written
/// inventory file.
pub struct AnsibleRunner {
    inventory: PathBuf,
}

impl AnsibleRunner {
    pub fn new(inventory: impl Into<PathBuf>) -> Self {
        Self {
            inventory: inventory.into(),
        }
    }
}

#[async_trait]
impl RemoteExecutor for AnsibleRunner {
    async fn run(
        &self,
        host_pattern: &str,
        module: &str,
        args: &str,
        forks: usize,
    ) -> Result<RemoteOutput, RemoteError> {
        let mut command = Command::new("ansible");
        command
            .arg(host_pattern)
            .arg("-i")
            .arg(&self.inventory)
            .args(["-m", module])
            .args(["-f", &forks.to_string()])
            .stdin(Stdio::null());
        if !args.is_empty() {
            command.args(["-a", args]);
        }
        log::debug!("running ansible module {module} against {host_pattern}");
        let output = command.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            Ok(RemoteOutput { stdout, stderr })
        } else {
            Err(RemoteError::ModuleFailed {
                module: module.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_inventory(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cirrus-inventory-{name}-{}.cfg", std::process::id()))
    }

    #[test]
    fn hosts_group_by_region() {
        let mut ic = InventoryConfiguration::new(temp_inventory("group1"));
        ic.add_host("host_id1", "region-1", "0.0.0.0", Some("user_1"), Some("password"));
        assert_eq!(ic.items.len(), 1);

        ic.add_host("host_id2", "region-2", "0.0.0.1", None, None);
        assert_eq!(ic.items.len(), 2);
    }

    #[test]
    fn hosts_in_the_same_region_share_a_group() {
        let mut ic = InventoryConfiguration::new(temp_inventory("group2"));
        ic.add_host("host_id1", "region-1", "0.0.0.0", Some("user_1"), Some("password"));
        ic.add_host("host_id2", "region-1", "0.0.0.1", None, None);
        assert_eq!(ic.items.len(), 1);

        ic.add_host("host_id3", "region-2", "0.0.0.2", None, None);
        assert_eq!(ic.items.len(), 2);
        assert_eq!(ic.items["region-1"].len(), 2);
    }

    #[test]
    fn single_group_renders_exactly() {
        let path = temp_inventory("render1");
        let mut ic = InventoryConfiguration::new(&path);
        ic.add_host("id_1", "region-1", "ip_1", Some("user_1"), Some("password_1"));
        ic.add_host("id_2", "region-1", "ip_2", Some("user_1"), Some("password_1"));
        ic.add_host("id_3", "region-1", "ip_3", Some("user_2"), None);
        ic.make_inventory().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let expected = "\n[region_1]\n\
                        ip_1 ansible_user=user_1 ansible_password=password_1 # host_id=id_1\n\
                        ip_2 ansible_user=user_1 ansible_password=password_1 # host_id=id_2\n\
                        ip_3 ansible_user=user_2 # host_id=id_3\n";
        assert_eq!(text, expected);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn multiple_groups_render_exactly() {
        let path = temp_inventory("render2");
        let mut ic = InventoryConfiguration::new(&path);
        ic.add_host("id_1", "region-1", "ip_1", Some("user_1"), Some("password_1"));
        ic.add_host("id_2", "region-1", "ip_2", Some("user_1"), Some("password_1"));
        ic.add_host("id_3", "region-2", "ip_3", Some("user_3"), Some("password_2"));
        ic.make_inventory().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let expected = "\n[region_1]\n\
                        ip_1 ansible_user=user_1 ansible_password=password_1 # host_id=id_1\n\
                        ip_2 ansible_user=user_1 ansible_password=password_1 # host_id=id_2\n\
                        \n[region_2]\n\
                        ip_3 ansible_user=user_3 ansible_password=password_2 # host_id=id_3\n";
        assert_eq!(text, expected);
        std::fs::remove_file(&path).unwrap();
    }
}

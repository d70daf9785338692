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
//! Module implementing the experiment lifecycle: provisioning, peering,
//! teardown, and the state machine tying them together.

pub mod peering;
pub mod provision;
pub mod runner;
pub mod teardown;

pub use peering::*;
pub use provision::*;
pub use runner::*;
pub use teardown::*;

use std::fmt;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::{CloudError, ResourceId, ResourceKind, ResourceState};
use crate::inventory::RemoteError;
use crate::records::ResourceGraph;
use crate::store::StoreError;
use crate::topology::TopologyError;
use crate::Region;

/// Opaque unique experiment identifier; generated once, immutable, and used
/// as the tag correlating all cloud resources of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    /// Generate a fresh id from the current timestamp plus a random suffix.
    pub fn generate() -> Self {
        Self(format!(
            "cm-{}-{:04x}",
            cirrus_utils::other::get_timestamp(),
            rand::thread_rng().gen::<u16>()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExperimentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ExperimentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Whether an experiment spans one or several regions. Purely derived from
/// the region list; both kinds share all code paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TopologyKind {
    Regional,
    Multiregional,
}

/// The lifecycle states of an experiment.
///
/// Only forward transitions are valid; `Deleting`/`Deleted` are reachable
/// from every non-terminal state so that a partially provisioned or running
/// experiment can be force-torn-down.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum_macros::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Planned,
    Provisioning,
    Provisioned,
    InstancesReady,
    Running,
    Retrieved,
    Deleting,
    Deleted,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == Self::Deleted
    }

    /// Whether `self -> next` is a valid transition.
    pub fn can_advance_to(self, next: Self) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Planned, Provisioning)
            | (Provisioning, Provisioned)
            | (Provisioned, InstancesReady)
            | (InstancesReady, Running)
            | (Running, Retrieved) => true,
            (from, Deleting) => !matches!(from, Deleting | Deleted),
            (from, Deleted) => from != Deleted,
            _ => false,
        }
    }
}

/// A single measurement experiment, the unit the orchestrator manages.
///
/// Owned exclusively by the orchestrator while in memory; the store is the
/// system of record across process restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: ExperimentId,
    pub kind: TopologyKind,
    /// Requested regions, in request order, without duplicates.
    pub regions: Vec<Region>,
    pub cidr: Ipv4Net,
    /// Whether hosts talk over private (peered) addressing.
    pub peered: bool,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    /// Set once, when execution begins.
    pub started_at: Option<DateTime<Utc>>,
    /// Set once, when teardown completes.
    pub ended_at: Option<DateTime<Utc>>,
}

impl Experiment {
    pub fn new(regions: Vec<Region>, cidr: Ipv4Net, peered: bool) -> Self {
        let kind = if regions.len() > 1 {
            TopologyKind::Multiregional
        } else {
            TopologyKind::Regional
        };
        Self {
            id: ExperimentId::generate(),
            kind,
            regions,
            cidr,
            peered,
            state: LifecycleState::Planned,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    /// Advance the lifecycle, or fail with `InvalidLifecycleTransition`
    /// leaving the experiment unchanged.
    pub fn advance(&mut self, next: LifecycleState) -> Result<(), OrchestrationError> {
        if self.state.can_advance_to(next) {
            log::debug!("experiment {}: {} -> {next}", self.id, self.state);
            self.state = next;
            Ok(())
        } else {
            Err(OrchestrationError::InvalidLifecycleTransition {
                from: self.state,
                to: next,
            })
        }
    }
}

/// Errors surfaced by the orchestration layer.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// The region's remaining quota cannot hold the experiment. Raised
    /// before anything was created in that region.
    #[error("{region}: quota exceeded for {needed} additional {kind}(s)")]
    QuotaExceeded {
        region: Region,
        kind: ResourceKind,
        needed: usize,
        #[source]
        source: CloudError,
    },
    /// A mutation step failed after earlier steps succeeded. Carries the
    /// partial resource graph so the caller can tear it down.
    #[error("{region}: provisioning failed at step {step}: {source}")]
    PartialProvisioningFailure {
        region: Region,
        step: ProvisionStep,
        graph: Box<ResourceGraph>,
        #[source]
        source: CloudError,
    },
    /// The task was cancelled between steps. Any partial graph is a valid
    /// teardown input.
    #[error("{region}: task cancelled")]
    Cancelled {
        region: Region,
        graph: Option<Box<ResourceGraph>>,
    },
    /// The accepter region never saw the freshly requested peering
    /// connection within the retry budget. No routes were installed.
    #[error("peering {peering_id} not visible in {accepter_region} after {attempts} attempts")]
    PeeringPropagationTimeout {
        peering_id: ResourceId,
        accepter_region: Region,
        attempts: usize,
    },
    /// The peering connection was found in a state other than
    /// pending-acceptance (accepted or rejected externally).
    #[error("peering {peering_id} is in unexpected state {state}")]
    UnexpectedPeeringState {
        peering_id: ResourceId,
        state: ResourceState,
    },
    /// A dependent resource never reached the deleted state within its wait
    /// budget. Never ignored: leftovers keep billing.
    #[error("{region}: teardown incomplete, {kind}(s) left behind: {remaining:?}")]
    TeardownIncomplete {
        region: Region,
        kind: ResourceKind,
        remaining: Vec<ResourceId>,
    },
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidLifecycleTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
    /// An operation required a resource the graph does not record.
    #[error("{region}: resource graph is missing its {kind}")]
    IncompleteResourceGraph { region: Region, kind: ResourceKind },
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl OrchestrationError {
    /// The partial resource graph attached to the error, if any.
    pub fn partial_graph(&self) -> Option<&ResourceGraph> {
        match self {
            Self::PartialProvisioningFailure { graph, .. } => Some(graph),
            Self::Cancelled {
                graph: Some(graph), ..
            } => Some(graph),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn experiment_ids_are_unique() {
        let a = ExperimentId::generate();
        let b = ExperimentId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("cm-"));
    }

    #[test]
    fn forward_transitions_are_valid() {
        use LifecycleState::*;
        let chain = [
            Planned,
            Provisioning,
            Provisioned,
            InstancesReady,
            Running,
            Retrieved,
            Deleting,
            Deleted,
        ];
        for w in chain.windows(2) {
            assert!(w[0].can_advance_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn backward_and_skipping_transitions_are_invalid() {
        use LifecycleState::*;
        assert!(!Provisioned.can_advance_to(Planned));
        assert!(!Planned.can_advance_to(Provisioned));
        assert!(!Provisioned.can_advance_to(Running));
        assert!(!Deleted.can_advance_to(Deleting));
        assert!(!Deleting.can_advance_to(Running));
    }

    #[test]
    fn force_teardown_is_reachable_from_any_non_terminal_state() {
        for state in LifecycleState::iter() {
            let expected = !matches!(state, LifecycleState::Deleting | LifecycleState::Deleted);
            assert_eq!(state.can_advance_to(LifecycleState::Deleting), expected);
        }
    }

    #[test]
    fn invalid_advance_leaves_experiment_unchanged() {
        let mut experiment = Experiment::new(
            vec!["eu-central-1".to_string()],
            "10.0.0.0/16".parse().unwrap(),
            false,
        );
        assert_eq!(experiment.kind, TopologyKind::Regional);
        let err = experiment.advance(LifecycleState::Running).unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::InvalidLifecycleTransition {
                from: LifecycleState::Planned,
                to: LifecycleState::Running,
            }
        ));
        assert_eq!(experiment.state, LifecycleState::Planned);
    }

    #[test]
    fn multi_region_experiments_are_multiregional() {
        let experiment = Experiment::new(
            vec!["eu-central-1".to_string(), "eu-west-2".to_string()],
            "10.0.0.0/16".parse().unwrap(),
            true,
        );
        assert_eq!(experiment.kind, TopologyKind::Multiregional);
        assert_eq!(experiment.state, LifecycleState::Planned);
        assert!(experiment.started_at.is_none());
    }

    #[test]
    fn lifecycle_states_render_like_the_database_columns() {
        assert_eq!(LifecycleState::InstancesReady.to_string(), "INSTANCES_READY");
        assert_eq!(
            "PROVISIONED".parse::<LifecycleState>().unwrap(),
            LifecycleState::Provisioned
        );
    }
}

//! Cluster machine directory: enumerating members, filtering by membership
//! state and resolving ids and names to management addresses.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;

/// Membership state of a machine as reported by the gossip layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineState {
    /// Healthy, always eligible for RPCs and deployments.
    Up,
    /// Possibly failing. Still included in fan-outs and as a deployment
    /// target, with a warning.
    Suspect,
    /// Confirmed unavailable. Excluded from fan-outs and deployments.
    Down,
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineState::Up => write!(f, "UP"),
            MachineState::Suspect => write!(f, "SUSPECT"),
            MachineState::Down => write!(f, "DOWN"),
        }
    }
}

/// One member of the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineInfo {
    /// Opaque machine identifier.
    pub id: String,
    /// Human-readable machine name, unique within the cluster.
    pub name: String,
    /// Membership state.
    pub state: MachineState,
    /// Address the machine's management API listens on.
    pub management_addr: String,
    /// Address the machine is reachable on from outside the cluster, if it
    /// has one.
    pub public_addr: Option<String>,
}

impl MachineInfo {
    /// Whether the machine can serve RPCs and host deployments.
    pub fn eligible(&self) -> bool {
        matches!(self.state, MachineState::Up | MachineState::Suspect)
    }
}

/// Orders machines for deterministic placement: `UP` before `SUSPECT`
/// before `DOWN`, then by machine id ascending.
pub fn deployment_order(a: &MachineInfo, b: &MachineInfo) -> Ordering {
    fn priority(state: MachineState) -> u8 {
        match state {
            MachineState::Up => 0,
            MachineState::Suspect => 1,
            MachineState::Down => 2,
        }
    }
    priority(a.state)
        .cmp(&priority(b.state))
        .then_with(|| a.id.cmp(&b.id))
}

/// The cluster membership collaborator.
#[async_trait]
pub trait ClusterMembership: Send + Sync {
    /// Lists every known member with its current state.
    async fn list_machines(&self) -> Result<Vec<MachineInfo>, Error>;
}

/// Read-side directory over the membership service.
#[derive(Clone)]
pub struct MachineDirectory {
    membership: Arc<dyn ClusterMembership>,
}

impl fmt::Debug for MachineDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineDirectory").finish()
    }
}

impl MachineDirectory {
    /// Creates a directory over the given membership service.
    pub fn new(membership: Arc<dyn ClusterMembership>) -> Self {
        MachineDirectory { membership }
    }

    /// Lists every cluster member.
    pub async fn list(&self) -> Result<Vec<MachineInfo>, Error> {
        self.membership.list_machines().await
    }

    /// Resolves a machine by id or name.
    pub async fn inspect(&self, id_or_name: &str) -> Result<MachineInfo, Error> {
        self.list()
            .await?
            .into_iter()
            .find(|m| m.id == id_or_name || m.name == id_or_name)
            .ok_or_else(|| Error::not_found("machine", id_or_name))
    }

    /// Lists the machines eligible for RPC fan-outs and deployments, in
    /// deterministic deployment order. `DOWN` members are excluded silently;
    /// recording them is the planner's concern.
    pub async fn eligible(&self) -> Result<Vec<MachineInfo>, Error> {
        let mut machines: Vec<MachineInfo> = self
            .list()
            .await?
            .into_iter()
            .filter(MachineInfo::eligible)
            .collect();
        machines.sort_by(deployment_order);
        Ok(machines)
    }
}

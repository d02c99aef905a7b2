//! Observed container state and the label codec binding containers to the
//! services that own them.
//!
//! Every container created by the deployment core carries a set of
//! `uncloud.*` labels. The labels are the only persistent link between a
//! runtime container and its service: the service id, name, mode and the
//! canonical port list are all recovered from them.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::errors::Error;
use crate::port::PortSpec;
use crate::service::{ContainerSpec, ServiceMode, ServiceSpec};

/// Label marking a container as owned by this system. The value is always
/// the empty string; only the key's existence matters.
pub const LABEL_MANAGED: &str = "uncloud.managed";
/// Label carrying the 32-hex identifier of the owning service.
pub const LABEL_SERVICE_ID: &str = "uncloud.service.id";
/// Label mirroring the owning service's name.
pub const LABEL_SERVICE_NAME: &str = "uncloud.service.name";
/// Label mirroring the owning service's replication mode.
pub const LABEL_SERVICE_MODE: &str = "uncloud.service.mode";
/// Label carrying the comma-separated canonical port list of the service.
pub const LABEL_SERVICE_PORTS: &str = "uncloud.service.ports";

/// Builds the label set attached to every container of a service.
pub fn service_labels(service_id: &str, spec: &ServiceSpec) -> HashMap<String, String> {
    let ports = spec
        .ports
        .iter()
        .map(PortSpec::to_string)
        .collect::<Vec<_>>()
        .join(",");
    HashMap::from([
        (LABEL_MANAGED.to_owned(), String::new()),
        (LABEL_SERVICE_ID.to_owned(), service_id.to_owned()),
        (LABEL_SERVICE_NAME.to_owned(), spec.name.clone()),
        (LABEL_SERVICE_MODE.to_owned(), spec.mode.to_string()),
        (LABEL_SERVICE_PORTS.to_owned(), ports),
    ])
}

/// Coarse lifecycle status of a container as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but never started.
    Created,
    /// Currently running.
    Running,
    /// Running but paused.
    Paused,
    /// Being restarted by the runtime's restart policy.
    Restarting,
    /// Being removed.
    Removing,
    /// Exited, either cleanly or not.
    Exited,
    /// The runtime failed to clean the container up.
    Dead,
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Removing => "removing",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// Health check verdict for a container that defines a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// The health check has not produced a verdict yet.
    Starting,
    /// The last health check passed.
    Healthy,
    /// The last health check failed.
    Unhealthy,
}

/// Runtime state of a container, a snapshot of the runtime's inspect output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Coarse lifecycle status.
    pub status: ContainerStatus,
    /// Whether the container process is running.
    pub running: bool,
    /// Whether the container is paused.
    pub paused: bool,
    /// Whether the container is being restarted.
    pub restarting: bool,
    /// Whether the runtime failed to clean the container up.
    pub dead: bool,
    /// Exit code of the last run, 0 while running.
    pub exit_code: i64,
    /// RFC 3339 timestamp of the last start, if any.
    pub started_at: Option<String>,
    /// RFC 3339 timestamp of the last exit, if any.
    pub finished_at: Option<String>,
    /// Health verdict; `None` when the container has no health check.
    pub health: Option<HealthStatus>,
}

impl ContainerState {
    /// A freshly started state with no health check, handy in tests and in
    /// fake runtimes.
    pub fn running() -> Self {
        ContainerState {
            status: ContainerStatus::Running,
            running: true,
            paused: false,
            restarting: false,
            dead: false,
            exit_code: 0,
            started_at: None,
            finished_at: None,
            health: None,
        }
    }
}

/// A container's attachment to one network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// The container's address on the network, if assigned yet.
    pub ip_address: Option<IpAddr>,
}

/// Creation-time configuration of a container, the subset this system sets
/// and later reads back to reconstruct the owning service's spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Image reference the container was created from.
    pub image: String,
    /// Command override, empty when the image default is used.
    pub command: Vec<String>,
    /// Whether an init process is run inside the container.
    pub init: Option<bool>,
    /// Volume specs mounted into the container.
    pub volumes: Vec<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// A container as observed on one machine's runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    /// Opaque runtime identifier.
    pub id: String,
    /// Container name with the runtime's leading `/` already stripped.
    pub name: String,
    /// Creation-time configuration.
    pub config: ContainerConfig,
    /// Runtime state snapshot.
    pub state: ContainerState,
    /// Network attachments keyed by network name.
    pub networks: HashMap<String, NetworkAttachment>,
}

impl Container {
    /// Strips the leading `/` the runtime prepends to container names.
    pub fn normalize_name(name: &str) -> &str {
        name.strip_prefix('/').unwrap_or(name)
    }

    /// A container is healthy when it is running, not paused or restarting,
    /// and its health check, if it has one, reports healthy.
    pub fn healthy(&self) -> bool {
        self.state.running
            && !self.state.paused
            && !self.state.restarting
            && !matches!(
                self.state.health,
                Some(HealthStatus::Starting) | Some(HealthStatus::Unhealthy)
            )
    }

    /// A container is stopped when it was created but never started, has
    /// exited, or is dead.
    pub fn stopped(&self) -> bool {
        matches!(
            self.state.status,
            ContainerStatus::Created | ContainerStatus::Exited | ContainerStatus::Dead
        )
    }

    /// Whether the container carries the `uncloud.managed` label.
    pub fn managed(&self) -> bool {
        self.config.labels.contains_key(LABEL_MANAGED)
    }

    /// The owning service's id from the container labels.
    pub fn service_id(&self) -> Option<&str> {
        self.config.labels.get(LABEL_SERVICE_ID).map(String::as_str)
    }

    /// The owning service's name from the container labels.
    pub fn service_name(&self) -> Option<&str> {
        self.config
            .labels
            .get(LABEL_SERVICE_NAME)
            .map(String::as_str)
    }

    /// The container's address on the given network, if attached and
    /// assigned one.
    pub fn network_ip(&self, network: &str) -> Option<IpAddr> {
        self.networks.get(network).and_then(|n| n.ip_address)
    }

    /// Decodes the service port list from the `uncloud.service.ports` label.
    ///
    /// A missing, empty or whitespace-only label yields an empty list. Any
    /// unparseable element aborts with the parser's error.
    pub fn service_ports(&self) -> Result<Vec<PortSpec>, Error> {
        let label = match self.config.labels.get(LABEL_SERVICE_PORTS) {
            Some(label) => label.trim(),
            None => return Ok(Vec::new()),
        };
        if label.is_empty() {
            return Ok(Vec::new());
        }
        label
            .split(',')
            .map(|p| PortSpec::from_str(p.trim()))
            .collect()
    }

    /// Reconstructs the container-visible service spec from the labels and
    /// the creation-time configuration.
    ///
    /// The replica count is not observable on a single container and is left
    /// at 1.
    pub fn service_spec(&self) -> Result<ServiceSpec, Error> {
        let mode = match self.config.labels.get(LABEL_SERVICE_MODE) {
            Some(mode) if !mode.is_empty() => mode.parse::<ServiceMode>()?,
            _ => ServiceMode::Replicated,
        };
        Ok(ServiceSpec {
            name: self.service_name().unwrap_or_default().to_owned(),
            mode,
            replicas: 1,
            container: ContainerSpec {
                image: self.config.image.clone(),
                command: self.config.command.clone(),
                init: self.config.init,
                volumes: self.config.volumes.clone(),
            },
            ports: self.service_ports()?,
        })
    }
}

//! Desired and observed service state.
//!
//! A [`ServiceSpec`] is what the user asks for; a [`Service`] is what the
//! cluster is currently running, reconstructed from labelled containers
//! spread across machines.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde_derive::{Deserialize, Serialize};

use crate::container::Container;
use crate::errors::Error;
use crate::image::ImageReference;
use crate::port::PortSpec;

/// Replication mode of a service.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// A fixed number of replicas placed across eligible machines.
    #[default]
    Replicated,
    /// Exactly one container on every eligible machine.
    Global,
}

impl fmt::Display for ServiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceMode::Replicated => write!(f, "replicated"),
            ServiceMode::Global => write!(f, "global"),
        }
    }
}

impl FromStr for ServiceMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // An empty mode means the default.
            "" | "replicated" => Ok(ServiceMode::Replicated),
            "global" => Ok(ServiceMode::Global),
            _ => Err(Error::invalid_spec(format!("invalid service mode: '{s}'"))),
        }
    }
}

/// The container template a service runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Image reference; must parse as a canonical [`ImageReference`].
    pub image: String,
    /// Command override, empty to use the image default.
    #[serde(default)]
    pub command: Vec<String>,
    /// Whether to run an init process inside the container.
    #[serde(default)]
    pub init: Option<bool>,
    /// Volumes to mount, in the runtime's `source:target[:opts]` syntax.
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// Desired state of one service.
///
/// Equality is structural on every field, and the port list is compared in
/// order: reordering ports counts as a different spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Stable service identifier, immutable across updates. May be left
    /// empty, in which case a name is generated from the image when the
    /// service is first deployed.
    pub name: String,
    /// Replication mode, immutable across updates.
    #[serde(default)]
    pub mode: ServiceMode,
    /// Desired replica count; only meaningful in replicated mode where it
    /// must be at least 1.
    #[serde(default)]
    pub replicas: u32,
    /// The container template.
    pub container: ContainerSpec,
    /// Ports to publish.
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

impl ServiceSpec {
    /// Validates the spec before any side effect is taken.
    pub fn validate(&self) -> Result<(), Error> {
        self.container.image.parse::<ImageReference>()?;
        if self.mode == ServiceMode::Replicated && self.replicas == 0 {
            return Err(Error::invalid_spec(
                "a replicated service needs at least 1 replica",
            ));
        }
        for port in &self.ports {
            port.validate()?;
        }
        Ok(())
    }

    /// Compares the container-visible projection of two specs: the container
    /// template and the port list, in order.
    ///
    /// This is the planner's up-to-date test for a single container, which
    /// cannot observe the service name or replica count.
    pub fn eq_container(&self, other: &ServiceSpec) -> bool {
        self.container == other.container && self.ports == other.ports
    }
}

/// The number of random bytes in a service id; hex-encoded to 32 characters.
const SERVICE_ID_BYTES: usize = 16;

/// Alphabet for generated name suffixes.
const SUFFIX_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const SUFFIX_LEN: usize = 4;

/// Generates a fresh 32-hex-character service id from CSPRNG bytes.
pub fn new_service_id() -> String {
    let mut bytes = [0u8; SERVICE_ID_BYTES];
    rand::rng().fill(&mut bytes[..]);
    hex::encode(bytes)
}

/// Whether `id` is a well-formed service id: 32 lowercase hex characters.
pub fn is_valid_service_id(id: &str) -> bool {
    id.len() == 2 * SERVICE_ID_BYTES
        && id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_CHARSET[rng.random_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}

/// Derives a service name from an image when the spec does not carry one:
/// the image basename plus a 4-character random suffix.
pub fn generate_service_name(image: &str) -> Result<String, Error> {
    let image: ImageReference = image.parse()?;
    Ok(format!("{}-{}", image.base_name(), random_suffix()))
}

/// Generates a name for a new container of a service.
pub fn generate_container_name(service_name: &str) -> String {
    format!("{service_name}-{}", random_suffix())
}

/// A container together with the machine that runs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineContainer {
    /// Id of the machine the container runs on.
    pub machine_id: String,
    /// The observed container.
    pub container: Container,
}

/// Observed state of one service across the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// 32-hex-character opaque identifier.
    pub id: String,
    /// Service name, mirrored from the spec.
    pub name: String,
    /// Replication mode, mirrored from the spec.
    pub mode: ServiceMode,
    /// Every container of the service, paired with its machine.
    pub containers: Vec<MachineContainer>,
}

impl Service {
    /// Builds a service from containers already known to share the given
    /// service id, taking the name and mode from the first container's
    /// labels.
    pub fn from_containers(id: String, containers: Vec<MachineContainer>) -> Result<Self, Error> {
        let first = containers
            .first()
            .ok_or_else(|| Error::not_found("service", id.clone()))?;
        let name = first.container.service_name().unwrap_or_default().to_owned();
        let mode = first
            .container
            .config
            .labels
            .get(crate::container::LABEL_SERVICE_MODE)
            .map(String::as_str)
            .unwrap_or_default()
            .parse::<ServiceMode>()?;
        Ok(Service {
            id,
            name,
            mode,
            containers,
        })
    }

    /// The containers of this service on one machine.
    pub fn containers_on(&self, machine_id: &str) -> Vec<&Container> {
        self.containers
            .iter()
            .filter(|mc| mc.machine_id == machine_id)
            .map(|mc| &mc.container)
            .collect()
    }
}

//! The container runtime contract.
//!
//! The deployment core treats each machine's container runtime as a black
//! box capable of create / start / stop / remove / list / inspect /
//! pull-image. Transport details (HTTP over a socket, gRPC, an in-memory
//! fake in tests) live behind [`ContainerRuntime`].

use std::collections::HashMap;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use serde_derive::{Deserialize, Serialize};

use crate::container::Container;
use crate::errors::Error;
use crate::port::{PortMode, PortProtocol, PortSpec};

/// A host port binding requested at container creation, the runtime-level
/// rendition of a host-mode [`PortSpec`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host IP to bind on; `None` binds all interfaces.
    pub host_ip: Option<IpAddr>,
    /// Host port to bind.
    pub host_port: u16,
    /// Container port the binding forwards to.
    pub container_port: u16,
    /// `tcp` or `udp`.
    pub protocol: PortProtocol,
}

impl PortBinding {
    /// The binding for a host-mode port spec; ingress ports have no
    /// runtime-level binding and yield `None`.
    pub fn from_spec(spec: &PortSpec) -> Option<PortBinding> {
        if spec.mode != PortMode::Host {
            return None;
        }
        Some(PortBinding {
            host_ip: spec.host_ip,
            host_port: spec.published_port?,
            container_port: spec.container_port,
            protocol: spec.protocol,
        })
    }
}

/// Parameters for creating a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateContainerOptions {
    /// Name to assign to the container.
    pub name: String,
    /// Image reference to create the container from.
    pub image: String,
    /// Command override, empty to use the image default.
    pub command: Vec<String>,
    /// Whether to run an init process inside the container.
    pub init: Option<bool>,
    /// Volumes to mount.
    pub volumes: Vec<String>,
    /// Labels to attach.
    pub labels: HashMap<String, String>,
    /// Host port bindings.
    pub port_bindings: Vec<PortBinding>,
}

/// Filters for listing containers. All filters must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerFilters {
    /// Keep containers that carry every one of these label keys, whatever
    /// the value.
    pub label_keys: Vec<String>,
    /// Keep containers whose labels contain every one of these exact
    /// `key=value` pairs.
    pub label_values: HashMap<String, String>,
}

impl ContainerFilters {
    /// Filter matching every container managed by this system.
    pub fn managed() -> Self {
        ContainerFilters {
            label_keys: vec![crate::container::LABEL_MANAGED.to_owned()],
            label_values: HashMap::new(),
        }
    }

    /// Additionally requires an exact label value.
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.label_values.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Whether a label map satisfies the filter.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.label_keys.iter().all(|k| labels.contains_key(k))
            && self
                .label_values
                .iter()
                .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// A container as returned by the runtime's list call. Full state and
/// network details require a follow-up inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// Opaque runtime identifier.
    pub id: String,
    /// Container name with the leading `/` stripped.
    pub name: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

/// One progress item of a streaming image pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullProgress {
    /// Layer id the item applies to; `None` for image-level messages.
    pub layer_id: Option<String>,
    /// Short status, for example `Downloading` or `Pull complete`.
    pub status: String,
    /// Human-readable progress detail, if any.
    pub progress: Option<String>,
}

/// The stream of progress items emitted by a pull. The pull is cancelled by
/// dropping the stream.
pub type PullProgressStream = Pin<Box<dyn Stream<Item = Result<PullProgress, Error>> + Send>>;

/// Interface to one machine's container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container and returns its runtime id.
    ///
    /// Fails with [`Error::ImageNotFound`] when the image is absent on the
    /// machine; the caller is expected to pull and retry.
    async fn create_container(&self, options: CreateContainerOptions) -> Result<String, Error>;

    /// Starts a created container.
    async fn start_container(&self, id: &str) -> Result<(), Error>;

    /// Stops a running container. `timeout` overrides the runtime's default
    /// grace period before the process is killed.
    async fn stop_container(&self, id: &str, timeout: Option<Duration>) -> Result<(), Error>;

    /// Removes a container. `force` also removes a running container.
    async fn remove_container(&self, id: &str, force: bool) -> Result<(), Error>;

    /// Lists containers matching the filters.
    async fn list_containers(&self, filters: &ContainerFilters)
        -> Result<Vec<ContainerSummary>, Error>;

    /// Returns the full state of a container by id or name.
    async fn inspect_container(&self, id_or_name: &str) -> Result<Container, Error>;

    /// Starts pulling an image, streaming per-layer progress.
    async fn pull_image(&self, image: &str) -> Result<PullProgressStream, Error>;
}

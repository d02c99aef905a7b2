//! Shared in-memory fakes for the integration tests: a per-machine
//! container runtime, a static membership service and a recording progress
//! sink.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use uncloud::cluster::Cluster;
use uncloud::container::{
    service_labels, Container, ContainerConfig, ContainerState, ContainerStatus,
};
use uncloud::dispatch::MachineConnector;
use uncloud::errors::Error;
use uncloud::machine::{ClusterMembership, MachineInfo, MachineState};
use uncloud::progress::{ProgressSink, ProgressStatus};
use uncloud::runtime::{
    ContainerFilters, ContainerRuntime, ContainerSummary, CreateContainerOptions, PullProgress,
    PullProgressStream,
};
use uncloud::service::{ContainerSpec, MachineContainer, Service, ServiceMode, ServiceSpec};

/// In-memory state of one machine's fake runtime.
#[derive(Default)]
pub struct RuntimeState {
    pub containers: HashMap<String, Container>,
    pub images: Vec<String>,
    pub ops: Vec<String>,
    next_id: u32,
}

/// An in-memory container runtime for one machine.
#[derive(Default)]
pub struct FakeRuntime {
    pub state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn with_images(images: &[&str]) -> Self {
        let runtime = FakeRuntime::default();
        runtime.state.lock().unwrap().images = images.iter().map(|s| s.to_string()).collect();
        runtime
    }

    pub fn running_containers(&self) -> Vec<Container> {
        self.state
            .lock()
            .unwrap()
            .containers
            .values()
            .filter(|c| c.state.running)
            .cloned()
            .collect()
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_container(&self, options: CreateContainerOptions) -> Result<String, Error> {
        let mut state = self.state.lock().unwrap();
        if !state.images.contains(&options.image) {
            return Err(Error::ImageNotFound {
                image: options.image,
            });
        }
        state.next_id += 1;
        let id = format!("ctr-{}", state.next_id);
        state.ops.push(format!("create {}", options.name));
        let container = Container {
            id: id.clone(),
            name: options.name,
            config: ContainerConfig {
                image: options.image,
                command: options.command,
                init: options.init,
                volumes: options.volumes,
                labels: options.labels,
            },
            state: ContainerState {
                status: ContainerStatus::Created,
                running: false,
                paused: false,
                restarting: false,
                dead: false,
                exit_code: 0,
                started_at: None,
                finished_at: None,
                health: None,
            },
            networks: HashMap::new(),
        };
        state.containers.insert(id.clone(), container);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("start {id}"));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("container", id))?;
        container.state.status = ContainerStatus::Running;
        container.state.running = true;
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout: Option<Duration>) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("stop {id}"));
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| Error::not_found("container", id))?;
        container.state.status = ContainerStatus::Exited;
        container.state.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(format!("remove {id}"));
        let running = state
            .containers
            .get(id)
            .ok_or_else(|| Error::not_found("container", id))?
            .state
            .running;
        if running && !force {
            return Err(Error::Conflict {
                message: format!("container {id} is running"),
            });
        }
        state.containers.remove(id);
        Ok(())
    }

    async fn list_containers(
        &self,
        filters: &ContainerFilters,
    ) -> Result<Vec<ContainerSummary>, Error> {
        let state = self.state.lock().unwrap();
        let mut summaries: Vec<ContainerSummary> = state
            .containers
            .values()
            .filter(|c| filters.matches(&c.config.labels))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                labels: c.config.labels.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn inspect_container(&self, id_or_name: &str) -> Result<Container, Error> {
        let state = self.state.lock().unwrap();
        state
            .containers
            .values()
            .find(|c| c.id == id_or_name || c.name == id_or_name)
            .cloned()
            .ok_or_else(|| Error::not_found("container", id_or_name))
    }

    async fn pull_image(&self, image: &str) -> Result<PullProgressStream, Error> {
        {
            let mut state = self.state.lock().unwrap();
            state.ops.push(format!("pull {image}"));
            state.images.push(image.to_owned());
        }
        let items = vec![
            Ok(PullProgress {
                layer_id: Some("layer-1".to_owned()),
                status: "Downloading".to_owned(),
                progress: Some("[=====>    ]".to_owned()),
            }),
            Ok(PullProgress {
                layer_id: Some("layer-1".to_owned()),
                status: "Pull complete".to_owned(),
                progress: None,
            }),
        ];
        Ok(futures_util::stream::iter(items).boxed())
    }
}

/// A fixed membership snapshot.
pub struct StaticMembership(pub Vec<MachineInfo>);

#[async_trait]
impl ClusterMembership for StaticMembership {
    async fn list_machines(&self) -> Result<Vec<MachineInfo>, Error> {
        Ok(self.0.clone())
    }
}

/// Connector resolving management addresses to fake runtimes.
pub struct FakeConnector(pub HashMap<String, Arc<FakeRuntime>>);

#[async_trait]
impl MachineConnector for FakeConnector {
    async fn connect(&self, management_addr: &str) -> Result<Arc<dyn ContainerRuntime>, Error> {
        self.0
            .get(management_addr)
            .cloned()
            .map(|runtime| runtime as Arc<dyn ContainerRuntime>)
            .ok_or_else(|| Error::runtime(format!("no route to {management_addr}")))
    }
}

/// A whole fake cluster: machines plus one runtime per machine.
pub struct FakeCluster {
    pub machines: Vec<MachineInfo>,
    pub runtimes: HashMap<String, Arc<FakeRuntime>>,
}

impl FakeCluster {
    /// Builds a cluster of machines named by id, each with its own runtime
    /// pre-seeded with the given images.
    pub fn new(machines: &[(&str, MachineState)], images: &[&str]) -> Self {
        let mut infos = Vec::new();
        let mut runtimes = HashMap::new();
        for (i, (id, state)) in machines.iter().enumerate() {
            let management_addr = format!("10.0.0.{}:51000", i + 1);
            infos.push(MachineInfo {
                id: id.to_string(),
                name: format!("machine-{id}"),
                state: *state,
                management_addr: management_addr.clone(),
                public_addr: None,
            });
            runtimes.insert(management_addr, Arc::new(FakeRuntime::with_images(images)));
        }
        FakeCluster {
            machines: infos,
            runtimes,
        }
    }

    pub fn cluster(&self) -> Cluster {
        Cluster::new(
            Arc::new(StaticMembership(self.machines.clone())),
            Arc::new(FakeConnector(self.runtimes.clone())),
        )
    }

    pub fn runtime(&self, machine_id: &str) -> Arc<FakeRuntime> {
        let machine = self
            .machines
            .iter()
            .find(|m| m.id == machine_id)
            .expect("unknown machine id");
        Arc::clone(&self.runtimes[&machine.management_addr])
    }
}

/// Records every progress event as a readable line.
#[derive(Default)]
pub struct RecordingProgress {
    pub events: Mutex<Vec<String>>,
}

impl RecordingProgress {
    pub fn lines(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingProgress {
    fn begin(&self, id: &str, parent: Option<&str>) {
        let mut events = self.events.lock().unwrap();
        match parent {
            Some(parent) => events.push(format!("begin {id} (parent {parent})")),
            None => events.push(format!("begin {id}")),
        }
    }

    fn update(&self, id: &str, status: ProgressStatus, text: &str) {
        self.events
            .lock()
            .unwrap()
            .push(format!("update {id} {status:?} {text}"));
    }

    fn end(&self, id: &str, status: ProgressStatus) {
        self.events
            .lock()
            .unwrap()
            .push(format!("end {id} {status:?}"));
    }
}

/// A minimal replicated web service spec.
pub fn web_spec(name: &str, image: &str, replicas: u32, ports: &[&str]) -> ServiceSpec {
    ServiceSpec {
        name: name.to_owned(),
        mode: ServiceMode::Replicated,
        replicas,
        container: ContainerSpec {
            image: image.to_owned(),
            ..Default::default()
        },
        ports: ports.iter().map(|p| p.parse().unwrap()).collect(),
    }
}

/// A running container that reports the given service spec through its
/// labels and config, as a deployed container of that service would.
pub fn spec_container(id: &str, service_id: &str, spec: &ServiceSpec) -> Container {
    Container {
        id: id.to_owned(),
        name: format!("{}-{id}", spec.name),
        config: ContainerConfig {
            image: spec.container.image.clone(),
            command: spec.container.command.clone(),
            init: spec.container.init,
            volumes: spec.container.volumes.clone(),
            labels: service_labels(service_id, spec),
        },
        state: ContainerState::running(),
        networks: HashMap::new(),
    }
}

/// Wraps containers into the observed service state.
pub fn observed_service(
    service_id: &str,
    spec: &ServiceSpec,
    containers: Vec<(&str, Container)>,
) -> Service {
    Service {
        id: service_id.to_owned(),
        name: spec.name.clone(),
        mode: spec.mode,
        containers: containers
            .into_iter()
            .map(|(machine_id, container)| MachineContainer {
                machine_id: machine_id.to_owned(),
                container,
            })
            .collect(),
    }
}

/// A machine snapshot entry for planner tests.
pub fn machine(id: &str, state: MachineState) -> MachineInfo {
    MachineInfo {
        id: id.to_owned(),
        name: format!("machine-{id}"),
        state,
        management_addr: format!("10.0.0.{}:51000", id.len()),
        public_addr: None,
    }
}

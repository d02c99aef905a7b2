//! Cluster-wide client: the domain operations the deployment flow needs,
//! built on the machine directory and the dispatch layer.
//!
//! A [`Cluster`] resolves services from the labelled containers spread
//! across machines and executes single-machine container operations by
//! pinning the RPC to the target machine's management address.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::container::Container;
use crate::dispatch::{split_responses, Dispatcher, MachineConnector, Metadata};
use crate::errors::Error;
use crate::machine::{ClusterMembership, MachineDirectory, MachineInfo, MachineState};
use crate::operation::{Operation, RemoveContainerOperation, SequenceOperation};
use crate::progress::ProgressSink;
use crate::runtime::{
    ContainerFilters, CreateContainerOptions, PullProgressStream,
};
use crate::service::{MachineContainer, Service};

/// The containers observed on one machine.
#[derive(Debug, Clone)]
pub struct MachineContainers {
    /// The machine the containers were listed from.
    pub machine: MachineInfo,
    /// Full container state, one entry per managed container that matched
    /// the filters.
    pub containers: Vec<Container>,
}

/// Client for the whole cluster.
#[derive(Clone)]
pub struct Cluster {
    directory: MachineDirectory,
    dispatcher: Dispatcher,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster").finish()
    }
}

impl Cluster {
    /// Creates a cluster client over the membership service and machine
    /// connector collaborators.
    pub fn new(
        membership: Arc<dyn ClusterMembership>,
        connector: Arc<dyn MachineConnector>,
    ) -> Self {
        Cluster {
            directory: MachineDirectory::new(membership),
            dispatcher: Dispatcher::new(connector),
        }
    }

    /// The machine directory this client resolves machines through.
    pub fn directory(&self) -> &MachineDirectory {
        &self.directory
    }

    /// Lists managed containers matching `filters` on every eligible
    /// machine.
    ///
    /// Individual machine failures degrade to warnings as long as at least
    /// one machine answers; when every machine fails the aggregate is a
    /// [`Error::PartialFailure`].
    pub async fn list_containers(
        &self,
        filters: &ContainerFilters,
        cancel: &CancellationToken,
    ) -> Result<Vec<MachineContainers>, Error> {
        let machines = self.directory.eligible().await?;
        if machines.is_empty() {
            return Ok(Vec::new());
        }
        for machine in &machines {
            if machine.state == MachineState::Suspect {
                log::warn!(
                    "machine {} is suspect; its containers may be stale",
                    machine.name
                );
            }
        }
        let by_addr: HashMap<String, MachineInfo> = machines
            .iter()
            .map(|m| (m.management_addr.clone(), m.clone()))
            .collect();

        let metadata = Metadata::for_machines(machines.iter().map(|m| m.management_addr.clone()));
        let responses = self
            .dispatcher
            .broadcast(&metadata, cancel, |_, runtime| {
                let filters = filters.clone();
                async move {
                    let summaries = runtime.list_containers(&filters).await?;
                    let mut containers = Vec::with_capacity(summaries.len());
                    for summary in summaries {
                        containers.push(runtime.inspect_container(&summary.id).await?);
                    }
                    Ok(containers)
                }
            })
            .await?;

        let total = responses.len();
        let (oks, errs) = split_responses(responses);
        if oks.is_empty() && !errs.is_empty() {
            return Err(Error::PartialFailure { total, errors: errs });
        }
        for (addr, message) in &errs {
            log::warn!("listing containers on {addr} failed: {message}");
        }

        Ok(oks
            .into_iter()
            .filter_map(|(addr, containers)| {
                by_addr.get(&addr).map(|machine| MachineContainers {
                    machine: machine.clone(),
                    containers,
                })
            })
            .collect())
    }

    /// Resolves the current state of a service by id or name.
    pub async fn inspect_service(
        &self,
        id_or_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Service, Error> {
        let listed = self
            .list_containers(&ContainerFilters::managed(), cancel)
            .await?;

        // Group the cluster's managed containers by owning service id, then
        // match the requested id or name against the groups.
        let mut by_service: HashMap<String, Vec<MachineContainer>> = HashMap::new();
        for machine_containers in listed {
            let machine_id = machine_containers.machine.id.clone();
            for container in machine_containers.containers {
                let Some(service_id) = container.service_id().map(str::to_owned) else {
                    continue;
                };
                by_service
                    .entry(service_id)
                    .or_default()
                    .push(MachineContainer {
                        machine_id: machine_id.clone(),
                        container,
                    });
            }
        }

        let mut matches: Vec<(String, Vec<MachineContainer>)> = by_service
            .into_iter()
            .filter(|(service_id, containers)| {
                service_id == id_or_name
                    || containers
                        .iter()
                        .any(|mc| mc.container.service_name() == Some(id_or_name))
            })
            .collect();

        match matches.len() {
            0 => Err(Error::not_found("service", id_or_name)),
            1 => {
                let (id, mut containers) = matches.remove(0);
                // Deterministic container order regardless of response order.
                containers.sort_by(|a, b| a.container.id.cmp(&b.container.id));
                Service::from_containers(id, containers)
            }
            _ => Err(Error::Conflict {
                message: format!("multiple services match '{id_or_name}'"),
            }),
        }
    }

    /// Creates a container on one machine. The RPC is pinned to the machine
    /// through the dispatch metadata.
    pub async fn create_container(
        &self,
        machine_id: &str,
        options: CreateContainerOptions,
        cancel: &CancellationToken,
    ) -> Result<String, Error> {
        let machine = self.directory.inspect(machine_id).await?;
        self.dispatcher
            .call_machine(&machine.management_addr, cancel, move |_, runtime| {
                let options = options.clone();
                async move { runtime.create_container(options).await }
            })
            .await
    }

    /// Starts a container on one machine.
    pub async fn start_container(
        &self,
        machine_id: &str,
        container_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let machine = self.directory.inspect(machine_id).await?;
        let container_id = container_id.to_owned();
        self.dispatcher
            .call_machine(&machine.management_addr, cancel, move |_, runtime| {
                let id = container_id.clone();
                async move { runtime.start_container(&id).await }
            })
            .await
    }

    /// Stops a container on one machine. `timeout` of `None` uses the
    /// runtime's default grace period.
    pub async fn stop_container(
        &self,
        machine_id: &str,
        container_id: &str,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let machine = self.directory.inspect(machine_id).await?;
        let container_id = container_id.to_owned();
        self.dispatcher
            .call_machine(&machine.management_addr, cancel, move |_, runtime| {
                let id = container_id.clone();
                async move { runtime.stop_container(&id, timeout).await }
            })
            .await
    }

    /// Removes a container on one machine.
    pub async fn remove_container(
        &self,
        machine_id: &str,
        container_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let machine = self.directory.inspect(machine_id).await?;
        let container_id = container_id.to_owned();
        self.dispatcher
            .call_machine(&machine.management_addr, cancel, move |_, runtime| {
                let id = container_id.clone();
                async move { runtime.remove_container(&id, force).await }
            })
            .await
    }

    /// Starts an image pull on one machine, returning its progress stream.
    pub async fn pull_image(
        &self,
        machine_id: &str,
        image: &str,
        cancel: &CancellationToken,
    ) -> Result<PullProgressStream, Error> {
        let machine = self.directory.inspect(machine_id).await?;
        let image = image.to_owned();
        self.dispatcher
            .call_machine(&machine.management_addr, cancel, move |_, runtime| {
                let image = image.clone();
                async move { runtime.pull_image(&image).await }
            })
            .await
    }

    /// Removes a service: force-removes every one of its containers across
    /// the cluster. The last applied operation wins; there is no rollback.
    pub async fn remove_service(
        &self,
        id_or_name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let service = self.inspect_service(id_or_name, cancel).await?;
        let operations = service
            .containers
            .iter()
            .map(|mc| {
                Operation::Remove(RemoveContainerOperation {
                    service_id: service.id.clone(),
                    container_id: mc.container.id.clone(),
                    machine_id: mc.machine_id.clone(),
                    force: true,
                })
            })
            .collect();
        let sequence = Operation::Sequence(SequenceOperation::new(operations));
        sequence.execute(self, progress, cancel).await
    }
}

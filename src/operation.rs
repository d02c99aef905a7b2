//! Deployment operations and their executor.
//!
//! The planner emits an immutable tree of operations; executing the tree
//! drives the cluster toward the desired state. A [`SequenceOperation`]
//! executes its children strictly in order and short-circuits on the first
//! error; already-applied operations are never rolled back.

use std::collections::HashSet;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::container::service_labels;
use crate::errors::Error;
use crate::progress::{ProgressSink, ProgressStatus};
use crate::runtime::{CreateContainerOptions, PortBinding};
use crate::service::{generate_container_name, ServiceSpec};

/// Run a new container for a service on one machine.
#[derive(Debug, Clone, PartialEq)]
pub struct RunContainerOperation {
    /// Id of the service the container will belong to.
    pub service_id: String,
    /// The desired service spec the container is created from.
    pub spec: ServiceSpec,
    /// Machine to run the container on.
    pub machine_id: String,
}

/// Stop a container on one machine using the runtime's default grace
/// period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopContainerOperation {
    /// Id of the owning service.
    pub service_id: String,
    /// Container to stop.
    pub container_id: String,
    /// Machine the container runs on.
    pub machine_id: String,
}

/// Remove a container on one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveContainerOperation {
    /// Id of the owning service.
    pub service_id: String,
    /// Container to remove.
    pub container_id: String,
    /// Machine the container runs on.
    pub machine_id: String,
    /// Force removal of a running container. Set by the service-removal
    /// path; planner-emitted removals are graceful.
    pub force: bool,
}

/// An ordered composite of operations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceOperation {
    /// Child operations, executed in order.
    pub operations: Vec<Operation>,
    /// Non-fatal conditions observed while planning, for example machines
    /// that were skipped because they are down.
    pub warnings: Vec<String>,
}

impl SequenceOperation {
    /// A sequence of the given operations with no warnings.
    pub fn new(operations: Vec<Operation>) -> Self {
        SequenceOperation {
            operations,
            warnings: Vec::new(),
        }
    }

    /// Whether the sequence contains no operations at all.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// One atomic or composite container mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Run a new container.
    Run(RunContainerOperation),
    /// Stop an existing container.
    Stop(StopContainerOperation),
    /// Remove an existing container.
    Remove(RemoveContainerOperation),
    /// Execute children in order.
    Sequence(SequenceOperation),
}

impl Operation {
    /// Executes the operation against the cluster.
    ///
    /// Sequences run their children strictly in order, stopping at the
    /// first error. Cancellation is observed between children and inside
    /// every suspension point; cancelling abandons the remaining operations
    /// but does not undo applied ones.
    pub fn execute<'a>(
        &'a self,
        cluster: &'a Cluster,
        progress: &'a dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<(), Error>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self {
                Operation::Run(op) => op.execute(cluster, progress, cancel).await,
                Operation::Stop(op) => op.execute(cluster, progress, cancel).await,
                Operation::Remove(op) => op.execute(cluster, progress, cancel).await,
                Operation::Sequence(seq) => {
                    for warning in &seq.warnings {
                        log::warn!("{warning}");
                    }
                    for op in &seq.operations {
                        op.execute(cluster, progress, cancel).await?;
                    }
                    Ok(())
                }
            }
        })
    }
}

impl RunContainerOperation {
    async fn execute(
        &self,
        cluster: &Cluster,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let name = generate_container_name(&self.spec.name);
        progress.begin(&name, None);
        let result = self.run(&name, cluster, progress, cancel).await;
        match &result {
            Ok(()) => progress.end(&name, ProgressStatus::Started),
            Err(_) => progress.end(&name, ProgressStatus::Error),
        }
        result
    }

    async fn run(
        &self,
        name: &str,
        cluster: &Cluster,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let options = CreateContainerOptions {
            name: name.to_owned(),
            image: self.spec.container.image.clone(),
            command: self.spec.container.command.clone(),
            init: self.spec.container.init,
            volumes: self.spec.container.volumes.clone(),
            labels: service_labels(&self.service_id, &self.spec),
            port_bindings: self
                .spec
                .ports
                .iter()
                .filter_map(PortBinding::from_spec)
                .collect(),
        };

        progress.update(
            name,
            ProgressStatus::Creating,
            &format!("creating container on machine {}", self.machine_id),
        );
        let container_id = match cluster
            .create_container(&self.machine_id, options.clone(), cancel)
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_image_not_found() => {
                self.pull_image(name, cluster, progress, cancel).await?;
                cluster
                    .create_container(&self.machine_id, options, cancel)
                    .await?
            }
            Err(e) => return Err(e),
        };

        progress.update(name, ProgressStatus::Starting, "starting container");
        cluster
            .start_container(&self.machine_id, &container_id, cancel)
            .await
    }

    /// Pulls the spec's image on the target machine, forwarding per-layer
    /// progress as children of the container task.
    async fn pull_image(
        &self,
        parent: &str,
        cluster: &Cluster,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let image = &self.spec.container.image;
        progress.update(
            parent,
            ProgressStatus::Pulling,
            &format!("pulling image {image}"),
        );

        let mut stream = cluster.pull_image(&self.machine_id, image, cancel).await?;
        let mut layers: HashSet<String> = HashSet::new();
        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                item = stream.next() => item,
            };
            let Some(item) = item else {
                break;
            };
            let item = item?;
            if let Some(layer_id) = &item.layer_id {
                let child = format!("{parent}:{layer_id}");
                if layers.insert(child.clone()) {
                    progress.begin(&child, Some(parent));
                }
                let text = match &item.progress {
                    Some(detail) => format!("{} {detail}", item.status),
                    None => item.status.clone(),
                };
                progress.update(&child, ProgressStatus::Pulling, &text);
            }
        }
        for child in layers {
            progress.end(&child, ProgressStatus::Pulled);
        }
        Ok(())
    }
}

impl StopContainerOperation {
    async fn execute(
        &self,
        cluster: &Cluster,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        progress.begin(&self.container_id, None);
        progress.update(
            &self.container_id,
            ProgressStatus::Stopping,
            &format!("stopping container on machine {}", self.machine_id),
        );
        let result = cluster
            .stop_container(&self.machine_id, &self.container_id, None, cancel)
            .await;
        match &result {
            Ok(()) => progress.end(&self.container_id, ProgressStatus::Stopped),
            Err(_) => progress.end(&self.container_id, ProgressStatus::Error),
        }
        result
    }
}

impl RemoveContainerOperation {
    async fn execute(
        &self,
        cluster: &Cluster,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        progress.begin(&self.container_id, None);
        progress.update(
            &self.container_id,
            ProgressStatus::Removing,
            &format!("removing container on machine {}", self.machine_id),
        );
        let result = cluster
            .remove_container(&self.machine_id, &self.container_id, self.force, cancel)
            .await;
        match &result {
            Ok(()) => progress.end(&self.container_id, ProgressStatus::Removed),
            Err(_) => progress.end(&self.container_id, ProgressStatus::Error),
        }
        result
    }
}

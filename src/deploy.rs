//! Deployment façade: validate a spec, bind the existing service, plan and
//! run.
//!
//! A [`Deployment`] is the entry point a CLI or API front-end drives. It
//! performs the I/O around the pure planner: fetching the membership
//! snapshot, resolving the current service state, memoizing the plan and
//! executing it.

use std::fmt;

use tokio_util::sync::CancellationToken;

use crate::cluster::Cluster;
use crate::errors::Error;
use crate::machine::MachineInfo;
use crate::operation::{Operation, SequenceOperation};
use crate::planner;
use crate::progress::ProgressSink;
use crate::service::{generate_service_name, new_service_id, Service, ServiceSpec};

/// Produces an operation sequence for a desired spec. Strategies are pure;
/// the façade supplies the observed inputs.
pub trait DeploymentStrategy: Send + Sync {
    /// Plans the operations that reconcile `current` toward `spec`.
    fn plan(
        &self,
        machines: &[MachineInfo],
        current: Option<&Service>,
        spec: &ServiceSpec,
    ) -> Result<SequenceOperation, Error>;
}

/// The default rolling-update strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct RollingStrategy;

impl DeploymentStrategy for RollingStrategy {
    fn plan(
        &self,
        machines: &[MachineInfo],
        current: Option<&Service>,
        spec: &ServiceSpec,
    ) -> Result<SequenceOperation, Error> {
        planner::plan(machines, current, spec)
    }
}

/// Outcome of running a deployment plan.
#[derive(Debug)]
pub struct DeploymentResult {
    /// Id of the deployed service, whether or not execution completed.
    pub service_id: String,
    /// The execution error when the sequence stopped early. Operations
    /// applied before the failure stay applied.
    pub error: Option<Error>,
}

/// One deployment of a service spec to the cluster.
pub struct Deployment {
    cluster: Cluster,
    spec: ServiceSpec,
    strategy: Box<dyn DeploymentStrategy>,
    plan: Option<SequenceOperation>,
    service_id: Option<String>,
}

impl fmt::Debug for Deployment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deployment")
            .field("spec", &self.spec)
            .field("planned", &self.plan.is_some())
            .finish()
    }
}

impl Deployment {
    /// Creates a deployment with the default rolling strategy.
    ///
    /// A spec without a name gets one generated from the image basename.
    pub fn new(cluster: Cluster, spec: ServiceSpec) -> Result<Self, Error> {
        Deployment::with_strategy(cluster, spec, Box::new(RollingStrategy))
    }

    /// Creates a deployment with a custom strategy.
    pub fn with_strategy(
        cluster: Cluster,
        mut spec: ServiceSpec,
        strategy: Box<dyn DeploymentStrategy>,
    ) -> Result<Self, Error> {
        if spec.name.is_empty() {
            spec.name = generate_service_name(&spec.container.image)?;
            log::debug!("generated service name {}", spec.name);
        }
        Ok(Deployment {
            cluster,
            spec,
            strategy,
            plan: None,
            service_id: None,
        })
    }

    /// The spec this deployment drives toward, including any generated
    /// name.
    pub fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    /// Validates the spec against the cluster before any side effect.
    ///
    /// Beyond the spec's own validity this checks the immutability rules:
    /// when a service with the spec's name already exists, its name and
    /// replication mode must equal the spec's.
    pub async fn validate(&self, cancel: &CancellationToken) -> Result<(), Error> {
        self.spec.validate()?;
        match self.cluster.inspect_service(&self.spec.name, cancel).await {
            Ok(existing) => {
                if existing.mode != self.spec.mode {
                    return Err(Error::invalid_spec(format!(
                        "service '{}' already exists in {} mode; the mode of a service \
                         is immutable",
                        existing.name, existing.mode
                    )));
                }
                Ok(())
            }
            Err(Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Computes and memoizes the operation sequence for this deployment.
    /// Subsequent calls return the memoized plan.
    pub async fn plan(&mut self, cancel: &CancellationToken) -> Result<SequenceOperation, Error> {
        if let Some(plan) = &self.plan {
            return Ok(plan.clone());
        }
        self.validate(cancel).await?;

        let machines = self.cluster.directory().list().await?;
        let current = match self.cluster.inspect_service(&self.spec.name, cancel).await {
            Ok(service) => Some(service),
            Err(Error::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let sequence = self.strategy.plan(&machines, current.as_ref(), &self.spec)?;
        let service_id = current
            .map(|service| service.id)
            .or_else(|| sequence_service_id(&sequence))
            .unwrap_or_else(new_service_id);

        self.service_id = Some(service_id);
        self.plan = Some(sequence.clone());
        Ok(sequence)
    }

    /// Plans if needed, then executes the memoized plan.
    ///
    /// Planning and validation failures return an error without side
    /// effects. Execution failures are reported in the result next to the
    /// service id; operations applied before the failure stay applied.
    pub async fn run(
        &mut self,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<DeploymentResult, Error> {
        let sequence = self.plan(cancel).await?;
        let service_id = self
            .service_id
            .clone()
            .unwrap_or_else(new_service_id);

        let outcome = Operation::Sequence(sequence)
            .execute(&self.cluster, progress, cancel)
            .await;
        Ok(DeploymentResult {
            service_id,
            error: outcome.err(),
        })
    }
}

/// The service id shared by the leaf operations of a sequence, if it has
/// any leaves.
fn sequence_service_id(sequence: &SequenceOperation) -> Option<String> {
    fn visit(op: &Operation) -> Option<String> {
        match op {
            Operation::Run(op) => Some(op.service_id.clone()),
            Operation::Stop(op) => Some(op.service_id.clone()),
            Operation::Remove(op) => Some(op.service_id.clone()),
            Operation::Sequence(seq) => seq.operations.iter().find_map(visit),
        }
    }
    sequence.operations.iter().find_map(visit)
}

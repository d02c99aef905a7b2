//! Rolling-deployment planner.
//!
//! Planning is a pure function of a membership snapshot, the currently
//! observed service (if any) and the desired spec. It performs no I/O, so
//! identical inputs always produce an identical sequence of operations;
//! the surrounding deployment façade fetches the inputs and executes the
//! output.
//!
//! The produced sequence keeps every machine's sub-sequence in the shape
//! `[Stop*, Run?, Remove*]`: host ports are freed before the replacement
//! container claims them, and the displaced container is only removed after
//! the replacement has been started, so a machine never drops below one
//! live container unless its ports force a stop first.

use crate::container::Container;
use crate::errors::Error;
use crate::machine::{deployment_order, MachineInfo, MachineState};
use crate::operation::{
    Operation, RemoveContainerOperation, RunContainerOperation, SequenceOperation,
    StopContainerOperation,
};
use crate::port::conflicting_service_ports;
use crate::service::{new_service_id, Service, ServiceMode, ServiceSpec};

/// Computes the operation sequence that drives the cluster from the
/// observed `current` state to the desired `spec`.
///
/// Machines in state `DOWN` are never planned for; they are recorded as
/// warnings on the returned sequence. When there is no current service a
/// fresh service id is generated and shared by every planned operation.
///
/// Fails when a container's service labels cannot be decoded, since the
/// container then cannot be compared against the desired spec.
pub fn plan(
    machines: &[MachineInfo],
    current: Option<&Service>,
    spec: &ServiceSpec,
) -> Result<SequenceOperation, Error> {
    let service_id = match current {
        Some(service) => service.id.clone(),
        None => new_service_id(),
    };

    let mut warnings = Vec::new();
    let mut eligible: Vec<&MachineInfo> = Vec::new();
    for machine in machines {
        if machine.state == MachineState::Down {
            warnings.push(format!(
                "machine {} is down and is excluded from the deployment",
                machine.name
            ));
        } else {
            eligible.push(machine);
        }
    }
    eligible.sort_by(|a, b| deployment_order(a, b));

    let mut operations = Vec::new();
    match spec.mode {
        ServiceMode::Global => {
            for machine in &eligible {
                let containers = containers_on(current, &machine.id);
                operations.extend(reconcile_machine(
                    &service_id,
                    spec,
                    &machine.id,
                    containers,
                )?);
            }
        }
        ServiceMode::Replicated => {
            let replicas = spec.replicas as usize;
            if replicas > eligible.len() {
                warnings.push(format!(
                    "requested {replicas} replicas but only {} machines are eligible; \
                     planning one replica per eligible machine",
                    eligible.len()
                ));
            }
            let (targets, rest) = eligible.split_at(replicas.min(eligible.len()));
            for machine in targets {
                let containers = containers_on(current, &machine.id);
                operations.extend(reconcile_machine(
                    &service_id,
                    spec,
                    &machine.id,
                    containers,
                )?);
            }
            // Excess containers on eligible machines outside the placement
            // set are scheduled for removal.
            for machine in rest {
                for container in containers_on(current, &machine.id) {
                    operations.push(remove(&service_id, &machine.id, &container.id));
                }
            }
        }
    }

    Ok(SequenceOperation {
        operations,
        warnings,
    })
}

fn containers_on<'a>(current: Option<&'a Service>, machine_id: &str) -> Vec<&'a Container> {
    let mut containers = current
        .map(|service| service.containers_on(machine_id))
        .unwrap_or_default();
    // Deterministic candidate order whatever order the containers were
    // observed in.
    containers.sort_by(|a, b| a.id.cmp(&b.id));
    containers
}

/// Reconciles one machine toward the desired spec.
///
/// If a running, non-paused container already matches the spec the machine
/// is up to date and only stale siblings are removed. Otherwise running
/// containers whose host ports collide with the new spec are stopped first,
/// the replacement is started, and every old container is removed.
fn reconcile_machine(
    service_id: &str,
    spec: &ServiceSpec,
    machine_id: &str,
    containers: Vec<&Container>,
) -> Result<Vec<Operation>, Error> {
    if containers.is_empty() {
        return Ok(vec![run(service_id, spec, machine_id)]);
    }

    let running: Vec<&&Container> = containers
        .iter()
        .filter(|c| c.state.running && !c.state.paused)
        .collect();

    let mut up_to_date = None;
    for container in &running {
        if spec.eq_container(&container.service_spec()?) {
            up_to_date = Some(container.id.clone());
            break;
        }
    }

    let mut operations = Vec::new();
    match up_to_date {
        Some(keep_id) => {
            for container in containers {
                if container.id != keep_id {
                    operations.push(remove(service_id, machine_id, &container.id));
                }
            }
        }
        None => {
            // Free the host ports the new container will claim before it is
            // created.
            for container in &running {
                let existing = container.service_ports()?;
                if !conflicting_service_ports(&existing, &spec.ports).is_empty() {
                    operations.push(Operation::Stop(StopContainerOperation {
                        service_id: service_id.to_owned(),
                        container_id: container.id.clone(),
                        machine_id: machine_id.to_owned(),
                    }));
                }
            }
            operations.push(run(service_id, spec, machine_id));
            for container in containers {
                operations.push(remove(service_id, machine_id, &container.id));
            }
        }
    }
    Ok(operations)
}

fn run(service_id: &str, spec: &ServiceSpec, machine_id: &str) -> Operation {
    Operation::Run(RunContainerOperation {
        service_id: service_id.to_owned(),
        spec: spec.clone(),
        machine_id: machine_id.to_owned(),
    })
}

fn remove(service_id: &str, machine_id: &str, container_id: &str) -> Operation {
    Operation::Remove(RemoveContainerOperation {
        service_id: service_id.to_owned(),
        container_id: container_id.to_owned(),
        machine_id: machine_id.to_owned(),
        force: false,
    })
}

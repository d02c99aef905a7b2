//! Planner scenarios: fresh deployments, idempotent redeploys, conflicting
//! port updates and placement determinism.

mod common;
use crate::common::*;

use uncloud::machine::MachineState;
use uncloud::operation::{Operation, SequenceOperation};
use uncloud::planner::plan;
use uncloud::service::{is_valid_service_id, ServiceMode};

/// Flattened `(kind, machine_id, container_id?)` view of a sequence, in
/// execution order.
fn leaves(sequence: &SequenceOperation) -> Vec<(&'static str, String, Option<String>)> {
    sequence
        .operations
        .iter()
        .map(|op| match op {
            Operation::Run(op) => ("run", op.machine_id.clone(), None),
            Operation::Stop(op) => ("stop", op.machine_id.clone(), Some(op.container_id.clone())),
            Operation::Remove(op) => {
                ("remove", op.machine_id.clone(), Some(op.container_id.clone()))
            }
            Operation::Sequence(_) => panic!("planner emits a flat sequence"),
        })
        .collect()
}

fn service_ids(sequence: &SequenceOperation) -> Vec<String> {
    sequence
        .operations
        .iter()
        .map(|op| match op {
            Operation::Run(op) => op.service_id.clone(),
            Operation::Stop(op) => op.service_id.clone(),
            Operation::Remove(op) => op.service_id.clone(),
            Operation::Sequence(_) => panic!("planner emits a flat sequence"),
        })
        .collect()
}

#[test]
fn fresh_global_deploy_runs_on_every_up_machine() {
    let machines = vec![
        machine("a", MachineState::Up),
        machine("b", MachineState::Up),
        machine("c", MachineState::Up),
    ];
    let mut spec = web_spec("web", "nginx:1.27", 1, &[]);
    spec.mode = ServiceMode::Global;

    let sequence = plan(&machines, None, &spec).unwrap();
    assert_eq!(
        leaves(&sequence),
        vec![
            ("run", "a".to_owned(), None),
            ("run", "b".to_owned(), None),
            ("run", "c".to_owned(), None),
        ]
    );
    assert!(sequence.warnings.is_empty());

    // Every operation carries the same freshly generated service id.
    let ids = service_ids(&sequence);
    assert!(is_valid_service_id(&ids[0]), "bad service id: {}", ids[0]);
    assert!(ids.iter().all(|id| id == &ids[0]));
}

#[test]
fn identical_redeploy_is_a_no_op() {
    let machines = vec![machine("m1", MachineState::Up)];
    let spec = web_spec("web", "nginx:1.27", 1, &["app.example.com:8080/http"]);
    let service_id = "0123456789abcdef0123456789abcdef";
    let current = observed_service(
        service_id,
        &spec,
        vec![("m1", spec_container("c1", service_id, &spec))],
    );

    let sequence = plan(&machines, Some(&current), &spec).unwrap();
    assert!(sequence.is_empty(), "expected an empty plan: {sequence:?}");
}

#[test]
fn conflicting_port_update_stops_before_running() {
    let machines = vec![machine("m1", MachineState::Up)];
    let service_id = "0123456789abcdef0123456789abcdef";
    let old_spec = web_spec("web", "nginx:1.26", 1, &["80:80/tcp@host"]);
    let new_spec = web_spec("web", "nginx:1.27", 1, &["80:80/tcp@host"]);
    let current = observed_service(
        service_id,
        &old_spec,
        vec![("m1", spec_container("c-old", service_id, &old_spec))],
    );

    let sequence = plan(&machines, Some(&current), &new_spec).unwrap();
    assert_eq!(
        leaves(&sequence),
        vec![
            ("stop", "m1".to_owned(), Some("c-old".to_owned())),
            ("run", "m1".to_owned(), None),
            ("remove", "m1".to_owned(), Some("c-old".to_owned())),
        ]
    );
    // The update reuses the existing service id.
    assert!(service_ids(&sequence).iter().all(|id| id == service_id));
}

#[test]
fn update_without_port_conflict_runs_before_removing() {
    let machines = vec![machine("m1", MachineState::Up)];
    let service_id = "0123456789abcdef0123456789abcdef";
    let old_spec = web_spec("web", "nginx:1.26", 1, &["app.example.com:8080/http"]);
    let new_spec = web_spec("web", "nginx:1.27", 1, &["app.example.com:8080/http"]);
    let current = observed_service(
        service_id,
        &old_spec,
        vec![("m1", spec_container("c-old", service_id, &old_spec))],
    );

    // Ingress ports never conflict, so the old container keeps serving
    // until the replacement is up.
    let sequence = plan(&machines, Some(&current), &new_spec).unwrap();
    assert_eq!(
        leaves(&sequence),
        vec![
            ("run", "m1".to_owned(), None),
            ("remove", "m1".to_owned(), Some("c-old".to_owned())),
        ]
    );
}

#[test]
fn up_to_date_machine_only_sheds_stale_siblings() {
    let machines = vec![machine("m1", MachineState::Up)];
    let service_id = "0123456789abcdef0123456789abcdef";
    let spec = web_spec("web", "nginx:1.27", 1, &[]);
    let mut stale = spec_container("a-stale", service_id, &spec);
    stale.state.running = false;
    stale.state.status = uncloud::container::ContainerStatus::Exited;
    let current = observed_service(
        service_id,
        &spec,
        vec![
            ("m1", stale),
            ("m1", spec_container("b-live", service_id, &spec)),
        ],
    );

    let sequence = plan(&machines, Some(&current), &spec).unwrap();
    assert_eq!(
        leaves(&sequence),
        vec![("remove", "m1".to_owned(), Some("a-stale".to_owned()))]
    );
}

#[test]
fn replicated_placement_is_deterministic_and_removes_excess() {
    let machines = vec![
        machine("b", MachineState::Up),
        machine("a", MachineState::Suspect),
        machine("c", MachineState::Up),
    ];
    let spec = web_spec("web", "nginx:1.27", 2, &[]);
    let service_id = "0123456789abcdef0123456789abcdef";
    // A leftover replica sits on the suspect machine, which loses placement
    // to the two UP machines.
    let current = observed_service(
        service_id,
        &spec,
        vec![("a", spec_container("c-a", service_id, &spec))],
    );

    let sequence = plan(&machines, Some(&current), &spec).unwrap();
    assert_eq!(
        leaves(&sequence),
        vec![
            ("run", "b".to_owned(), None),
            ("run", "c".to_owned(), None),
            ("remove", "a".to_owned(), Some("c-a".to_owned())),
        ]
    );
}

#[test]
fn over_replication_plans_to_capacity_with_a_warning() {
    let machines = vec![
        machine("a", MachineState::Up),
        machine("b", MachineState::Up),
    ];
    let spec = web_spec("web", "nginx:1.27", 5, &[]);

    let sequence = plan(&machines, None, &spec).unwrap();
    assert_eq!(
        leaves(&sequence)
            .iter()
            .filter(|(kind, _, _)| *kind == "run")
            .count(),
        2
    );
    assert!(
        sequence.warnings.iter().any(|w| w.contains("5 replicas")),
        "missing over-replication warning: {:?}",
        sequence.warnings
    );
}

#[test]
fn down_machines_are_skipped_with_a_warning() {
    let machines = vec![
        machine("a", MachineState::Up),
        machine("d", MachineState::Down),
    ];
    let mut spec = web_spec("web", "nginx:1.27", 1, &[]);
    spec.mode = ServiceMode::Global;

    let sequence = plan(&machines, None, &spec).unwrap();
    assert_eq!(leaves(&sequence), vec![("run", "a".to_owned(), None)]);
    assert!(
        sequence.warnings.iter().any(|w| w.contains("machine-d")),
        "missing down-machine warning: {:?}",
        sequence.warnings
    );
}

/// For any machine, the planned sub-sequence is `[Stop*, Run?, Remove*]`.
#[test]
fn per_machine_subsequence_shape_holds() {
    let machines = vec![
        machine("m1", MachineState::Up),
        machine("m2", MachineState::Up),
    ];
    let service_id = "0123456789abcdef0123456789abcdef";
    let old_spec = web_spec("web", "nginx:1.26", 2, &["8080:80/tcp@host"]);
    let new_spec = web_spec("web", "nginx:1.27", 2, &["8080:80/tcp@host"]);

    let mut exited = spec_container("c-exited", service_id, &old_spec);
    exited.state.running = false;
    exited.state.status = uncloud::container::ContainerStatus::Exited;
    let current = observed_service(
        service_id,
        &old_spec,
        vec![
            ("m1", spec_container("c-live", service_id, &old_spec)),
            ("m1", exited),
            ("m2", spec_container("c-other", service_id, &old_spec)),
        ],
    );

    let sequence = plan(&machines, Some(&current), &new_spec).unwrap();
    for machine_id in ["m1", "m2"] {
        let kinds: Vec<&str> = leaves(&sequence)
            .into_iter()
            .filter(|(_, m, _)| m == machine_id)
            .map(|(kind, _, _)| kind)
            .collect();
        let runs = kinds.iter().filter(|k| **k == "run").count();
        assert!(runs <= 1, "machine {machine_id} got {runs} runs");
        let stop_after_run = kinds
            .iter()
            .position(|k| *k == "run")
            .map(|run| kinds[run..].contains(&"stop"))
            .unwrap_or(false);
        assert!(!stop_after_run, "stop after run on {machine_id}: {kinds:?}");
        let run_after_remove = kinds
            .iter()
            .position(|k| *k == "remove")
            .map(|remove| kinds[remove..].contains(&"run"))
            .unwrap_or(false);
        assert!(!run_after_remove, "run after remove on {machine_id}: {kinds:?}");
    }
}

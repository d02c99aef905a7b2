//! End-to-end deployment flows against an in-memory cluster: fresh
//! deployments, the image pull path, idempotent redeploys, immutability
//! validation and service removal.

mod common;
use crate::common::*;

use tokio_util::sync::CancellationToken;
use uncloud::errors::Error;
use uncloud::progress::NullProgress as NullSink;
use uncloud::machine::MachineState;
use uncloud::service::{is_valid_service_id, ServiceMode};
use uncloud::Deployment;

#[tokio::test]
async fn fresh_replicated_deploy_starts_a_container_per_target() {
    let fake = FakeCluster::new(
        &[("m1", MachineState::Up), ("m2", MachineState::Up)],
        &["nginx:1.27"],
    );
    let spec = web_spec("web", "nginx:1.27", 2, &["app.example.com:8080/http"]);
    let progress = RecordingProgress::default();

    let mut deployment = Deployment::new(fake.cluster(), spec).unwrap();
    let result = deployment
        .run(&progress, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.error.is_none(), "execution failed: {:?}", result.error);
    assert!(is_valid_service_id(&result.service_id));

    for machine_id in ["m1", "m2"] {
        let running = fake.runtime(machine_id).running_containers();
        assert_eq!(running.len(), 1, "machine {machine_id}");
        let container = &running[0];
        assert!(container.name.starts_with("web-"), "name {}", container.name);
        assert_eq!(container.service_id(), Some(result.service_id.as_str()));
        assert_eq!(container.service_name(), Some("web"));
    }

    let lines = progress.lines().join("\n");
    assert!(lines.contains("Creating"), "missing create event:\n{lines}");
    assert!(lines.contains("end") && lines.contains("Started"), "{lines}");
}

#[tokio::test]
async fn missing_image_is_pulled_and_create_retried() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &[]);
    let spec = web_spec("web", "nginx:1.27", 1, &[]);
    let progress = RecordingProgress::default();

    let mut deployment = Deployment::new(fake.cluster(), spec).unwrap();
    let result = deployment
        .run(&progress, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.error.is_none(), "execution failed: {:?}", result.error);

    let ops = fake.runtime("m1").ops();
    assert!(
        ops.contains(&"pull nginx:1.27".to_owned()),
        "missing pull: {ops:?}"
    );
    assert_eq!(fake.runtime("m1").running_containers().len(), 1);

    // Per-layer progress is forwarded as a child of the container task.
    let lines = progress.lines().join("\n");
    assert!(lines.contains("Pulling"), "missing pull progress:\n{lines}");
    assert!(lines.contains("(parent "), "missing layer child event:\n{lines}");
}

#[tokio::test]
async fn redeploying_an_identical_spec_plans_nothing() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &["nginx:1.27"]);
    let spec = web_spec("web", "nginx:1.27", 1, &["app.example.com:8080/http"]);

    let mut first = Deployment::new(fake.cluster(), spec.clone()).unwrap();
    let result = first
        .run(&NullSink, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.error.is_none());

    let mut second = Deployment::new(fake.cluster(), spec).unwrap();
    let sequence = second.plan(&CancellationToken::new()).await.unwrap();
    assert!(sequence.is_empty(), "expected a no-op plan: {sequence:?}");
}

#[tokio::test]
async fn service_mode_is_immutable_across_updates() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &["nginx:1.27"]);
    let spec = web_spec("web", "nginx:1.27", 1, &[]);

    let mut first = Deployment::new(fake.cluster(), spec.clone()).unwrap();
    first
        .run(&NullSink, &CancellationToken::new())
        .await
        .unwrap();

    let mut global = spec;
    global.mode = ServiceMode::Global;
    global.replicas = 0;
    let deployment = Deployment::new(fake.cluster(), global).unwrap();
    let err = deployment
        .validate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSpec { .. }), "got {err}");
}

#[tokio::test]
async fn plan_is_memoized_including_the_generated_service_id() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &["nginx:1.27"]);
    let spec = web_spec("web", "nginx:1.27", 1, &[]);

    let mut deployment = Deployment::new(fake.cluster(), spec).unwrap();
    let cancel = CancellationToken::new();
    let first = deployment.plan(&cancel).await.unwrap();
    let second = deployment.plan(&cancel).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn validation_rejects_zero_replicas() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &[]);
    let spec = web_spec("web", "nginx:1.27", 0, &[]);
    let deployment = Deployment::new(fake.cluster(), spec).unwrap();
    let err = deployment
        .validate(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidSpec { .. }));
}

#[tokio::test]
async fn missing_name_is_generated_from_the_image() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &[]);
    let spec = web_spec("", "ghcr.io/acme/web:1.4", 1, &[]);
    let deployment = Deployment::new(fake.cluster(), spec).unwrap();
    let name = &deployment.spec().name;
    assert!(name.starts_with("web-"), "generated name {name}");
    assert_eq!(name.len(), "web-".len() + 4);
}

#[tokio::test]
async fn cancelled_token_aborts_before_side_effects() {
    let fake = FakeCluster::new(&[("m1", MachineState::Up)], &["nginx:1.27"]);
    let spec = web_spec("web", "nginx:1.27", 1, &[]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut deployment = Deployment::new(fake.cluster(), spec).unwrap();
    let err = deployment.run(&NullSink, &cancel).await.unwrap_err();
    assert!(matches!(err, Error::Cancelled), "got {err}");
    assert!(fake.runtime("m1").ops().is_empty());
}

#[tokio::test]
async fn remove_service_force_removes_running_containers() {
    let fake = FakeCluster::new(
        &[("m1", MachineState::Up), ("m2", MachineState::Up)],
        &["nginx:1.27"],
    );
    let spec = web_spec("web", "nginx:1.27", 2, &[]);
    let cluster = fake.cluster();

    let mut deployment = Deployment::new(cluster.clone(), spec).unwrap();
    let result = deployment
        .run(&NullSink, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.error.is_none());

    cluster
        .remove_service("web", &NullSink, &CancellationToken::new())
        .await
        .unwrap();
    for machine_id in ["m1", "m2"] {
        assert!(
            fake.runtime(machine_id).running_containers().is_empty(),
            "machine {machine_id} still has containers"
        );
    }

    // The service is gone afterwards.
    let err = cluster
        .inspect_service("web", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#![deny(
    missing_docs,
    missing_debug_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]
//! # Uncloud: deployment core for a lightweight container orchestrator
//!
//! Given a desired service specification and the observed state of a
//! cluster of machines running a container runtime, this crate computes and
//! executes an ordered plan of container mutations that drives the cluster
//! toward the desired state, honoring host-port exclusivity, health gates
//! and rolling-update discipline.
//!
//! The crate covers four areas:
//!
//!  - the [port](crate::port) specification grammar and its conflict
//!    algebra,
//!  - the pure [planner](crate::planner) producing rolling-deployment
//!    operation sequences for replicated and global services,
//!  - the [caddy](crate::caddy) ingress synthesizer translating the live
//!    container set into the reverse proxy's routing configuration,
//!  - the [dispatch](crate::dispatch) layer fanning container RPCs out
//!    across machines and aggregating partial failures.
//!
//! Collaborators stay behind traits: the per-machine container runtime
//! ([`runtime::ContainerRuntime`]), the cluster membership service
//! ([`machine::ClusterMembership`]), and the distributed container store
//! ([`caddy::ContainerStore`]). The reverse proxy engine itself only
//! consumes the JSON configuration this crate emits.
//!
//! ## Port specs
//!
//! ```rust
//! use uncloud::port::PortSpec;
//!
//! let port: PortSpec = "app.example.com:6443:8080".parse().unwrap();
//! port.validate().unwrap();
//! assert_eq!(port.to_string(), "app.example.com:6443:8080");
//! ```
//!
//! ## Deploying a service
//!
//! ```rust,no_run
//! # async fn example(cluster: uncloud::cluster::Cluster) -> Result<(), uncloud::errors::Error> {
//! use tokio_util::sync::CancellationToken;
//! use uncloud::deploy::Deployment;
//! use uncloud::progress::NullProgress;
//! use uncloud::service::{ContainerSpec, ServiceSpec};
//!
//! let spec = ServiceSpec {
//!     name: "web".to_owned(),
//!     replicas: 2,
//!     container: ContainerSpec {
//!         image: "nginx:1.27".to_owned(),
//!         ..Default::default()
//!     },
//!     ports: vec!["app.example.com:8080/http".parse()?],
//!     ..Default::default()
//! };
//!
//! let mut deployment = Deployment::new(cluster, spec)?;
//! let result = deployment.run(&NullProgress, &CancellationToken::new()).await?;
//! println!("deployed service {}", result.service_id);
//! # Ok(())
//! # }
//! ```

// declare modules
pub mod caddy;
pub mod cluster;
pub mod container;
pub mod deploy;
pub mod dispatch;
pub mod errors;
pub mod image;
pub mod machine;
pub mod operation;
pub mod planner;
pub mod port;
pub mod probe;
pub mod progress;
pub mod runtime;
pub mod service;

// publicly re-export the main entry points
pub use cluster::Cluster;
pub use deploy::Deployment;
pub use errors::Error;

//! Ingress configuration synthesis for the reverse-proxy engine.
//!
//! The synthesizer turns the live set of containers on the overlay network
//! into the proxy engine's JSON app configuration: one HTTP server on port
//! 80 and one HTTPS server on port 443, each with a route per published
//! hostname. Output is deterministic byte-for-byte so a reload is a no-op
//! whenever nothing actually changed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::container::Container;
use crate::errors::Error;
use crate::port::{PortMode, PortProtocol};
use crate::probe::VERIFY_PATH;

/// Name of the cluster-internal overlay network. Containers publish ingress
/// ports through their address on this network.
pub const OVERLAY_NETWORK: &str = "uncloud";

const HTTP_SERVER: &str = "http";
const HTTPS_SERVER: &str = "https";

/// Root of the proxy engine's configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configured apps; only the HTTP app is used.
    pub apps: Apps,
}

/// The `apps` object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apps {
    /// The HTTP app with its servers.
    pub http: HttpApp,
}

/// The HTTP app: servers keyed by name, ordered for deterministic output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpApp {
    /// Servers keyed by a stable name.
    pub servers: BTreeMap<String, Server>,
}

/// One listening server with its ordered route table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Listen addresses, for example `:80`.
    pub listen: Vec<String>,
    /// Routes, evaluated in order.
    pub routes: Vec<Route>,
}

/// One route: request matchers and the handlers to run on a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Matchers; an empty list matches everything and is elided.
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<RouteMatch>,
    /// Handlers run for a matched request.
    pub handle: Vec<Handler>,
}

/// A single matcher object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    /// Match on the `Host` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Vec<String>>,
    /// Match on the request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<String>>,
}

/// A request handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "handler", rename_all = "snake_case")]
pub enum Handler {
    /// Proxy the request to one of the upstreams.
    ReverseProxy {
        /// Upstream pool, tried in order.
        upstreams: Vec<Upstream>,
    },
    /// Answer the request directly.
    StaticResponse {
        /// Response body.
        body: String,
        /// Response status code.
        status_code: u16,
    },
}

/// One reverse-proxy upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    /// `IP:PORT` the proxy dials.
    pub dial: String,
}

impl Config {
    /// Serializes the configuration to its canonical JSON bytes. Identical
    /// configurations always serialize to identical bytes.
    pub fn to_json(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Builds the proxy configuration for one machine from the live container
/// set.
///
/// Containers that are not healthy or have no address on the overlay
/// network are skipped. Ingress ports with a non-L7 protocol cannot be
/// routed by hostname and are skipped with a log line. The `machine_id` is
/// served on the HTTP verification route used by the reachability prober.
pub fn generate_config(machine_id: &str, containers: &[Container]) -> Config {
    let mut http_map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut https_map: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for container in containers {
        if !container.healthy() {
            log::debug!("skipping unhealthy container {} for ingress", container.name);
            continue;
        }
        let Some(ip) = container.network_ip(OVERLAY_NETWORK) else {
            log::debug!(
                "skipping container {}: not attached to the {OVERLAY_NETWORK} network",
                container.name
            );
            continue;
        };
        let ports = match container.service_ports() {
            Ok(ports) => ports,
            Err(e) => {
                log::warn!("skipping container {}: {e}", container.name);
                continue;
            }
        };
        for port in ports {
            if port.mode != PortMode::Ingress {
                continue;
            }
            let map = match port.protocol {
                PortProtocol::Http => &mut http_map,
                PortProtocol::Https => &mut https_map,
                PortProtocol::Tcp | PortProtocol::Udp => {
                    log::warn!(
                        "container {}: '{}' ingress ports are not routable by hostname, skipping",
                        container.name,
                        port.protocol
                    );
                    continue;
                }
            };
            let Some(hostname) = port.hostname else {
                continue;
            };
            map.entry(hostname)
                .or_default()
                .push(format!("{ip}:{}", port.container_port));
        }
    }

    let mut http_routes = vec![verify_route(machine_id)];
    http_routes.extend(host_routes(http_map));

    let mut servers = BTreeMap::new();
    servers.insert(
        HTTP_SERVER.to_owned(),
        Server {
            listen: vec![":80".to_owned()],
            routes: http_routes,
        },
    );
    servers.insert(
        HTTPS_SERVER.to_owned(),
        Server {
            listen: vec![":443".to_owned()],
            routes: host_routes(https_map),
        },
    );

    Config {
        apps: Apps {
            http: HttpApp { servers },
        },
    }
}

/// The verification route answered with the machine's own identifier,
/// consumed by the reachability prober.
fn verify_route(machine_id: &str) -> Route {
    Route {
        matchers: vec![RouteMatch {
            host: None,
            path: Some(vec![VERIFY_PATH.to_owned()]),
        }],
        handle: vec![Handler::StaticResponse {
            body: machine_id.to_owned(),
            status_code: 200,
        }],
    }
}

/// One route per hostname, in lexicographic hostname order, with upstreams
/// in the order the containers were listed.
fn host_routes(map: BTreeMap<String, Vec<String>>) -> Vec<Route> {
    map.into_iter()
        .map(|(hostname, upstreams)| Route {
            matchers: vec![RouteMatch {
                host: Some(vec![hostname]),
                path: None,
            }],
            handle: vec![Handler::ReverseProxy {
                upstreams: upstreams.into_iter().map(|dial| Upstream { dial }).collect(),
            }],
        })
        .collect()
}

/// The distributed container store collaborator.
///
/// The store delivers an initial snapshot plus change ticks. Ticks carry no
/// payload and may be lost or coalesced; consumers rescan with
/// [`ContainerStore::list`] on every tick.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Subscribes to container changes, returning the current snapshot and
    /// the change-tick channel.
    async fn subscribe(&self) -> Result<(Vec<Container>, mpsc::Receiver<()>), Error>;

    /// Lists the current container set.
    async fn list(&self) -> Result<Vec<Container>, Error>;
}

/// Receiver of newly generated proxy configurations.
#[async_trait]
pub trait ConfigSink: Send + Sync {
    /// Delivers a configuration that differs from the previously delivered
    /// one.
    async fn write(&self, config: &Config) -> Result<(), Error>;
}

/// Keeps one machine's reverse-proxy configuration in sync with the
/// container set.
pub struct IngressController {
    machine_id: String,
    store: Arc<dyn ContainerStore>,
    sink: Arc<dyn ConfigSink>,
}

impl fmt::Debug for IngressController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngressController")
            .field("machine_id", &self.machine_id)
            .finish()
    }
}

impl IngressController {
    /// Creates a controller for the machine with the given identifier.
    pub fn new(
        machine_id: impl Into<String>,
        store: Arc<dyn ContainerStore>,
        sink: Arc<dyn ConfigSink>,
    ) -> Self {
        IngressController {
            machine_id: machine_id.into(),
            store,
            sink,
        }
    }

    /// Runs until cancelled or until the subscription channel closes.
    ///
    /// Every change tick triggers a full rescan, so lost ticks are
    /// harmless and bursts collapse into a single recomputation. Transient
    /// store or sink failures are logged and the loop continues from the
    /// last delivered configuration; a closed subscription channel is
    /// fatal.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), Error> {
        let (snapshot, mut changes) = self.store.subscribe().await?;
        let mut last = generate_config(&self.machine_id, &snapshot);
        self.sink.write(&last).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                tick = changes.recv() => {
                    if tick.is_none() {
                        return Err(Error::runtime(
                            "the container subscription channel closed",
                        ));
                    }
                    // Coalesce a burst of ticks into one rescan.
                    while changes.try_recv().is_ok() {}

                    let containers = match self.store.list().await {
                        Ok(containers) => containers,
                        Err(e) => {
                            log::warn!("container rescan failed, keeping last configuration: {e}");
                            continue;
                        }
                    };
                    let config = generate_config(&self.machine_id, &containers);
                    if config == last {
                        continue;
                    }
                    match self.sink.write(&config).await {
                        Ok(()) => last = config,
                        Err(e) => {
                            log::warn!("failed to deliver ingress configuration: {e}");
                        }
                    }
                }
            }
        }
    }
}

//! External reachability probing of machines' ingress endpoints.
//!
//! Updating ingress DNS records requires knowing which machines are
//! actually reachable from outside the cluster. Each candidate machine's
//! reverse proxy serves a verification route returning the machine's own
//! identifier; the prober fetches that route over the machine's public
//! address and compares.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future;
use http::Request;
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::machine::MachineInfo;

/// Path of the verification route served by the ingress reverse proxy. The
/// response must be status 200 with the serving machine's identifier as the
/// body.
pub const VERIFY_PATH: &str = "/.uncloud-verify";

/// Fixed per-machine probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One machine's probe verdict.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// The probed machine.
    pub machine: MachineInfo,
    /// Whether the machine's ingress endpoint answered correctly.
    pub reachable: bool,
    /// Why the machine was classified unreachable, when it was.
    pub reason: Option<String>,
}

/// Probes machines' public ingress endpoints in parallel.
pub struct ReachabilityProber {
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl fmt::Debug for ReachabilityProber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachabilityProber").finish()
    }
}

impl Default for ReachabilityProber {
    fn default() -> Self {
        ReachabilityProber::new()
    }
}

impl ReachabilityProber {
    /// Creates a prober with its own HTTP client.
    pub fn new() -> Self {
        ReachabilityProber {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Probes every machine that has a public address, in parallel.
    ///
    /// Machines without a public address cannot serve external ingress
    /// traffic and are filtered out before probing rather than reported as
    /// unreachable.
    pub async fn probe(
        &self,
        machines: &[MachineInfo],
        cancel: &CancellationToken,
    ) -> Result<Vec<ProbeResult>, Error> {
        let candidates: Vec<&MachineInfo> =
            machines.iter().filter(|m| m.public_addr.is_some()).collect();

        let probes = candidates.iter().map(|machine| async {
            let verdict = self.probe_machine(machine).await;
            match verdict {
                Ok(()) => ProbeResult {
                    machine: (*machine).clone(),
                    reachable: true,
                    reason: None,
                },
                Err(reason) => {
                    log::debug!("machine {} failed the reachability probe: {reason}", machine.name);
                    ProbeResult {
                        machine: (*machine).clone(),
                        reachable: false,
                        reason: Some(reason),
                    }
                }
            }
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            results = future::join_all(probes) => Ok(results),
        }
    }

    /// Probes the given machines and returns the reachable ones, or
    /// [`Error::NoReachableMachines`] when none qualify.
    pub async fn reachable_machines(
        &self,
        machines: &[MachineInfo],
        cancel: &CancellationToken,
    ) -> Result<Vec<MachineInfo>, Error> {
        let results = self.probe(machines, cancel).await?;
        let reachable: Vec<MachineInfo> = results
            .into_iter()
            .filter(|r| r.reachable)
            .map(|r| r.machine)
            .collect();
        if reachable.is_empty() {
            return Err(Error::NoReachableMachines);
        }
        Ok(reachable)
    }

    /// Issues one GET against the machine's verification route. Returns the
    /// failure reason when the machine does not qualify.
    async fn probe_machine(&self, machine: &MachineInfo) -> Result<(), String> {
        // Pre-filtered by the caller.
        let addr = machine.public_addr.as_deref().unwrap_or_default();
        let uri = format!("http://{addr}{VERIFY_PATH}")
            .parse::<hyper::Uri>()
            .map_err(|e| format!("invalid public address '{addr}': {e}"))?;
        let request = Request::get(uri)
            .body(Empty::new())
            .map_err(|e| format!("request failed: {e}"))?;

        let exchange = async {
            let response = self
                .client
                .request(request)
                .await
                .map_err(|e| format!("request failed: {e}"))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| format!("request failed: {e}"))?
                .to_bytes();
            if status != http::StatusCode::OK {
                return Err(format!("unexpected status: {status}"));
            }
            if body.as_ref() != machine.id.as_bytes() {
                return Err("unexpected body: expected the machine id".to_owned());
            }
            Ok(())
        };

        match tokio::time::timeout(PROBE_TIMEOUT, exchange).await {
            Ok(verdict) => verdict,
            Err(_) => Err(format!(
                "request timed out after {}s",
                PROBE_TIMEOUT.as_secs()
            )),
        }
    }
}

//! Multi-machine RPC dispatch.
//!
//! A single logical call is targeted at one or more machines by attaching
//! their management addresses as out-of-band request metadata under the
//! [`MACHINES_METADATA_KEY`] key. The dispatcher broadcasts the call to
//! every listed target in parallel and returns one annotated response per
//! target. A failing target never poisons the aggregate: failures surface
//! per target and the caller chooses policy.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future;
use tokio_util::sync::CancellationToken;

use crate::errors::Error;
use crate::runtime::ContainerRuntime;

/// Metadata key whose values are the management addresses a call is
/// dispatched to. Repeatable.
pub const MACHINES_METADATA_KEY: &str = "machines";

/// Out-of-band request metadata: a string multimap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(HashMap<String, Vec<String>>);

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Metadata::default()
    }

    /// Metadata targeting the given machines' management addresses.
    pub fn for_machines<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut metadata = Metadata::new();
        for addr in addrs {
            metadata.append(MACHINES_METADATA_KEY, addr);
        }
        metadata
    }

    /// Appends a value under a key.
    pub fn append(&mut self, key: &str, value: impl Into<String>) {
        self.0.entry(key.to_owned()).or_default().push(value.into());
    }

    /// The values stored under a key, empty when absent.
    pub fn get(&self, key: &str) -> &[String] {
        self.0.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The management addresses this call is targeted at.
    pub fn machine_targets(&self) -> &[String] {
        self.get(MACHINES_METADATA_KEY)
    }
}

/// Opens runtime connections to machines by management address.
///
/// Connections are expected to be cheap to obtain repeatedly; pooling, if
/// needed, belongs to the implementation.
#[async_trait]
pub trait MachineConnector: Send + Sync {
    /// Connects to the container runtime behind a management address.
    async fn connect(&self, management_addr: &str) -> Result<Arc<dyn ContainerRuntime>, Error>;
}

/// One target's annotated outcome of a broadcast.
#[derive(Debug)]
pub struct MachineResponse<T> {
    /// Management address of the responding machine.
    pub machine_addr: String,
    /// The target's own success or failure.
    pub result: Result<T, Error>,
}

/// Splits annotated responses into successes and per-target errors.
pub fn split_responses<T>(
    responses: Vec<MachineResponse<T>>,
) -> (Vec<(String, T)>, Vec<(String, String)>) {
    let mut oks = Vec::new();
    let mut errs = Vec::new();
    for response in responses {
        match response.result {
            Ok(value) => oks.push((response.machine_addr, value)),
            Err(e) => errs.push((response.machine_addr, e.to_string())),
        }
    }
    (oks, errs)
}

/// Fans container RPCs out across machines.
#[derive(Clone)]
pub struct Dispatcher {
    connector: Arc<dyn MachineConnector>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher").finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over the given connector.
    pub fn new(connector: Arc<dyn MachineConnector>) -> Self {
        Dispatcher { connector }
    }

    /// Broadcasts `call` to every machine listed in the metadata, in
    /// parallel, and returns one annotated response per target.
    ///
    /// The aggregate call itself only fails on misuse (no targets) or
    /// cancellation; per-target failures are carried inside the responses.
    /// Response ordering is not guaranteed to match target ordering.
    pub async fn broadcast<T, F, Fut>(
        &self,
        metadata: &Metadata,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<Vec<MachineResponse<T>>, Error>
    where
        F: Fn(String, Arc<dyn ContainerRuntime>) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let targets = metadata.machine_targets();
        if targets.is_empty() {
            return Err(Error::invalid_spec(
                "a dispatch requires at least one target machine",
            ));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let call = &call;
        let requests = targets.iter().map(|addr| {
            let addr = addr.clone();
            let connector = Arc::clone(&self.connector);
            async move {
                log::debug!("dispatching to machine {addr}");
                let result = match connector.connect(&addr).await {
                    Ok(runtime) => call(addr.clone(), runtime).await,
                    Err(e) => Err(e),
                };
                MachineResponse {
                    machine_addr: addr,
                    result,
                }
            }
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            responses = future::join_all(requests) => Ok(responses),
        }
    }

    /// Runs `call` against a single machine, pinned through the `machines`
    /// metadata, and returns its sole result.
    pub async fn call_machine<T, F, Fut>(
        &self,
        management_addr: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T, Error>
    where
        F: Fn(String, Arc<dyn ContainerRuntime>) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let metadata = Metadata::for_machines([management_addr]);
        let responses = self.broadcast(&metadata, cancel, call).await?;
        let response = responses
            .into_iter()
            .next()
            .ok_or_else(|| Error::runtime("dispatch returned no response"))?;
        response.result
    }
}

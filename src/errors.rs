//! Errors emitted by the deployment core.

/// The error type used across the deployment core.
///
/// Validation errors surface before any side effect is taken. Errors raised
/// while executing an operation sequence abort the remaining steps but leave
/// already-applied steps in place.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A port or service specification failed grammar, range or combination
    /// validation.
    #[error("invalid specification: {message}")]
    InvalidSpec {
        /// What was wrong with the specification.
        message: String,
    },

    /// A service, machine, container or image lookup by id or name missed.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// The kind of object that was looked up.
        kind: &'static str,
        /// The id or name used for the lookup.
        id: String,
    },

    /// The requested image does not exist on the target machine and must be
    /// pulled before the container can be created.
    #[error("image not found: {image}")]
    ImageNotFound {
        /// The image reference that could not be resolved.
        image: String,
    },

    /// A uniqueness constraint was violated, for example a service with the
    /// same name already exists or a host port is already bound.
    #[error("conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// A machine's ingress endpoint failed the external reachability probe.
    #[error("machine '{machine}' is not reachable: {reason}")]
    Unreachable {
        /// Name or id of the probed machine.
        machine: String,
        /// Why the probe classified the machine as unreachable.
        reason: String,
    },

    /// No machine in the cluster passed the external reachability probe.
    #[error("no machines in the cluster are reachable from the outside")]
    NoReachableMachines,

    /// The underlying container runtime reported a failure.
    #[error("container runtime error: {message}")]
    Runtime {
        /// The runtime's error message, verbatim.
        message: String,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A multi-machine fan-out completed with at least one per-target error.
    ///
    /// Successful per-target responses are delivered alongside this error by
    /// the dispatch layer; the caller decides how severe the failures are.
    #[error("{} of {total} machines failed: {}", .errors.len(), format_target_errors(.errors))]
    PartialFailure {
        /// Total number of machines the call was fanned out to.
        total: usize,
        /// Per-target `(machine address, error message)` pairs.
        errors: Vec<(String, String)>,
    },

    /// Serializing the ingress configuration document failed.
    #[error("failed to serialize ingress configuration: {0}")]
    JsonSerialize(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for an [`Error::InvalidSpec`] with the given message.
    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Error::InvalidSpec {
            message: message.into(),
        }
    }

    /// Shorthand for an [`Error::NotFound`] of the given kind.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Shorthand for an [`Error::Runtime`] with the given message.
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
        }
    }

    /// Whether this error means the image is missing on the target machine,
    /// in which case the caller pulls the image and retries the create.
    pub fn is_image_not_found(&self) -> bool {
        matches!(self, Error::ImageNotFound { .. })
    }
}

fn format_target_errors(errors: &[(String, String)]) -> String {
    errors
        .iter()
        .map(|(addr, msg)| format!("{addr}: {msg}"))
        .collect::<Vec<_>>()
        .join("; ")
}

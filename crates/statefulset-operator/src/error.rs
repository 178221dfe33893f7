//! Operator error types.
//!
//! Every failure detected while reconciling a StatefulSet is converted into an
//! [`OperatorError`] at the point of detection and returned to the caller of
//! the public operation. Nothing in this crate retries.

use thiserror::Error;
use kube::Error as KubeError;

/// Errors that can occur while reconciling a StatefulSet.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// API call rejected or unreachable (non-kube collaborators)
    #[error("API error: {0}")]
    Api(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A readiness or deletion wait exceeded its deadline
    #[error("Exceeded timeout of {timeout_ms}ms while waiting for {kind} {namespace}/{name} to be {what}")]
    Timeout {
        /// What was being waited for ("ready", "deleted")
        what: String,
        /// Resource kind
        kind: String,
        /// Namespace of the resource
        namespace: String,
        /// Name of the resource
        name: String,
        /// The deadline that elapsed
        timeout_ms: u64,
    },

    /// One or more replicas did not become ready
    #[error("Replicas of StatefulSet {namespace}/{name} not ready: {}", unready.join(", "))]
    ReplicasNotReady {
        /// Namespace of the StatefulSet
        namespace: String,
        /// Name of the StatefulSet
        name: String,
        /// Names of every replica that failed its readiness wait
        unready: Vec<String>,
    },

    /// The delete call completed but reported that nothing was deleted
    #[error("{kind} {name} in namespace {namespace} has not been deleted")]
    NotDeleted {
        /// Resource kind
        kind: String,
        /// Namespace of the resource
        namespace: String,
        /// Name of the resource
        name: String,
    },

    /// Delete-then-recreate failed
    #[error("Failed to replace {kind} {name} in namespace {namespace}: {source}")]
    Replace {
        /// Resource kind
        kind: String,
        /// Namespace of the resource
        namespace: String,
        /// Name of the resource
        name: String,
        /// The failure that aborted the replace
        #[source]
        source: Box<OperatorError>,
    },

    /// Worker pool task panicked or was cancelled
    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The generation annotation cannot be incremented any further
    #[error("Generation {generation} of StatefulSet {namespace}/{name} cannot be incremented")]
    GenerationOverflow {
        /// Namespace of the StatefulSet
        namespace: String,
        /// Name of the StatefulSet
        name: String,
        /// The stored generation
        generation: i64,
    },
}

impl OperatorError {
    /// Whether this error is a deadline expiry, including one wrapped by a replace.
    ///
    /// Callers use this to decide between an immediate retry and backing off.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Replace { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

//! Error types for the Strata engine
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context a caller needs to act on the failure: the
//! resource id, the output resource's local id, and the underlying cause.

use thiserror::Error;

use crate::definition::ResourceId;

/// Main error type for Strata operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The dependency graph contains a cycle
    ///
    /// Every member of the cycle is named exactly once. Detected before any
    /// apply begins, so no partial deployment occurs.
    #[error("dependency cycle detected between resources: {}", format_members(members))]
    Cycle {
        /// The resources participating in the cycle
        members: Vec<ResourceId>,
    },

    /// A deferred value reference could not be resolved
    ///
    /// The referenced path is absent from the dependency's resolved
    /// properties. This is terminal for the whole operation: the graph is
    /// malformed relative to the backend's actual response.
    #[error("unresolved reference for {resource}: no value at '{path}' ({message})")]
    UnresolvedReference {
        /// The resource whose computed value failed to resolve
        resource: ResourceId,
        /// The property path that was looked up
        path: String,
        /// What was being resolved
        message: String,
    },

    /// A renderer rejected a resource definition
    #[error("render error for {resource}{}: {message}", field_suffix(field))]
    Render {
        /// The resource that failed to render
        resource: ResourceId,
        /// The offending field, when known
        field: Option<String>,
        /// Description of what's invalid
        message: String,
    },

    /// The backend rejected a desired-state payload
    #[error("apply error for {resource} [{local_id}]: {message}")]
    Apply {
        /// The resource being applied
        resource: ResourceId,
        /// Local id of the output resource that failed
        local_id: String,
        /// Description of the backend rejection
        message: String,
    },

    /// An applied workload failed to converge
    #[error("convergence error for {workload}: {failure}")]
    Convergence {
        /// Namespace/name of the workload being watched
        workload: String,
        /// What went wrong
        failure: ConvergenceFailure,
    },

    /// No handler is registered for a backend provider
    #[error("no resource handler registered for provider '{provider}'")]
    UnknownProvider {
        /// The provider tag with no registered handler
        provider: String,
    },

    /// A delete call failed with something other than not-found
    #[error("delete error for {resource} [{local_id}]: {message}")]
    Delete {
        /// The resource being deleted
        resource: ResourceId,
        /// Local id of the output resource that failed to delete
        local_id: String,
        /// Description of the failure
        message: String,
    },

    /// A persisted resource record was not found
    ///
    /// Deletion treats this as already-deleted success; reads surface it.
    #[error("resource record not found: {resource}")]
    NotFound {
        /// The resource whose record is absent
        resource: ResourceId,
    },

    /// The resource data store failed
    #[error("store error: {message}")]
    Store {
        /// Description of the failure
        message: String,
    },

    /// Payload or identity (de)serialization failed
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// A deployment operation stopped at a failed resource
    ///
    /// Resources applied before the failure remain live; there is no
    /// automatic rollback. `succeeded` and `failed` tell the caller exactly
    /// where the operation stopped so it can retry (Put is idempotent) or
    /// roll back manually.
    #[error(
        "deployment {operation} failed at {failed} (succeeded: {}): {source}",
        format_members(succeeded)
    )]
    Deployment {
        /// Operation id for log correlation
        operation: uuid::Uuid,
        /// Resources fully applied and persisted before the failure
        succeeded: Vec<ResourceId>,
        /// The resource whose render or apply failed
        failed: ResourceId,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },
}

/// Terminal convergence failures for one watch session
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConvergenceFailure {
    /// A pod could not be scheduled
    ///
    /// Not schedulable is a hard failure, not a transient condition: the
    /// session ends immediately.
    #[error("pod {pod} is not scheduled. Reason: {reason}, Message: {message}")]
    PodNotScheduled {
        /// The unschedulable pod's name
        pod: String,
        /// Scheduler-reported reason
        reason: String,
        /// Scheduler-reported message
        message: String,
    },

    /// A container terminated or cannot start
    ///
    /// Covers terminated containers and waiting reasons ErrImagePull,
    /// ImagePullBackOff, and CrashLoopBackOff.
    #[error("container in pod {pod} is in state '{state}'. Reason: {reason}, Message: {message}")]
    ContainerFailure {
        /// The failing pod's name
        pod: String,
        /// Container state at failure (Terminated or Waiting)
        state: String,
        /// Container-reported reason
        reason: String,
        /// Container-reported message
        message: String,
    },

    /// Correlating replica sets or pods failed
    ///
    /// Read errors during correlation are terminal for the session; whether
    /// to retry the deployment is the orchestrator's decision.
    #[error("failed to correlate workload state: {message}")]
    Correlation {
        /// Description of the read failure
        message: String,
    },

    /// No readiness signal arrived before the deadline
    ///
    /// Reason and message come from the workload's last observed condition,
    /// fetched with one final read, so they are never empty.
    #[error("workload convergence timed out. Last status: {reason}: {message}")]
    Timeout {
        /// Last observed condition reason
        reason: String,
        /// Last observed condition message
        message: String,
    },

    /// The parent deployment operation was cancelled
    #[error("workload convergence cancelled by parent operation")]
    Cancelled,
}

impl Error {
    /// Create a render error with the given message
    pub fn render(resource: ResourceId, message: impl Into<String>) -> Self {
        Self::Render {
            resource,
            field: None,
            message: message.into(),
        }
    }

    /// Create a render error naming the offending field
    pub fn render_field(
        resource: ResourceId,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Render {
            resource,
            field: Some(field.into()),
            message: message.into(),
        }
    }

    /// Create an apply error with the given message
    pub fn apply(
        resource: ResourceId,
        local_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Apply {
            resource,
            local_id: local_id.into(),
            message: message.into(),
        }
    }

    /// Create a store error with the given message
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Whether this error is a not-found record
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

fn format_members(members: &[ResourceId]) -> String {
    members
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn field_suffix(field: &Option<String>) -> String {
    match field {
        Some(f) => format!(" (field '{f}')"),
        None => String::new(),
    }
}

/// K8s API objects
pub mod api;

/// Status conditions
pub mod conditions;

/// Platform actuators that stop and start cluster machines
pub mod actuator;

/// Node readiness and CSR approval on resuming clusters
pub mod admission;

/// Controller configuration
pub mod config;

/// Hibernation state machine
pub mod hibernation;

/// K8s reconciliation logic
pub mod reconcilers;

/// Clients for the remote (managed) clusters
pub mod remote;

/// Auto-hibernate scheduling and requeue intervals
pub mod schedule;

/// Access to the hub cluster's resources
pub mod store;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error("Serde error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("Invalid cluster spec: {0}")]
    Validation(#[from] garde::Report),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Actuator error: {0}")]
    Actuator(String),
    #[error("Syncsets have not been applied yet")]
    SyncSetsNotApplied { requeue_after: Duration },
    #[error("Remote cluster is unreachable: {0}")]
    Unreachable(String),
    #[error("Missing field in object reference")]
    MissingField,
}

impl Error {
    /// Errors that will not resolve until the object itself changes
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::Validation(_))
    }

    /// A specific retry delay requested by the error, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::SyncSetsNotApplied { requeue_after } => Some(*requeue_after),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

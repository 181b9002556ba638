use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0} (kube error: {1})")]
    KubeError(String, #[source] kube::Error),

    #[error("{0}")]
    FormattingError(String, #[source] std::fmt::Error),

    #[error("{0}")]
    SerializationError(String, #[source] serde_json::Error),

    #[error("invalid trace ID")]
    InvalidTraceId,

    #[error("{0}: {1}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(String, #[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error(transparent)]
    K8sUtil(#[from] proxmox_k8s_util::error::Error),

    #[error(transparent)]
    Proxmox(#[from] proxmox_client::error::Error),

    #[error(transparent)]
    Ipam(#[from] proxmox_ipam::error::Error),

    #[error(transparent)]
    Bootstrap(#[from] proxmox_bootstrap::error::Error),

    #[error(transparent)]
    Scheduler(#[from] proxmox_scheduler::SchedulerError),

    /// Not a failure: ask the controller to requeue after `0` without advancing
    /// the error backoff policy or incrementing the reconcile-failure metric.
    ///
    /// Used when reconciliation is waiting on an external condition (hypervisor
    /// task still running, IP claim not yet bound) rather than recovering from
    /// an error.
    #[error("requeue after {0:?}")]
    RequeueAfter(Duration),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

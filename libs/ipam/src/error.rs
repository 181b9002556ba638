use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    K8sUtil(#[from] proxmox_k8s_util::error::Error),

    #[error("{0}: {1:?}")]
    Kube(String, #[source] Box<kube::Error>),

    #[error("pool {0} has no addresses configured")]
    EmptyPool(String),

    #[error("failed to parse address range {0:?}")]
    InvalidRange(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

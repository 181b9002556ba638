use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("transport error calling {0}: {1}")]
    Transport(String, #[source] reqwest::Error),

    #[error("proxmox API error ({status}) calling {endpoint}: {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// Distinguishes "no such VM" from any other transport or API failure, per
    /// the hypervisor facade's "VM not found" sentinel.
    #[error("vm {0} not found on node {1}")]
    VmNotFound(u32, String),

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("no hypervisor node has enough reservable memory")]
    InsufficientMemory,

    #[error("failed to parse {what}: {input:?}")]
    Parse { what: &'static str, input: String },

    #[error("missing credentials: set PROXMOX_URL/PROXMOX_TOKEN/PROXMOX_SECRET or reference a credential secret")]
    MissingCredentials,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

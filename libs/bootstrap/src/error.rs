use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to render network-config: {0}")]
    NetworkConfig(#[source] serde_yaml::Error),

    #[error("failed to render instance metadata: {0}")]
    InstanceMetadata(#[source] serde_yaml::Error),

    #[error("failed to parse caller-supplied Ignition payload: {0}")]
    IgnitionParse(#[source] serde_json::Error),

    #[error("failed to render Ignition document: {0}")]
    IgnitionRender(#[source] serde_json::Error),

    #[error("caller-supplied Ignition payload has an unexpected shape: {0} is not the object/array §4.6 requires")]
    IgnitionShape(String),

    #[error("no interfaces to render")]
    NoInterfaces,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

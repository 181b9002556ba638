pub mod client;
pub mod error;
pub mod mock;
pub mod task;
pub mod types;
pub mod wire;

pub use client::{Credentials, HttpProxmoxClient, ProxmoxClient};
pub use error::Error;
pub use mock::MockProxmoxClient;

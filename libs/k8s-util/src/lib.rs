pub mod client;
pub mod error;
pub mod events;
pub mod ttl;
pub mod types;

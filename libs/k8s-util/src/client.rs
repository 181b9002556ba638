use kube::{Client, Config};

/// Build an authenticated Kubernetes client from inferred configuration.
///
/// Kept as a thin wrapper (rather than calling `Client::try_from` directly
/// at every call site) so a future metrics/tracing tower layer has a single
/// place to attach.
pub async fn new_client(config: Config) -> kube::Result<Client> {
    Client::try_from(config)
}

//! Wires [`crate::reconcile::reconcile_cluster`] into a `kube::runtime::Controller`.

use crate::crd::ProxmoxCluster;
use crate::reconcile::reconcile_cluster;

use futures::StreamExt;
use kube::client::Client;
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use kube::Api;
use proxmox_operator::backoff_reconciler;
use proxmox_operator::controller::{check_api_queryable, ControllerId, State, Stores};
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "proxmoxcluster";

/// Start the `ProxmoxCluster` controller and run it to completion (i.e.
/// forever, barring shutdown).
pub async fn run(state: State, client: Client) {
    let clusters: Api<ProxmoxCluster> = check_api_queryable::<ProxmoxCluster>(client.clone()).await;
    let ctx = state.to_context::<ProxmoxCluster>(client, CONTROLLER_ID, Stores::default());

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    Controller::new(clusters, watcher::Config::default().any_semantic())
        .with_config(kube::runtime::controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_cluster),
            proxmox_operator::controller::error_policy::<ProxmoxCluster>,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

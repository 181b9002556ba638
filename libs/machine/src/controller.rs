//! Wires [`crate::reconcile::reconcile_machine`] into a `kube::runtime::Controller`.

use crate::crd::ProxmoxMachine;
use crate::reconcile::reconcile_machine;

use std::sync::Arc;

use futures::StreamExt;
use kube::client::Client;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::Api;
use proxmox_operator::backoff_reconciler;
use proxmox_operator::controller::{check_api_queryable, Context, ControllerId, State, Stores};
use proxmox_operator::error::Result;
use tokio::time::Duration;
use tracing::info;

pub const CONTROLLER_ID: ControllerId = "proxmoxmachine";

/// Bridges the 3-arg [`reconcile_machine`] (it takes the hypervisor facade
/// separately from the context, so reconciler unit tests can swap in a
/// [`proxmox_client::mock::MockProxmoxClient`] without touching `Context`)
/// to the 2-arg shape `backoff_reconciler!` expects.
async fn reconcile_machine_with_context(machine: Arc<ProxmoxMachine>, ctx: Arc<Context<ProxmoxMachine>>) -> Result<Action> {
    let client = ctx.proxmox_client().clone();
    reconcile_machine(machine, ctx, client).await
}

/// Start the `ProxmoxMachine` controller and run it to completion (i.e.
/// forever, barring shutdown).
pub async fn run(state: State, client: Client, proxmox_client: Arc<dyn proxmox_client::client::ProxmoxClient>) {
    let machines: Api<ProxmoxMachine> = check_api_queryable::<ProxmoxMachine>(client.clone()).await;
    let ctx = state
        .to_context::<ProxmoxMachine>(client, CONTROLLER_ID, Stores::default())
        .as_ref()
        .clone()
        .with_proxmox_client(proxmox_client);
    let ctx = Arc::new(ctx);

    info!(msg = format!("starting {CONTROLLER_ID} controller"));
    Controller::new(machines, watcher::Config::default().any_semantic())
        .with_config(kube::runtime::controller::Config::default().debounce(Duration::from_millis(500)))
        .shutdown_on_signal()
        .run(
            backoff_reconciler!(reconcile_machine_with_context),
            proxmox_operator::controller::error_policy::<ProxmoxMachine>,
            ctx.clone(),
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}

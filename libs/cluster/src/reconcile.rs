//! Cluster state machine (§4.7): credential-secret ownership, in-cluster
//! IP-pool materialization, control-plane endpoint gating, deletion guard.

use crate::crd::{
    ControlPlaneEndpoint, PROVISIONED_CONDITION, ProxmoxCluster, ProxmoxClusterStatus,
};
use crate::secret::{CREDENTIAL_SECRET_FINALIZER, add_owner_and_finalizer, remove_owner_and_maybe_finalizer};

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, OwnerReference, Time};
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as Finalizer, finalizer};
use kube::ResourceExt;
use proxmox_operator::controller::Context;
use proxmox_operator::error::{Error, Result};
use tracing::{debug, info, instrument, warn};

pub const CLUSTER_FINALIZER: &str = "proxmoxcluster.infrastructure.cluster.x-k8s.io";
pub const FIELD_MANAGER: &str = "proxmox-cluster-controller";
const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";
/// Matches the label every `ProxmoxMachine` carries pointing back at its
/// owning `ProxmoxCluster`, mirroring the upstream Cluster API convention of
/// `cluster.x-k8s.io/cluster-name` at the infrastructure layer.
pub const CLUSTER_NAME_LABEL: &str = "infrastructure.cluster.x-k8s.io/cluster-name";
const CHILD_MACHINE_REQUEUE: Duration = Duration::from_secs(15);

/// Whether a cluster may be marked provisioned: externally managed clusters
/// need a fully populated control-plane endpoint first (§3 invariant).
#[must_use]
pub fn can_mark_provisioned(externally_managed: bool, endpoint: Option<&ControlPlaneEndpoint>) -> bool {
    if !externally_managed {
        return true;
    }
    endpoint.is_some_and(ControlPlaneEndpoint::is_set)
}

#[instrument(skip(ctx, cluster))]
pub async fn reconcile_cluster(cluster: Arc<ProxmoxCluster>, ctx: Arc<Context<ProxmoxCluster>>) -> Result<Action> {
    let _timer = ctx.metrics.reconcile_count_and_measure();
    info!(msg = "reconciling proxmox cluster");

    if cluster.annotations().contains_key(PAUSED_ANNOTATION) {
        debug!(msg = "cluster paused, skipping");
        return Ok(Action::await_change());
    }

    let namespace = cluster.namespace().unwrap_or_default();

    if cluster.meta().deletion_timestamp.is_some()
        && !can_proceed_with_deletion(&cluster, ctx.client.clone(), &namespace).await?
    {
        return Ok(Action::requeue(CHILD_MACHINE_REQUEUE));
    }

    let api: Api<ProxmoxCluster> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            Finalizer::Apply(c) => apply(c, ctx.clone()).await,
            Finalizer::Cleanup(c) => cleanup(c, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError("failed on cluster finalizer".to_string(), Box::new(e)))
}

/// Refuses deletion per §4.7: the upper-layer (Cluster API) cluster must
/// also be in the process of being deleted, and no `ProxmoxMachine` may
/// still reference this cluster.
async fn can_proceed_with_deletion(cluster: &ProxmoxCluster, client: kube::Client, namespace: &str) -> Result<bool> {
    if !upper_cluster_is_being_deleted(cluster, client.clone(), namespace).await? {
        debug!(msg = "upper-layer cluster is not being deleted, refusing");
        return Ok(false);
    }

    let child_count = count_child_machines(cluster, client, namespace).await?;
    if child_count > 0 {
        debug!(msg = "child machines remain", count = child_count);
        return Ok(false);
    }

    Ok(true)
}

async fn upper_cluster_is_being_deleted(cluster: &ProxmoxCluster, client: kube::Client, namespace: &str) -> Result<bool> {
    let Some(owner) = cluster.owner_references().iter().find(|o| o.kind == "Cluster") else {
        // no upper-layer owner recorded yet; nothing blocks deletion on its account
        return Ok(true);
    };

    let gvk = GroupVersionKind::gvk("cluster.x-k8s.io", "v1beta1", "Cluster");
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &ApiResource::from_gvk(&gvk));
    match api.get_opt(&owner.name).await {
        Ok(Some(obj)) => Ok(obj.meta().deletion_timestamp.is_some()),
        Ok(None) => Ok(true),
        Err(e) => {
            warn!(msg = "failed to look up upper-layer cluster", %e);
            Err(Error::KubeError(format!("failed to get Cluster {namespace}/{}", owner.name), e))
        }
    }
}

async fn count_child_machines(cluster: &ProxmoxCluster, client: kube::Client, namespace: &str) -> Result<usize> {
    let gvk = GroupVersionKind::gvk("infrastructure.cluster.x-k8s.io", "v1alpha2", "ProxmoxMachine");
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &ApiResource::from_gvk(&gvk));
    let selector = format!("{CLUSTER_NAME_LABEL}={}", cluster.name_any());
    let list = api
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| Error::KubeError(format!("failed to list ProxmoxMachines for {namespace}/{}", cluster.name_any()), e))?;
    Ok(list.items.len())
}

async fn apply(cluster: Arc<ProxmoxCluster>, ctx: Arc<Context<ProxmoxCluster>>) -> Result<Action> {
    let namespace = cluster.namespace().unwrap_or_default();
    let mut status = cluster.status.clone().unwrap_or_default();

    if !can_mark_provisioned(cluster.spec.externally_managed, cluster.spec.control_plane_endpoint.as_ref()) {
        debug!(msg = "waiting for externally managed control-plane endpoint");
        return Ok(Action::requeue(std::time::Duration::from_secs(15)));
    }

    materialize_ip_pools(&cluster, &mut status, ctx.client.clone(), &namespace).await?;

    if let Some(secret_ref) = &cluster.spec.credential_secret_ref {
        ensure_credential_secret_owned(&cluster, &secret_ref.name, ctx.client.clone(), &namespace).await?;
    }

    status.provisioned = true;
    set_provisioned_condition(&mut status, true, "Provisioned", "cluster is ready");
    patch_status(&cluster, status, ctx.client.clone(), &namespace).await?;

    Ok(Action::requeue(proxmox_operator::controller::DEFAULT_RECONCILE_INTERVAL))
}

async fn cleanup(cluster: Arc<ProxmoxCluster>, ctx: Arc<Context<ProxmoxCluster>>) -> Result<Action> {
    // absence of child machines was already confirmed by `can_proceed_with_deletion`
    // before the finalizer wrapper dispatched this cleanup event.
    let namespace = cluster.namespace().unwrap_or_default();

    if let Some(secret_ref) = &cluster.spec.credential_secret_ref {
        release_credential_secret(&cluster, &secret_ref.name, ctx.client.clone(), &namespace).await?;
    }

    Ok(Action::await_change())
}

async fn materialize_ip_pools(
    cluster: &ProxmoxCluster,
    status: &mut ProxmoxClusterStatus,
    client: kube::Client,
    namespace: &str,
) -> Result<()> {
    use proxmox_ipam::coordinator::materialize_in_cluster_pool_spec;
    use proxmox_ipam::crd::InClusterIPPool;

    let api: Api<InClusterIPPool> = Api::namespaced(client, namespace);
    let mut refs = Vec::new();

    for (idx, range) in cluster.spec.ipv4_ranges.iter().enumerate() {
        let name = format!("{}-v4-{idx}", cluster.name_any());
        let spec = materialize_in_cluster_pool_spec(range.clone(), None);
        upsert_pool(&api, &name, spec).await?;
        refs.push(name);
    }
    for (idx, range) in cluster.spec.ipv6_ranges.iter().enumerate() {
        let name = format!("{}-v6-{idx}", cluster.name_any());
        let spec = materialize_in_cluster_pool_spec(range.clone(), None);
        upsert_pool(&api, &name, spec).await?;
        refs.push(name);
    }

    status.ip_pool_refs = refs;
    Ok(())
}

async fn upsert_pool(
    api: &Api<proxmox_ipam::crd::InClusterIPPool>,
    name: &str,
    spec: proxmox_ipam::crd::InClusterIPPoolSpec,
) -> Result<()> {
    use proxmox_ipam::crd::InClusterIPPool;

    let pool = InClusterIPPool {
        metadata: kube::api::ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec,
    };
    api.patch(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&pool))
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to materialize pool {name}"), Box::new(e))))?;
    Ok(())
}

async fn ensure_credential_secret_owned(
    cluster: &ProxmoxCluster,
    secret_name: &str,
    client: kube::Client,
    namespace: &str,
) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let mut secret = api
        .get(secret_name)
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to get secret {namespace}/{secret_name}"), Box::new(e))))?;

    let owner = cluster_owner_ref(cluster);
    if add_owner_and_finalizer(&mut secret, owner) {
        api.patch(secret_name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to patch secret {namespace}/{secret_name}"), Box::new(e))))?;
    }
    Ok(())
}

async fn release_credential_secret(
    cluster: &ProxmoxCluster,
    secret_name: &str,
    client: kube::Client,
    namespace: &str,
) -> Result<()> {
    let api: Api<Secret> = Api::namespaced(client, namespace);
    let Some(mut secret) = api
        .get_opt(secret_name)
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to get secret {namespace}/{secret_name}"), Box::new(e))))?
    else {
        // tolerate a missing secret on the delete path (§4.8)
        return Ok(());
    };

    let uid = cluster.uid().unwrap_or_default();
    if remove_owner_and_maybe_finalizer(&mut secret, &uid) {
        api.patch(secret_name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to patch secret {namespace}/{secret_name}"), Box::new(e))))?;
    }
    Ok(())
}

fn cluster_owner_ref(cluster: &ProxmoxCluster) -> OwnerReference {
    OwnerReference {
        api_version: "infrastructure.cluster.x-k8s.io/v1alpha2".to_string(),
        kind: "ProxmoxCluster".to_string(),
        name: cluster.name_any(),
        uid: cluster.uid().unwrap_or_default(),
        controller: Some(false),
        block_owner_deletion: Some(false),
    }
}

fn set_provisioned_condition(status: &mut ProxmoxClusterStatus, ready: bool, reason: &str, message: &str) {
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    conditions.retain(|c| c.type_ != PROVISIONED_CONDITION);
    conditions.push(Condition {
        type_: PROVISIONED_CONDITION.to_string(),
        status: if ready { "True".to_string() } else { "False".to_string() },
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Time(k8s_openapi::chrono::Utc::now()),
        observed_generation: None,
    });
}

async fn patch_status(
    cluster: &ProxmoxCluster,
    status: ProxmoxClusterStatus,
    client: kube::Client,
    namespace: &str,
) -> Result<()> {
    let api: Api<ProxmoxCluster> = Api::namespaced(client, namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError("failed to patch cluster status".into(), Box::new(e))))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::ControlPlaneEndpoint;

    #[test]
    fn externally_managed_requires_full_endpoint() {
        assert!(!can_mark_provisioned(true, None));
        assert!(!can_mark_provisioned(
            true,
            Some(&ControlPlaneEndpoint { host: String::new(), port: 6443 })
        ));
        assert!(!can_mark_provisioned(
            true,
            Some(&ControlPlaneEndpoint { host: "cp.example".into(), port: 0 })
        ));
        assert!(can_mark_provisioned(
            true,
            Some(&ControlPlaneEndpoint { host: "cp.example".into(), port: 6443 })
        ));
    }

    #[test]
    fn self_managed_never_needs_an_endpoint() {
        assert!(can_mark_provisioned(false, None));
    }
}

//! Reads from the two external collaborators this reconciler depends on but
//! never writes: the owning `ProxmoxCluster` and the upper-layer Cluster API
//! `Machine` (§1, §4.1 states 2 and 8).

use proxmox_cluster::ProxmoxCluster;
use proxmox_operator::error::{Error, Result};

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};

const MACHINE_GVK_GROUP: &str = "cluster.x-k8s.io";
const MACHINE_GVK_VERSION: &str = "v1beta1";
const MACHINE_GVK_KIND: &str = "Machine";

/// Look up the `ProxmoxCluster` this machine declares itself a member of.
pub async fn get_owning_cluster(client: Client, namespace: &str, cluster_name: &str) -> Result<Option<ProxmoxCluster>> {
    let api: Api<ProxmoxCluster> = Api::namespaced(client, namespace);
    api.get_opt(cluster_name)
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to get ProxmoxCluster {namespace}/{cluster_name}"), Box::new(e))))
}

/// The subset of the upper-layer Machine this reconciler reads.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpperMachine {
    pub bootstrap_data_secret_name: Option<String>,
    pub bootstrap_ready: bool,
    pub is_control_plane: bool,
}

const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Read the upper-layer Machine owning this `ProxmoxMachine`, if any owner
/// reference to one is already recorded. Returns `None` before the upper
/// controller has set ownership (§4.1 state "WaitingForBootstrapData"
/// degenerates to "keep waiting" in that case).
pub async fn get_upper_machine(
    client: Client,
    namespace: &str,
    owner_references: &[k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference],
) -> Result<Option<UpperMachine>> {
    let Some(owner) = owner_references.iter().find(|o| o.kind == MACHINE_GVK_KIND) else {
        return Ok(None);
    };

    let gvk = GroupVersionKind::gvk(MACHINE_GVK_GROUP, MACHINE_GVK_VERSION, MACHINE_GVK_KIND);
    let api: Api<DynamicObject> = Api::namespaced_with(client, namespace, &ApiResource::from_gvk(&gvk));
    let Some(obj) = api
        .get_opt(&owner.name)
        .await
        .map_err(|e| Error::K8sUtil(proxmox_k8s_util::error::Error::KubeError(format!("failed to get Machine {namespace}/{}", owner.name), Box::new(e))))?
    else {
        return Ok(None);
    };

    let bootstrap_data_secret_name = obj
        .data
        .get("spec")
        .and_then(|s| s.get("bootstrap"))
        .and_then(|b| b.get("dataSecretName"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let bootstrap_ready = obj
        .data
        .get("status")
        .and_then(|s| s.get("bootstrapReady"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let is_control_plane = obj.labels().contains_key(CONTROL_PLANE_LABEL);

    Ok(Some(UpperMachine {
        bootstrap_data_secret_name,
        bootstrap_ready,
        is_control_plane,
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn control_plane_label_detection() {
        assert_eq!(CONTROL_PLANE_LABEL, "cluster.x-k8s.io/control-plane");
    }
}

//! Credential-secret lifecycle (§4.8): a single secret may carry owner
//! references for multiple clusters. The mutation logic is expressed as pure
//! functions over [`Secret`] so it is unit-testable without a live API
//! server; the reconciler only wires them to a `patch` call.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;

pub const CREDENTIAL_SECRET_FINALIZER: &str = "proxmoxcluster.infrastructure.cluster.x-k8s.io/secret";

/// Append `owner`'s reference if absent and ensure the shared finalizer is
/// present. Returns `true` if the secret was mutated (so the caller knows
/// whether a patch is needed).
pub fn add_owner_and_finalizer(secret: &mut Secret, owner: OwnerReference) -> bool {
    let mut mutated = false;

    let owners = secret.metadata.owner_references.get_or_insert_with(Vec::new);
    if !owners.iter().any(|o| o.uid == owner.uid) {
        owners.push(owner);
        mutated = true;
    }

    let finalizers = secret.finalizers_mut();
    if !finalizers.iter().any(|f| f == CREDENTIAL_SECRET_FINALIZER) {
        finalizers.push(CREDENTIAL_SECRET_FINALIZER.to_string());
        mutated = true;
    }

    mutated
}

/// Remove `cluster_uid`'s owner reference. If it was the last remaining
/// owner reference and the finalizer is present, drop the finalizer too, so
/// the secret can be garbage-collected. Returns `true` if mutated.
pub fn remove_owner_and_maybe_finalizer(secret: &mut Secret, cluster_uid: &str) -> bool {
    let mut mutated = false;

    if let Some(owners) = secret.metadata.owner_references.as_mut() {
        let before = owners.len();
        owners.retain(|o| o.uid != cluster_uid);
        if owners.len() != before {
            mutated = true;
        }
    }

    let remaining_owners = secret
        .metadata
        .owner_references
        .as_ref()
        .map(Vec::len)
        .unwrap_or(0);

    if remaining_owners == 0 {
        let finalizers = secret.finalizers_mut();
        let before = finalizers.len();
        finalizers.retain(|f| f != CREDENTIAL_SECRET_FINALIZER);
        if finalizers.len() != before {
            mutated = true;
        }
    }

    mutated
}

#[cfg(test)]
mod test {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "infrastructure.cluster.x-k8s.io/v1alpha2".to_string(),
            kind: "ProxmoxCluster".to_string(),
            name: format!("cluster-{uid}"),
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn adding_is_idempotent() {
        let mut secret = Secret::default();
        assert!(add_owner_and_finalizer(&mut secret, owner("a")));
        assert!(!add_owner_and_finalizer(&mut secret, owner("a")));
        assert_eq!(secret.metadata.owner_references.unwrap().len(), 1);
        assert_eq!(secret.finalizers().len(), 1);
    }

    #[test]
    fn two_clusters_share_one_secret_and_only_last_removal_drops_finalizer() {
        let mut secret = Secret::default();
        add_owner_and_finalizer(&mut secret, owner("a"));
        add_owner_and_finalizer(&mut secret, owner("b"));
        assert_eq!(secret.metadata.owner_references.as_ref().unwrap().len(), 2);

        assert!(remove_owner_and_maybe_finalizer(&mut secret, "b"));
        assert_eq!(secret.metadata.owner_references.as_ref().unwrap().len(), 1);
        assert_eq!(secret.finalizers().len(), 1, "finalizer stays while cluster a still owns it");

        assert!(remove_owner_and_maybe_finalizer(&mut secret, "a"));
        assert_eq!(secret.metadata.owner_references.as_ref().unwrap().len(), 0);
        assert!(secret.finalizers().is_empty(), "last owner removed, finalizer drops");
    }

    #[test]
    fn removing_an_absent_owner_is_a_no_op() {
        let mut secret = Secret::default();
        add_owner_and_finalizer(&mut secret, owner("a"));
        assert!(!remove_owner_and_maybe_finalizer(&mut secret, "never-added"));
    }
}

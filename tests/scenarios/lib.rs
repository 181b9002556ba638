//! Crate-spanning scenarios that exercise more than one reconciler crate's
//! public surface together. Scenario-local logic already has a unit test in
//! its owning crate; what belongs here is the story that crosses a crate
//! boundary, so a regression in how two crates' public APIs compose wouldn't
//! be caught by either crate's own test module in isolation.

#[cfg(test)]
mod test {
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use kube::ResourceExt;
    use proxmox_cluster::secret::{add_owner_and_finalizer, remove_owner_and_maybe_finalizer, CREDENTIAL_SECRET_FINALIZER};

    fn cluster_owner_ref(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "infrastructure.cluster.x-k8s.io/v1alpha2".to_string(),
            kind: "ProxmoxCluster".to_string(),
            name: format!("cluster-{uid}"),
            uid: uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }

    /// Two clusters reference the same credential secret (§8 scenario 5):
    /// cluster A creates it with an owner-ref and the shared finalizer,
    /// cluster B reconciles and appends its own owner-ref. Deleting B leaves
    /// A's owner-ref and the finalizer in place; only deleting A (the last
    /// remaining owner) drops the finalizer so the secret can finally be
    /// garbage-collected.
    #[test]
    fn secret_shared_across_two_clusters_only_drops_finalizer_on_last_removal() {
        let mut secret = Secret::default();

        assert!(add_owner_and_finalizer(&mut secret, cluster_owner_ref("cluster-a")));
        assert!(add_owner_and_finalizer(&mut secret, cluster_owner_ref("cluster-b")));
        assert_eq!(secret.metadata.owner_references.as_ref().unwrap().len(), 2);
        assert!(secret.finalizers().iter().any(|f| f == CREDENTIAL_SECRET_FINALIZER));

        assert!(remove_owner_and_maybe_finalizer(&mut secret, "cluster-b"));
        let owners = secret.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].uid, "cluster-a");
        assert!(
            secret.finalizers().iter().any(|f| f == CREDENTIAL_SECRET_FINALIZER),
            "cluster-a still owns the secret, finalizer must stay"
        );

        assert!(remove_owner_and_maybe_finalizer(&mut secret, "cluster-a"));
        assert_eq!(secret.metadata.owner_references.as_ref().unwrap().len(), 0);
        assert!(secret.finalizers().is_empty(), "last owner gone, finalizer drops so the secret can be GC'd");
    }
}

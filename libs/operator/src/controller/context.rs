use super::{ControllerId, DEFAULT_RECONCILE_INTERVAL, Stores};

use crate::metrics::ControllerMetrics;
use proxmox_k8s_util::error::{Error, Result};
use proxmox_k8s_util::events::Recorder;
use proxmox_k8s_util::types::short_type_name;

use std::collections::HashMap;
use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Patch, PatchParams};
use kube::runtime::reflector::{Lookup, ObjectRef};
use kube::{Api, Resource, ResourceExt, client::Client};
use proxmox_client::client::ProxmoxClient;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::time::Duration;
use tracing::{info, trace};

/// Context handed to every reconcile function.
#[derive(Clone)]
pub struct Context<K: Resource> {
    /// Controller ID, used as the field manager name and metric label.
    pub controller_id: ControllerId,
    /// Kubernetes client.
    pub client: Client,
    /// Prometheus metrics for this controller.
    pub metrics: Arc<ControllerMetrics>,
    /// Event recorder.
    pub recorder: Recorder,
    /// Shared reflector stores for resources this controller owns or reads.
    pub stores: Stores,
    /// Hypervisor facade, only populated for controllers that talk to Proxmox directly.
    pub proxmox_client: Option<Arc<dyn ProxmoxClient>>,
    /// Per-object exponential backoff state.
    error_backoff_cache: Arc<RwLock<HashMap<ObjectRef<K>, RwLock<ExponentialBackoff>>>>,
}

impl<K> Context<K>
where
    K: Resource + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub fn new(
        controller_id: ControllerId,
        client: Client,
        metrics: Arc<ControllerMetrics>,
        recorder: Recorder,
        stores: Stores,
    ) -> Self {
        Self {
            controller_id,
            client,
            metrics,
            recorder,
            stores,
            proxmox_client: None,
            error_backoff_cache: Arc::default(),
        }
    }

    #[must_use]
    pub fn with_proxmox_client(mut self, proxmox_client: Arc<dyn ProxmoxClient>) -> Self {
        self.proxmox_client = Some(proxmox_client);
        self
    }

    /// The hypervisor facade this context was built with.
    ///
    /// # Panics
    /// Panics if the controller wiring never attached one via [`Context::with_proxmox_client`].
    pub fn proxmox_client(&self) -> &Arc<dyn ProxmoxClient> {
        self.proxmox_client
            .as_ref()
            .unwrap_or_else(|| panic!("proxmox client is not initialized for this context"))
    }
}

#[allow(async_fn_in_trait)]
pub trait BackoffContext<K: Resource> {
    fn metrics(&self) -> &Arc<ControllerMetrics>;
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration;
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>);
}

impl<K> BackoffContext<K> for Context<K>
where
    K: Resource<DynamicType = ()> + ResourceExt + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        &self.metrics
    }

    /// Return the next duration of the backoff policy for the given object.
    async fn get_backoff(&self, obj_ref: ObjectRef<K>) -> Duration {
        {
            let read_guard = self.error_backoff_cache.read().await;
            if let Some(backoff) = read_guard.get(&obj_ref) {
                if let Some(duration) = backoff.write().await.next() {
                    return duration;
                }
            }
        }

        // Backoff policy: 1s, 2s, 4s, 8s, 16s, 32s, 64s, 128s, 256s, 300s, 300s...
        let mut backoff = ExponentialBuilder::default()
            .with_max_delay(DEFAULT_RECONCILE_INTERVAL)
            .without_max_times()
            .build();
        // safe unwrap: first backoff is always Some(Duration)
        let duration = backoff.next().unwrap();
        self.error_backoff_cache
            .write()
            .await
            .insert(obj_ref.clone(), RwLock::new(backoff));
        trace!(
            msg = "recreate backoff policy",
            namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
            name = obj_ref.name,
        );
        duration
    }

    /// Reset the backoff policy for the given object.
    async fn reset_backoff(&self, obj_ref: ObjectRef<K>) {
        let read_guard = self.error_backoff_cache.read().await;
        if read_guard.get(&obj_ref).is_some() {
            drop(read_guard);
            trace!(
                msg = "reset backoff policy",
                namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
                name = obj_ref.name
            );
            self.error_backoff_cache.write().await.remove(&obj_ref);
        }
    }
}

/// Server-side-apply and delete helpers for objects a controller owns.
#[allow(async_fn_in_trait)]
pub trait KubeOperations<T, K>
where
    T: Resource + ResourceExt + Lookup + Clone + 'static,
    <T as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
    K: Resource<Scope = NamespaceResourceScope> + Serialize + Clone + std::fmt::Debug + for<'de> Deserialize<'de>,
    <K as kube::Resource>::DynamicType: Default,
    <K as Resource>::Scope: std::marker::Sized,
{
    async fn kube_delete(&self, client: Client, metrics: &ControllerMetrics, obj: &K) -> Result<()>;
    async fn kube_patch(&self, client: Client, metrics: &ControllerMetrics, obj: K, field_manager: &str) -> Result<K>;
}

impl<T, K> KubeOperations<T, K> for T
where
    T: Resource + ResourceExt + Lookup + Clone + 'static,
    <T as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
    K: Resource<Scope = NamespaceResourceScope> + Serialize + Clone + std::fmt::Debug + for<'de> Deserialize<'de>,
    <K as kube::Resource>::DynamicType: Default,
    <K as Resource>::Scope: std::marker::Sized,
{
    async fn kube_delete(&self, client: Client, _metrics: &ControllerMetrics, obj: &K) -> Result<()> {
        let name = obj.name_any();
        let namespace = kube::ResourceExt::namespace(self).ok_or(Error::MissingObject("namespace"))?;
        trace!(
            msg = format!("deleting {}", short_type_name::<K>()),
            resource.name = &name,
            resource.namespace = &namespace
        );
        let api = Api::<K>::namespaced(client, &namespace);
        api.delete(&name, &Default::default()).await.map_err(|e| {
            Error::KubeError(
                format!("failed to delete {} {namespace}/{name}", short_type_name::<K>()),
                Box::new(e),
            )
        })?;
        Ok(())
    }

    async fn kube_patch(&self, client: Client, metrics: &ControllerMetrics, obj: K, field_manager: &str) -> Result<K> {
        let name = obj.name_any();
        let namespace = kube::ResourceExt::namespace(self).ok_or(Error::MissingObject("namespace"))?;
        trace!(
            msg = format!("patching {}", short_type_name::<K>()),
            resource.name = &name,
            resource.namespace = &namespace
        );
        let resource_api = Api::<K>::namespaced(client.clone(), &namespace);

        let result = resource_api
            .patch(&name, &PatchParams::apply(field_manager).force(), &Patch::Apply(&obj))
            .await;
        match result {
            Ok(resource) => Ok(resource),
            Err(e) => match e {
                kube::Error::Api(ref ae) if ae.code == 422 => {
                    info!(
                        msg = format!("recreating {} because the update operation was not possible", short_type_name::<K>()),
                        reason = &ae.reason
                    );
                    self.kube_delete(client.clone(), metrics, &obj).await?;
                    metrics.reconcile_deploy_delete_create_inc();
                    resource_api
                        .patch(&name, &PatchParams::apply(field_manager).force(), &Patch::Apply(&obj))
                        .await
                        .map_err(|e| {
                            Error::KubeError(
                                format!("failed to re-try patch {} {namespace}/{name}", short_type_name::<K>()),
                                Box::new(e),
                            )
                        })
                }
                _ => Err(Error::KubeError(
                    format!("failed to patch {} {namespace}/{name}", short_type_name::<K>()),
                    Box::new(e),
                )),
            },
        }
    }
}

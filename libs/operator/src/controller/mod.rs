pub mod context;

pub use self::context::{BackoffContext, Context, KubeOperations};

use crate::error::{Error, Result};
use crate::metrics::Metrics;

use std::fmt::Debug;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, ReflectHandle, Store};
use kube::Resource;
use prometheus_client::registry::Registry;
use proxmox_k8s_util::types::short_type_name;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::error;

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const SUBSCRIBE_BUFFER_SIZE: usize = 256;

/// defines store structs shared between controllers watching the same owned
/// resource kinds. E.g:
/// ```ignore
/// define_stores!(secret_store => Store<Secret>);
/// ```
macro_rules! define_stores {
    ($($variant:ident => $store:ident<$type:ty>),*) => {
        #[derive(Clone, Default)]
        pub struct Stores {
            $(pub $variant: Option<$store<$type>>),*
        }

        impl Stores {
            pub fn new($($variant: Option<$store<$type>>),*) -> Self {
                Stores { $($variant),* }
            }

            $(
                pub fn $variant(&self) -> &$store<$type> {
                    self.$variant
                        .as_ref()
                        .unwrap_or_else(|| panic!("{} store is not initialized", stringify!($variant)))
                }
            )*
        }
    }
}

define_stores!(secret_store => Store<Secret>);

/// State shared between the controllers and the web server.
#[derive(Clone)]
pub struct State {
    metrics: Arc<Metrics>,
}

/// Shared state for a resource stream, produced by [`create_subscriber`].
pub struct ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
    pub subscriber: ReflectHandle<K>,
}

impl State {
    pub fn new(registry: Registry, controller_names: &[ControllerId]) -> Self {
        Self {
            metrics: Arc::new(Metrics::new(registry, controller_names)),
        }
    }

    /// Render the process metrics as OpenMetrics text.
    pub fn metrics(&self) -> Result<String> {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry)
            .map_err(|e| Error::FormattingError(format!("failed to encode metrics: {e}"), std::fmt::Error))?;
        Ok(buffer)
    }

    /// Create a reconciler [`Context`] for `controller_id`, sharing this state's metrics.
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId, stores: Stores) -> Arc<Context<K>>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Arc::new(Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all controller ids must be registered with State::new")
                .clone(),
            proxmox_k8s_util::events::Recorder::new(client, controller_id),
            stores,
        ))
    }
}

/// Fetch a page of `K` to confirm the operator's RBAC actually permits listing it, failing
/// fast at startup rather than surfacing as a confusing per-reconcile watch error.
pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>(),
        );
        std::process::exit(1);
    }
    api
}

/// Build a shared, subscribable reflector store for `K`.
pub fn create_subscriber<K>(buffer_size: usize) -> ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store_shared(buffer_size);
    let subscriber = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    ResourceReflector {
        store,
        writer,
        subscriber,
    }
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("handled inside the backoff_reconciler macro")
}

/// Wraps a reconciler function so that:
/// - `Ok` resets the per-object exponential backoff.
/// - `Err(Error::RequeueAfter(d))` requeues after `d` without touching the backoff
///   policy or the `reconcile_failures` metric: it isn't a failure.
/// - any other `Err` advances the backoff, records the failure, and requeues.
#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err($crate::error::Error::RequeueAfter(duration)) => {
                    Ok(kube::runtime::controller::Action::requeue(duration))
                }
                Err(error) => {
                    let namespace = kube::ResourceExt::namespace(obj.as_ref()).unwrap_or_default();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}

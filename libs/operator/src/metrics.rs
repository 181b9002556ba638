use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl Metrics {
    pub fn new(mut registry: Registry, controller_names: &[ControllerId]) -> Self {
        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, &mut registry))))
            .collect::<HashMap<ControllerId, Arc<ControllerMetrics>>>();

        Self {
            registry: Arc::new(registry),
            controllers,
        }
    }
}

#[derive(Clone, Debug, Hash, Eq, PartialEq, EncodeLabelSet)]
struct ControllerLabels {
    controller: String,
}

#[derive(Clone)]
pub struct ControllerMetrics {
    controller: String,
    pub reconcile: ReconcileMetrics,
    status_update_errors: Family<ControllerLabels, Counter>,
    triggered: Family<ControllerLabels, Counter>,
    watch_operations_failed: Family<ControllerLabels, Counter>,
    ready: Family<ControllerLabels, Gauge>,
}

impl ControllerMetrics {
    pub fn new(controller: &str, registry: &mut Registry) -> Self {
        let reconcile = ReconcileMetrics::new(controller, registry);

        let status_update_errors = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "status_update_errors",
            "Number of errors that occurred during update operations to status subresources",
            status_update_errors.clone(),
        );

        let triggered = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "triggered",
            "Number of times a Kubernetes object applied or delete event triggered a reconcile",
            triggered.clone(),
        );

        let watch_operations_failed = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "watch_operations_failed",
            "Total number of watch operations that failed",
            watch_operations_failed.clone(),
        );

        let ready = Family::<ControllerLabels, Gauge>::default();
        registry.register(
            "ready",
            "1 when the controller is ready to reconcile resources, 0 otherwise",
            ready.clone(),
        );

        Self {
            controller: controller.to_string(),
            reconcile,
            status_update_errors,
            triggered,
            watch_operations_failed,
            ready,
        }
    }

    fn labels(&self) -> ControllerLabels {
        ControllerLabels {
            controller: self.controller.clone(),
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.reconcile.failures.get_or_create(&self.labels()).inc();
    }

    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.reconcile.operations.get_or_create(&self.labels()).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: self.labels(),
            metric: self.reconcile.duration.clone(),
        }
    }

    pub fn reconcile_deploy_delete_create_inc(&self) {
        self.reconcile
            .deploy_delete_create
            .get_or_create(&self.labels())
            .inc();
    }

    pub fn status_update_errors_inc(&self) {
        self.status_update_errors.get_or_create(&self.labels()).inc();
    }

    pub fn triggered_inc(&self, action: ReconcileAction, triggered_by: &str) {
        let _ = action;
        let _ = triggered_by;
        self.triggered.get_or_create(&self.labels()).inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch_operations_failed
            .get_or_create(&self.labels())
            .inc();
    }

    pub fn ready_set(&self, status: i64) {
        self.ready.get_or_create(&self.labels()).set(status);
    }
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub operations: Family<ControllerLabels, Counter>,
    pub failures: Family<ControllerLabels, Counter>,
    pub duration: Family<ControllerLabels, Histogram>,
    pub deploy_delete_create: Family<ControllerLabels, Counter>,
}

impl ReconcileMetrics {
    pub fn new(controller: &str, registry: &mut Registry) -> Self {
        let _ = controller;
        let operations = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_operations",
            "Total number of reconcile operations",
            operations.clone(),
        );

        let failures = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_failures",
            "Number of errors that occurred during reconcile operations",
            failures.clone(),
        );

        let duration = Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(prometheus_client::metrics::histogram::exponential_buckets(
                0.01, 2.0, 12,
            ))
        });
        registry.register(
            "reconcile_duration_seconds",
            "Histogram of reconcile operation durations",
            duration.clone(),
        );

        let deploy_delete_create = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_deploy_delete_create",
            "Number of times reconciling a managed object required deleting and re-creating it",
            deploy_delete_create.clone(),
        );

        Self {
            operations,
            failures,
            duration,
            deploy_delete_create,
        }
    }
}

/// Records a reconcile's wall-clock duration into the histogram when dropped.
pub struct ReconcileMeasurer {
    start: Instant,
    labels: ControllerLabels,
    metric: Family<ControllerLabels, Histogram>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.get_or_create(&self.labels).observe(duration);
    }
}

#[derive(Clone, Copy, Debug)]
pub enum ReconcileAction {
    Apply,
    Delete,
}

impl ReconcileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileAction::Apply => "apply",
            ReconcileAction::Delete => "delete",
        }
    }
}

//! Publishes events for objects for kubernetes >= 1.19
use std::hash::{Hash, Hasher};
use std::{collections::HashMap, sync::Arc};

use chrono::{Duration, Utc};
use k8s_openapi::{
    api::{core::v1::ObjectReference, events::v1::Event as K8sEvent, events::v1::EventSeries},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use kube::ResourceExt;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client,
};
use tokio::sync::RwLock;

const EVENT_FINISH_TIME: Duration = Duration::minutes(6);

/// Minimal event type for publishing through [`Recorder::publish`].
///
/// All string fields must be human readable.
pub struct Event {
    /// Shows up in `kubectl describe` as `Type`.
    pub type_: EventType,
    /// Shows up in `kubectl describe` as `Reason`. At most 128 characters, `PascalCase`.
    pub reason: String,
    /// Shows up in `kubectl describe` as `Message`. At most 1kB.
    pub note: Option<String>,
    /// Short identifier of the action that caused the outcome, `PascalCase`.
    pub action: String,
    /// Secondary object affected by this event, if any.
    pub secondary: Option<ObjectReference>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Clone, Debug, PartialEq)]
struct Reference(ObjectReference);

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.api_version.hash(state);
        self.0.kind.hash(state);
        self.0.name.hash(state);
        self.0.namespace.hash(state);
        self.0.uid.hash(state);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct EventKey {
    event_type: EventType,
    action: String,
    reason: String,
    reporting_controller: String,
    reporting_instance: Option<String>,
    regarding: Reference,
    related: Option<Reference>,
}

/// Identifies the controller publishing events, for `kubectl describe`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reporter {
    pub controller: String,
    pub instance: Option<String>,
}

impl From<String> for Reporter {
    fn from(controller: String) -> Self {
        Self {
            controller,
            instance: None,
        }
    }
}

impl From<&str> for Reporter {
    fn from(controller: &str) -> Self {
        let instance = hostname::get().ok().and_then(|h| h.into_string().ok());
        Self {
            controller: controller.into(),
            instance,
        }
    }
}

/// A publisher abstraction to emit Kubernetes events, coalescing repeats into
/// an `EventSeries` the way the Kubernetes event API expects.
///
/// RBAC: requires `create`/`patch` on `events.k8s.io/events`.
#[derive(Clone)]
pub struct Recorder {
    client: Client,
    reporter: Reporter,
    events_cache: Arc<RwLock<HashMap<EventKey, K8sEvent>>>,
}

impl Recorder {
    #[must_use]
    pub fn new(client: Client, reporter: impl Into<Reporter>) -> Self {
        Self {
            client,
            reporter: reporter.into(),
            events_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    fn get_event_key(&self, ev: &Event, regarding: &ObjectReference) -> EventKey {
        EventKey {
            event_type: ev.type_,
            action: ev.action.clone(),
            reason: ev.reason.clone(),
            reporting_controller: self.reporter.controller.clone(),
            reporting_instance: self.reporter.instance.clone(),
            regarding: Reference(regarding.clone()),
            related: ev.secondary.clone().map(Reference),
        }
    }

    fn generate_event(&self, ev: &Event, reference: &ObjectReference) -> K8sEvent {
        let now = Utc::now();
        K8sEvent {
            action: Some(ev.action.clone()),
            reason: Some(ev.reason.clone()),
            deprecated_count: None,
            deprecated_first_timestamp: None,
            deprecated_last_timestamp: None,
            deprecated_source: None,
            event_time: Some(MicroTime(now)),
            regarding: Some(reference.clone()),
            note: ev.note.clone(),
            metadata: ObjectMeta {
                namespace: reference.namespace.clone(),
                name: Some(format!(
                    "{}.{}",
                    reference.name.as_ref().unwrap_or(&self.reporter.controller),
                    now.timestamp()
                )),
                ..Default::default()
            },
            reporting_controller: Some(self.reporter.controller.clone()),
            reporting_instance: Some(
                self.reporter
                    .instance
                    .clone()
                    .unwrap_or_else(|| self.reporter.controller.clone()),
            ),
            series: None,
            type_: match ev.type_ {
                EventType::Normal => Some("Normal".into()),
                EventType::Warning => Some("Warning".into()),
            },
            related: ev.secondary.clone(),
        }
    }

    /// Publish a Kubernetes event, attached to `reference`, in `reference`'s namespace
    /// (or "default" if cluster-scoped).
    pub async fn publish(&self, ev: Event, reference: &ObjectReference) -> Result<(), kube::Error> {
        let now = Utc::now();

        let key = self.get_event_key(&ev, reference);
        let event = match self.events_cache.read().await.get(&key) {
            Some(e) => {
                let series = match &e.series {
                    Some(series) => EventSeries {
                        count: series.count + 1,
                        last_observed_time: MicroTime(now),
                    },
                    None => EventSeries {
                        count: 2,
                        last_observed_time: MicroTime(now),
                    },
                };
                let mut event = e.clone();
                event.series = Some(series);
                event
            }
            None => self.generate_event(&ev, reference),
        };

        let events: Api<K8sEvent> = Api::namespaced(
            self.client.clone(),
            reference.namespace.as_deref().unwrap_or("default"),
        );
        if event.series.is_some() {
            events
                .patch(&event.name_any(), &PatchParams::default(), &Patch::Merge(&event))
                .await?;
        } else {
            events.create(&PostParams::default(), &event).await?;
        }

        let mut cache = self.events_cache.write().await;
        cache.insert(key, event);
        cache.retain(|_, v| match (&v.series, &v.event_time) {
            (Some(series), _) => series.last_observed_time.0 >= now - EVENT_FINISH_TIME,
            (None, Some(event_time)) => event_time.0 >= now - EVENT_FINISH_TIME,
            (None, None) => true,
        });
        Ok(())
    }
}

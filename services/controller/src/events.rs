//! Writes user-visible events next to the objects they describe.

use std::sync::Arc;

use fleetplane_api::Resource;
use fleetplane_events::{Event, EventType, ObjectReference};
use fleetplane_reconcile::Clock;
use tracing::{debug, warn};

use crate::store::Store;

/// Emits events for one component. Repeats of the same reason and message
/// fold into one record with a count.
///
/// Recording never fails the caller; a lost event is logged and dropped.
#[derive(Clone)]
pub struct EventRecorder {
    events: Store<Event>,
    clock: Arc<dyn Clock>,
    component: &'static str,
}

impl EventRecorder {
    pub fn new(events: Store<Event>, clock: Arc<dyn Clock>) -> Self {
        Self {
            events,
            clock,
            component: "fleetplane",
        }
    }

    /// Same sink, different source name.
    pub fn for_component(&self, component: &'static str) -> Self {
        Self {
            component,
            ..self.clone()
        }
    }

    pub fn normal<R: Resource>(&self, obj: &R, reason: &str, message: impl Into<String>) {
        self.record(obj, EventType::Normal, reason, message.into());
    }

    pub fn warning<R: Resource>(&self, obj: &R, reason: &str, message: impl Into<String>) {
        self.record(obj, EventType::Warning, reason, message.into());
    }

    fn record<R: Resource>(&self, obj: &R, event_type: EventType, reason: &str, message: String) {
        let now = self.clock.now();
        let event = match Event::new(
            ObjectReference::of(obj),
            event_type,
            reason,
            message,
            self.component,
            now,
        ) {
            Ok(event) => event,
            Err(e) => {
                warn!(object = %obj.key(), reason, error = %e, "Dropping malformed event");
                return;
            }
        };

        let key = event.metadata.key();
        let bumped = self.events.mutate::<crate::store::StoreError, _>(&key, |existing| {
            existing.bump(now);
            Ok(true)
        });
        let result = match bumped {
            Ok(Some(_)) => Ok(()),
            Ok(None) => self.events.create(event).map(|_| ()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(object = %obj.key(), kind = R::KIND, reason, "Event recorded"),
            Err(e) if matches!(e, crate::store::StoreError::AlreadyExists { .. }) => {
                // Lost a race with a concurrent first write; fold into it.
                let _ = self.events.mutate::<crate::store::StoreError, _>(&key, |existing| {
                    existing.bump(now);
                    Ok(true)
                });
            }
            Err(e) => warn!(object = %obj.key(), reason, error = %e, "Failed to record event"),
        }
    }

    /// Events recorded against `obj`, oldest first.
    pub fn events_for<R: Resource>(&self, obj: &R) -> Vec<Event> {
        let target = ObjectReference::of(obj);
        let mut events: Vec<Event> = self
            .events
            .list_namespace(&target.namespace)
            .into_iter()
            .filter(|e| e.involved_object.kind == target.kind && e.involved_object.name == target.name)
            .collect();
        events.sort_by_key(|e| e.first_timestamp);
        events
    }
}

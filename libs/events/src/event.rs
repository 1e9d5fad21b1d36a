//! The `Event` kind and its well-known reasons.

use chrono::{DateTime, Utc};
use fleetplane_api::{ObjectMeta, Resource};
use fleetplane_id::EventId;
use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Reasons
// =============================================================================

/// Reasons emitted by the controllers.
pub mod reasons {
    // Game server lifecycle
    pub const CREATING: &str = "Creating";
    pub const SCHEDULED: &str = "Scheduled";
    pub const REQUEST_READY: &str = "RequestReady";
    pub const READY: &str = "Ready";
    pub const RESERVED: &str = "Reserved";
    pub const ALLOCATED: &str = "Allocated";
    pub const UNHEALTHY: &str = "Unhealthy";
    pub const SHUTDOWN: &str = "Shutdown";
    pub const ERROR: &str = "Error";
    pub const ALLOCATION_LOST: &str = "AllocationLost";
    pub const PORT_COLLISION: &str = "PortCollision";

    // Sets and fleets
    pub const SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
    pub const SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
    pub const CREATING_GAME_SERVER_SET: &str = "CreatingGameServerSet";
    pub const SCALING_GAME_SERVER_SET: &str = "ScalingGameServerSet";
    pub const DELETING_GAME_SERVER_SET: &str = "DeletingGameServerSet";

    // Autoscaling
    pub const AUTO_SCALING_FLEET: &str = "AutoScalingFleet";
    pub const FLEET_AUTOSCALER: &str = "FleetAutoscaler";
}

// =============================================================================
// Event record
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    #[default]
    Normal,
    Warning,
}

/// Pointer to the object an event describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
}

impl ObjectReference {
    pub fn of<R: Resource>(obj: &R) -> Self {
        let meta = obj.meta();
        Self {
            kind: R::KIND.to_string(),
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
            uid: meta.uid.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub metadata: ObjectMeta,
    pub involved_object: ObjectReference,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
    /// Number of times this reason and message were observed.
    pub count: u32,
    pub first_timestamp: DateTime<Utc>,
    pub last_timestamp: DateTime<Utc>,
    /// Component that emitted the event.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
}

impl Resource for Event {
    const KIND: &'static str = "Event";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }

    fn new_uid() -> String {
        EventId::new().to_string()
    }
}

impl Event {
    /// Builds a fresh record with count 1.
    ///
    /// The object name is derived from the involved object plus a hash of
    /// reason and message, so identical repeats land on the same record.
    pub fn new(
        involved: ObjectReference,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, EventError> {
        if !is_valid_reason(reason) {
            return Err(EventError::InvalidReason(reason.to_string()));
        }
        if involved.name.is_empty() {
            return Err(EventError::MissingObject {
                kind: involved.kind,
            });
        }
        let message = message.into();
        let name = aggregate_name(&involved, reason, &message);
        Ok(Self {
            metadata: ObjectMeta::named(involved.namespace.clone(), name),
            involved_object: involved,
            event_type,
            reason: reason.to_string(),
            message,
            count: 1,
            first_timestamp: now,
            last_timestamp: now,
            source: source.to_string(),
        })
    }

    /// Folds a repeat observation into this record.
    pub fn bump(&mut self, now: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.last_timestamp = now;
    }
}

fn is_valid_reason(reason: &str) -> bool {
    reason.chars().next().is_some_and(|c| c.is_ascii_uppercase())
        && reason.chars().all(|c| c.is_ascii_alphanumeric())
}

/// FNV-1a over the fields that identify a repeat.
fn aggregate_name(involved: &ObjectReference, reason: &str, message: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for part in [involved.kind.as_str(), involved.uid.as_str(), reason, message] {
        for byte in part.bytes().chain(std::iter::once(0)) {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    format!("{}.{:016x}", involved.name, hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn target() -> ObjectReference {
        ObjectReference {
            kind: "GameServer".into(),
            namespace: "default".into(),
            name: "gs-1".into(),
            uid: "gs_01HV".into(),
        }
    }

    #[test]
    fn test_same_reason_same_name() {
        let now = Utc::now();
        let a = Event::new(target(), EventType::Normal, reasons::READY, "up", "gs", now).unwrap();
        let b = Event::new(target(), EventType::Normal, reasons::READY, "up", "gs", now).unwrap();
        let c = Event::new(target(), EventType::Normal, reasons::READY, "other", "gs", now).unwrap();
        assert_eq!(a.metadata.name, b.metadata.name);
        assert_ne!(a.metadata.name, c.metadata.name);
        assert!(a.metadata.name.starts_with("gs-1."));
    }

    #[test]
    fn test_bump_counts() {
        let now = Utc::now();
        let mut e =
            Event::new(target(), EventType::Warning, reasons::UNHEALTHY, "x", "gs", now).unwrap();
        let later = now + chrono::Duration::seconds(3);
        e.bump(later);
        assert_eq!(e.count, 2);
        assert_eq!(e.first_timestamp, now);
        assert_eq!(e.last_timestamp, later);
    }

    #[test]
    fn test_rejects_bad_reason() {
        let now = Utc::now();
        let err = Event::new(target(), EventType::Normal, "not ok", "", "gs", now).unwrap_err();
        assert_eq!(err, EventError::InvalidReason("not ok".into()));

        let mut anon = target();
        anon.name.clear();
        assert!(matches!(
            Event::new(anon, EventType::Normal, reasons::READY, "", "gs", now),
            Err(EventError::MissingObject { .. })
        ));
    }

    #[test]
    fn test_serializes_type_field() {
        let e = Event::new(target(), EventType::Warning, reasons::ERROR, "boom", "gs", Utc::now())
            .unwrap();
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "Warning");
        assert_eq!(json["involved_object"]["kind"], "GameServer");
    }

    proptest! {
        #[test]
        fn prop_names_are_stable(reason in "[A-Z][a-zA-Z]{0,12}", msg in ".{0,40}") {
            let a = aggregate_name(&target(), &reason, &msg);
            let b = aggregate_name(&target(), &reason, &msg);
            prop_assert_eq!(a, b);
        }
    }
}

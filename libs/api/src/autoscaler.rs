//! The fleet autoscaler kind.

use chrono::{DateTime, Utc};
use fleetplane_id::FleetAutoscalerId;
use serde::{Deserialize, Serialize};

use crate::common::IntOrPercent;
use crate::gameserverset::ReplicaStatus;
use crate::meta::{impl_resource, ObjectMeta};

/// Keep a buffer of ready servers above the allocated ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferPolicy {
    /// Absolute count, or a ratio of allocated servers when a percentage.
    pub buffer_size: IntOrPercent,
    #[serde(default)]
    pub min_replicas: u32,
    pub max_replicas: u32,
}

/// Ask an external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookPolicy {
    pub url: String,

    /// PEM bundle trusted for the endpoint's certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<u32>,
}

/// Keep a buffer of free capacity in a counter or list, aggregated over
/// the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPolicy {
    pub key: String,
    pub buffer_size: IntOrPercent,
    #[serde(default)]
    pub min_capacity: i64,
    pub max_capacity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub id: String,
    pub policy: AutoscalerPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AutoscalerPolicy {
    Buffer(BufferPolicy),
    Webhook(WebhookPolicy),
    Counter(CapacityPolicy),
    List(CapacityPolicy),
    Chain { entries: Vec<ChainEntry> },
}

impl AutoscalerPolicy {
    pub fn kind(&self) -> &'static str {
        match self {
            AutoscalerPolicy::Buffer(_) => "Buffer",
            AutoscalerPolicy::Webhook(_) => "Webhook",
            AutoscalerPolicy::Counter(_) => "Counter",
            AutoscalerPolicy::List(_) => "List",
            AutoscalerPolicy::Chain { .. } => "Chain",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            AutoscalerPolicy::Buffer(b) => {
                if b.max_replicas < b.min_replicas {
                    return Err("max_replicas below min_replicas".into());
                }
                match b.buffer_size {
                    IntOrPercent::Int(0) => Err("buffer_size must be positive".into()),
                    IntOrPercent::Percent(p) if p == 0 || p >= 100 => {
                        Err("buffer_size percentage must be within 1-99%".into())
                    }
                    IntOrPercent::Int(n) if n > b.max_replicas => {
                        Err("buffer_size exceeds max_replicas".into())
                    }
                    _ => Ok(()),
                }
            }
            AutoscalerPolicy::Webhook(w) => {
                if w.url.is_empty() {
                    return Err("webhook url is required".into());
                }
                match (w.min_replicas, w.max_replicas) {
                    (Some(min), Some(max)) if max < min => {
                        Err("max_replicas below min_replicas".into())
                    }
                    _ => Ok(()),
                }
            }
            AutoscalerPolicy::Counter(c) | AutoscalerPolicy::List(c) => {
                if c.key.is_empty() {
                    return Err("key is required".into());
                }
                if c.min_capacity < 0 || c.max_capacity < c.min_capacity {
                    return Err("capacity bounds are inverted".into());
                }
                match c.buffer_size {
                    IntOrPercent::Int(0) | IntOrPercent::Percent(0) => {
                        Err("buffer_size must be positive".into())
                    }
                    _ => Ok(()),
                }
            }
            AutoscalerPolicy::Chain { entries } => {
                if entries.is_empty() {
                    return Err("chain needs at least one entry".into());
                }
                let mut ids = std::collections::BTreeSet::new();
                for entry in entries {
                    if !ids.insert(entry.id.as_str()) {
                        return Err(format!("duplicate chain entry '{}'", entry.id));
                    }
                    if matches!(entry.policy, AutoscalerPolicy::Chain { .. }) {
                        return Err("chains cannot nest".into());
                    }
                    entry.policy.validate()?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub period_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetAutoscalerSpec {
    pub fleet_name: String,
    pub policy: AutoscalerPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetAutoscalerStatus {
    #[serde(default)]
    pub current_replicas: u32,
    #[serde(default)]
    pub desired_replicas: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub able_to_scale: bool,
    /// The policy wanted more or fewer replicas than its bounds allow.
    #[serde(default)]
    pub scaling_limited: bool,
    /// Chain entry id or policy kind that produced the last decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetAutoscaler {
    pub metadata: ObjectMeta,
    pub spec: FleetAutoscalerSpec,
    #[serde(default)]
    pub status: FleetAutoscalerStatus,
}

impl_resource!(FleetAutoscaler, "FleetAutoscaler", FleetAutoscalerId, spec);

/// Body posted to a webhook policy's endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetAutoscaleReview {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<FleetAutoscaleRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<FleetAutoscaleResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetAutoscaleRequest {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub status: ReplicaStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetAutoscaleResponse {
    pub uid: String,
    pub scale: bool,
    #[serde(default)]
    pub replicas: u32,
}

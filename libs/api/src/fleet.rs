//! The fleet kind.

use fleetplane_id::FleetId;
use serde::{Deserialize, Serialize};

use crate::common::{IntOrPercent, SchedulingStrategy};
use crate::gameserver::GameServerTemplate;
use crate::gameserverset::ReplicaStatus;
use crate::meta::{impl_resource, ObjectMeta};

/// How a fleet replaces sets when its template changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyType {
    /// Drain old sets completely before scaling the new one.
    Recreate,
    /// Replace gradually within surge and unavailability budgets.
    #[default]
    RollingUpdate,
}

/// Rolling budgets; unset values fall back to controller defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingUpdateParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrPercent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrPercent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetStrategy {
    #[serde(rename = "type", default)]
    pub kind: StrategyType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdateParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub replicas: u32,

    #[serde(default)]
    pub strategy: FleetStrategy,

    #[serde(default)]
    pub scheduling: SchedulingStrategy,

    pub template: GameServerTemplate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub metadata: ObjectMeta,
    pub spec: FleetSpec,
    #[serde(default)]
    pub status: ReplicaStatus,
}

impl_resource!(Fleet, "Fleet", FleetId, spec);

impl Fleet {
    pub fn new(metadata: ObjectMeta, replicas: u32, template: GameServerTemplate) -> Self {
        Self {
            metadata,
            spec: FleetSpec {
                replicas,
                strategy: FleetStrategy::default(),
                scheduling: SchedulingStrategy::default(),
                template,
            },
            status: ReplicaStatus::default(),
        }
    }
}

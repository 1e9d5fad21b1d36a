//! The game server set kind.

use std::collections::BTreeMap;

use fleetplane_id::GameServerSetId;
use serde::{Deserialize, Serialize};

use crate::common::{AggregatedStatus, SchedulingStrategy};
use crate::gameserver::{aggregate_counters_and_lists, GameServer, GameServerState, GameServerTemplate};
use crate::meta::{impl_resource, ObjectMeta};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerSetSpec {
    pub replicas: u32,

    #[serde(default)]
    pub scheduling: SchedulingStrategy,

    pub template: GameServerTemplate,
}

/// Population counts and rollups. Shared by sets and fleets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    /// Game servers that are up (not shutting down or unhealthy).
    #[serde(default)]
    pub replicas: u32,
    #[serde(default)]
    pub ready_replicas: u32,
    #[serde(default)]
    pub reserved_replicas: u32,
    #[serde(default)]
    pub allocated_replicas: u32,
    #[serde(default)]
    pub shutdown_replicas: u32,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, AggregatedStatus>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, AggregatedStatus>,
}

impl ReplicaStatus {
    /// Count a population of game servers.
    pub fn from_game_servers<'a, I>(game_servers: I) -> Self
    where
        I: IntoIterator<Item = &'a GameServer> + Clone,
    {
        let mut status = ReplicaStatus::default();
        for gs in game_servers.clone() {
            let state = gs.state();
            if state.is_up() {
                status.replicas += 1;
            }
            match state {
                GameServerState::Ready => status.ready_replicas += 1,
                GameServerState::Reserved => status.reserved_replicas += 1,
                GameServerState::Allocated => status.allocated_replicas += 1,
                GameServerState::Shutdown => status.shutdown_replicas += 1,
                _ => {}
            }
        }
        let (counters, lists) = aggregate_counters_and_lists(game_servers);
        status.counters = counters;
        status.lists = lists;
        status
    }

    /// Ready, reserved and allocated.
    pub fn available(&self) -> u32 {
        self.ready_replicas + self.reserved_replicas + self.allocated_replicas
    }

    /// Sum of another status into this one.
    pub fn absorb(&mut self, other: &ReplicaStatus) {
        self.replicas += other.replicas;
        self.ready_replicas += other.ready_replicas;
        self.reserved_replicas += other.reserved_replicas;
        self.allocated_replicas += other.allocated_replicas;
        self.shutdown_replicas += other.shutdown_replicas;
        crate::common::merge_aggregates(&mut self.counters, &other.counters);
        crate::common::merge_aggregates(&mut self.lists, &other.lists);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServerSet {
    pub metadata: ObjectMeta,
    pub spec: GameServerSetSpec,
    #[serde(default)]
    pub status: ReplicaStatus,
}

impl_resource!(GameServerSet, "GameServerSet", GameServerSetId, spec);

impl GameServerSet {
    /// Revision label value, if stamped.
    pub fn revision(&self) -> Option<&str> {
        self.metadata.label(crate::labels::REVISION)
    }
}

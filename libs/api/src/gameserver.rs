//! The game server (instance) kind.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use fleetplane_id::GameServerId;
use serde::{Deserialize, Serialize};

use crate::common::{AggregatedStatus, CounterStatus, ListStatus, SchedulingStrategy};
use crate::meta::{impl_resource, ObjectMeta};

// =============================================================================
// State
// =============================================================================

/// Lifecycle state of a game server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameServerState {
    /// Dynamic host ports are being reserved.
    #[default]
    PortAllocation,
    /// The backing pod is being created.
    Creating,
    /// Pod exists but has no node yet.
    Starting,
    /// Pod has a node; address known.
    Scheduled,
    /// The agent said ready; the controller has not confirmed yet.
    RequestReady,
    Ready,
    Reserved,
    Allocated,
    Shutdown,
    /// Pod creation failed; retried with backoff.
    Error,
    Unhealthy,
    /// Pod is gone; the object is about to be removed.
    Terminal,
}

impl GameServerState {
    /// Counted toward a set's population.
    pub fn is_up(self) -> bool {
        !matches!(
            self,
            GameServerState::Shutdown | GameServerState::Terminal | GameServerState::Unhealthy
        )
    }

    /// Has not reached `Ready` yet.
    pub fn is_before_ready(self) -> bool {
        matches!(
            self,
            GameServerState::PortAllocation
                | GameServerState::Creating
                | GameServerState::Starting
                | GameServerState::Scheduled
                | GameServerState::RequestReady
                | GameServerState::Error
        )
    }

    /// Able to serve players.
    pub fn is_available(self) -> bool {
        matches!(
            self,
            GameServerState::Ready | GameServerState::Reserved | GameServerState::Allocated
        )
    }

    /// Past the point of no return.
    pub fn is_terminating(self) -> bool {
        matches!(self, GameServerState::Shutdown | GameServerState::Terminal)
    }

    /// The set controller must never delete a server in this state.
    pub fn is_protected(self) -> bool {
        matches!(self, GameServerState::Allocated | GameServerState::Reserved)
    }
}

impl std::fmt::Display for GameServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

// =============================================================================
// Spec
// =============================================================================

/// How a port's host side is chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortPolicy {
    /// Host port from the allocator.
    #[default]
    Dynamic,
    /// Host port supplied in the template.
    Static,
    /// Host port from the allocator, container port set to the same value.
    Passthrough,
}

impl PortPolicy {
    pub fn uses_allocator(self) -> bool {
        !matches!(self, PortPolicy::Static)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    #[serde(rename = "UDP")]
    Udp,
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "TCPUDP")]
    TcpUdp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameServerPort {
    pub name: String,

    #[serde(default)]
    pub port_policy: PortPolicy,

    /// Port inside the container; ignored for `Passthrough`.
    #[serde(default)]
    pub container_port: u16,

    /// Required for `Static`; assigned otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u16>,

    #[serde(default)]
    pub protocol: Protocol,
}

/// What to do once health checks fail.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnhealthyAction {
    /// Delete the pod and let the set replace the server.
    #[default]
    Shutdown,
    /// Keep the pod around for inspection.
    Retain,
}

/// Health-check policy for the agent's heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Health {
    #[serde(default)]
    pub disabled: bool,

    /// Seconds after scheduling before the first ping is expected.
    #[serde(default = "Health::default_initial_delay")]
    pub initial_delay_seconds: u32,

    /// Expected ping cadence.
    #[serde(default = "Health::default_period")]
    pub period_seconds: u32,

    /// Consecutive missed pings tolerated.
    #[serde(default = "Health::default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default)]
    pub on_failure: UnhealthyAction,
}

impl Health {
    fn default_initial_delay() -> u32 {
        5
    }

    fn default_period() -> u32 {
        5
    }

    fn default_failure_threshold() -> u32 {
        3
    }
}

impl Default for Health {
    fn default() -> Self {
        Self {
            disabled: false,
            initial_delay_seconds: Self::default_initial_delay(),
            period_seconds: Self::default_period(),
            failure_threshold: Self::default_failure_threshold(),
            on_failure: UnhealthyAction::Shutdown,
        }
    }
}

/// The game container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(default = "ContainerSpec::default_name")]
    pub name: String,

    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ContainerSpec {
    fn default_name() -> String {
        "gameserver".to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerSpec {
    pub container: ContainerSpec,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<GameServerPort>,

    #[serde(default)]
    pub health: Health,

    #[serde(default)]
    pub scheduling: SchedulingStrategy,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Initial counters; copied into status on creation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,

    /// Initial lists; copied into status on creation.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,
}

impl GameServerSpec {
    /// Ports that need a host port from the allocator.
    pub fn dynamic_port_count(&self) -> usize {
        self.ports
            .iter()
            .filter(|p| p.port_policy.uses_allocator())
            .count()
    }

    /// Structural checks; a failure is terminal for the object.
    pub fn validate(&self) -> Result<(), String> {
        if self.container.image.trim().is_empty() {
            return Err("container image is required".into());
        }

        let mut names = std::collections::BTreeSet::new();
        for port in &self.ports {
            if !names.insert(port.name.as_str()) {
                return Err(format!("duplicate port name '{}'", port.name));
            }
            match port.port_policy {
                PortPolicy::Static if port.host_port.is_none() => {
                    return Err(format!("static port '{}' needs a host port", port.name));
                }
                PortPolicy::Dynamic | PortPolicy::Static if port.container_port == 0 => {
                    return Err(format!("port '{}' needs a container port", port.name));
                }
                _ => {}
            }
        }

        if !self.health.disabled
            && (self.health.period_seconds == 0 || self.health.failure_threshold == 0)
        {
            return Err("health period and failure threshold must be positive".into());
        }

        for (name, counter) in &self.counters {
            if counter.capacity < 0 || counter.count < 0 || counter.count > counter.capacity {
                return Err(format!("counter '{name}' has count outside [0, capacity]"));
            }
        }
        for (name, list) in &self.lists {
            if list.capacity < 0 || list.capacity > crate::common::MAX_LIST_CAPACITY {
                return Err(format!("list '{name}' has invalid capacity {}", list.capacity));
            }
            if list.values.len() as i64 > list.capacity {
                return Err(format!("list '{name}' holds more values than its capacity"));
            }
        }
        Ok(())
    }
}

/// Labels, annotations and spec stamped onto every game server of a set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    pub spec: GameServerSpec,
}

// =============================================================================
// Status
// =============================================================================

/// Host port assigned to a named port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPort {
    pub name: String,
    pub port: u16,
}

/// Machine-readable reason plus message for the last notable failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCondition {
    pub reason: String,
    pub message: String,
    pub last_transition: DateTime<Utc>,
}

/// Heartbeat bookkeeping. Deadlines are derived from these timestamps so a
/// new leader reaches the same verdict as the old one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// When the pod was first observed on a node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_ping: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameServerStatus {
    #[serde(default)]
    pub state: GameServerState,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<StatusPort>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,

    /// `Reserved` ends at this instant; `None` holds until told otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_until: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, CounterStatus>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub lists: BTreeMap<String, ListStatus>,

    #[serde(default)]
    pub health: HealthStatus,

    /// Consecutive failed pod creations.
    #[serde(default)]
    pub pod_failures: u32,

    /// Next pod creation attempt while in `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<StatusCondition>,
}

// =============================================================================
// Object
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameServer {
    pub metadata: ObjectMeta,
    pub spec: GameServerSpec,
    #[serde(default)]
    pub status: GameServerStatus,
}

impl_resource!(GameServer, "GameServer", GameServerId, spec);

impl GameServer {
    /// Build a new, unstored game server from a template.
    pub fn from_template(metadata: ObjectMeta, template: &GameServerTemplate) -> Self {
        let mut metadata = metadata;
        for (k, v) in &template.labels {
            metadata.labels.entry(k.clone()).or_insert_with(|| v.clone());
        }
        for (k, v) in &template.annotations {
            metadata
                .annotations
                .entry(k.clone())
                .or_insert_with(|| v.clone());
        }
        let spec = template.spec.clone();
        let status = GameServerStatus {
            counters: spec.counters.clone(),
            lists: spec.lists.clone(),
            ..Default::default()
        };
        Self {
            metadata,
            spec,
            status,
        }
    }

    pub fn state(&self) -> GameServerState {
        self.status.state
    }

    /// Record a failure reason in status.
    pub fn set_condition(&mut self, reason: &str, message: impl Into<String>, now: DateTime<Utc>) {
        self.status.condition = Some(StatusCondition {
            reason: reason.to_string(),
            message: message.into(),
            last_transition: now,
        });
    }

    /// Instant after which missing heartbeats make this server unhealthy.
    ///
    /// `None` when health checking is disabled or the pod has not been
    /// scheduled yet.
    pub fn health_deadline(&self) -> Option<DateTime<Utc>> {
        let health = &self.spec.health;
        if health.disabled {
            return None;
        }
        let scheduled = self.status.health.scheduled_at?;
        let base = match self.status.health.last_ping {
            Some(ping) if ping > scheduled => ping,
            _ => scheduled + Duration::seconds(i64::from(health.initial_delay_seconds)),
        };
        let grace = i64::from(health.period_seconds) * i64::from(health.failure_threshold);
        Some(base + Duration::seconds(grace))
    }
}

/// Per-name counter and list rollups over a population of game servers.
pub fn aggregate_counters_and_lists<'a, I>(
    game_servers: I,
) -> (
    BTreeMap<String, AggregatedStatus>,
    BTreeMap<String, AggregatedStatus>,
)
where
    I: IntoIterator<Item = &'a GameServer>,
{
    let mut counters: BTreeMap<String, AggregatedStatus> = BTreeMap::new();
    let mut lists: BTreeMap<String, AggregatedStatus> = BTreeMap::new();

    for gs in game_servers {
        if !gs.state().is_up() {
            continue;
        }
        let allocated = gs.state() == GameServerState::Allocated;
        for (name, c) in &gs.status.counters {
            counters
                .entry(name.clone())
                .or_default()
                .add(c.count, c.capacity, allocated);
        }
        for (name, l) in &gs.status.lists {
            lists
                .entry(name.clone())
                .or_default()
                .add(l.values.len() as i64, l.capacity, allocated);
        }
    }
    (counters, lists)
}

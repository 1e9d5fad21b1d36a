//! Fixture builders for fleetplane tests.
//!
//! Everything here builds unstored objects; tests hand them to a store or
//! to pure planning functions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleetplane_api::{
    labels, AllocationPolicy, AllocationPolicySpec, ClusterConnectionInfo, ContainerSpec,
    CounterStatus, Fleet, FleetAutoscaler, FleetAutoscalerSpec, AutoscalerPolicy, BufferPolicy,
    GameServer, GameServerPort, GameServerSet, GameServerSetSpec, GameServerSpec,
    GameServerState, GameServerTemplate, Health, IntOrPercent, ListStatus, Node, ObjectMeta,
    OwnerReference, PortPolicy, Protocol, ReplicaStatus, Resource, SchedulingStrategy,
    StatusPort,
};

/// Namespace used by fixtures unless told otherwise.
pub const NAMESPACE: &str = "default";

/// A template with one dynamic UDP port and health checks disabled.
pub fn template(image: &str) -> GameServerTemplate {
    GameServerTemplate {
        labels: BTreeMap::new(),
        annotations: BTreeMap::new(),
        spec: GameServerSpec {
            container: ContainerSpec {
                name: "gameserver".into(),
                image: image.into(),
                ..Default::default()
            },
            ports: vec![GameServerPort {
                name: "default".into(),
                port_policy: PortPolicy::Dynamic,
                container_port: 7654,
                host_port: None,
                protocol: Protocol::Udp,
            }],
            health: Health {
                disabled: true,
                ..Default::default()
            },
            ..Default::default()
        },
    }
}

/// A fleet named `name` whose template carries the label `app=<name>`.
pub fn fleet(name: &str, replicas: u32) -> Fleet {
    let mut tpl = template("registry.local/game:1");
    tpl.labels.insert("app".into(), name.into());
    Fleet::new(ObjectMeta::named(NAMESPACE, name), replicas, tpl)
}

/// A set owned by `fleet`, labelled the way the fleet controller labels it.
pub fn set_for(fleet: &Fleet, name: &str, replicas: u32) -> GameServerSet {
    let mut metadata = ObjectMeta::named(&fleet.metadata.namespace, name)
        .with_label(labels::FLEET, &fleet.metadata.name);
    metadata.owner = Some(OwnerReference::of(fleet));
    GameServerSet {
        metadata,
        spec: GameServerSetSpec {
            replicas,
            scheduling: fleet.spec.scheduling,
            template: fleet.spec.template.clone(),
        },
        status: ReplicaStatus::default(),
    }
}

/// Builder for game servers in an arbitrary state.
#[derive(Debug, Clone)]
pub struct GameServerBuilder {
    gs: GameServer,
}

impl GameServerBuilder {
    pub fn new(name: &str) -> Self {
        let metadata = ObjectMeta::named(NAMESPACE, name);
        Self {
            gs: GameServer::from_template(metadata, &template("registry.local/game:1")),
        }
    }

    pub fn state(mut self, state: GameServerState) -> Self {
        self.gs.status.state = state;
        self
    }

    /// Ready on `node` with address `10.0.0.1` and one port.
    pub fn ready_on(mut self, node: &str) -> Self {
        self.gs.status.state = GameServerState::Ready;
        self.gs.status.node_name = node.into();
        self.gs.status.address = "10.0.0.1".into();
        self.gs.status.ports = vec![StatusPort {
            name: "default".into(),
            port: 7000,
        }];
        self
    }

    pub fn node(mut self, node: &str) -> Self {
        self.gs.status.node_name = node.into();
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.gs.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Owned by `set` and labelled with its name and fleet.
    pub fn owned_by(mut self, set: &GameServerSet) -> Self {
        self.gs.metadata.owner = Some(OwnerReference::of(set));
        self.gs
            .metadata
            .labels
            .insert(labels::GAME_SERVER_SET.into(), set.metadata.name.clone());
        if let Some(fleet) = set.metadata.label(labels::FLEET) {
            self.gs
                .metadata
                .labels
                .insert(labels::FLEET.into(), fleet.to_string());
        }
        self
    }

    pub fn counter(mut self, name: &str, count: i64, capacity: i64) -> Self {
        let counter = CounterStatus { count, capacity };
        self.gs.spec.counters.insert(name.into(), counter);
        self.gs.status.counters.insert(name.into(), counter);
        self
    }

    pub fn list(mut self, name: &str, capacity: i64, values: &[&str]) -> Self {
        let list = ListStatus {
            capacity,
            values: values.iter().map(|v| v.to_string()).collect(),
        };
        self.gs.spec.lists.insert(name.into(), list.clone());
        self.gs.status.lists.insert(name.into(), list);
        self
    }

    pub fn scheduling(mut self, scheduling: SchedulingStrategy) -> Self {
        self.gs.spec.scheduling = scheduling;
        self
    }

    pub fn health(mut self, health: Health) -> Self {
        self.gs.spec.health = health;
        self
    }

    pub fn reserved_until(mut self, until: DateTime<Utc>) -> Self {
        self.gs.status.state = GameServerState::Reserved;
        self.gs.status.reserved_until = Some(until);
        self
    }

    pub fn build(self) -> GameServer {
        self.gs
    }
}

/// A schedulable node with an external address.
pub fn node(name: &str, ip: &str) -> Node {
    Node::new(name, ip)
}

/// A buffer autoscaler targeting `fleet`.
pub fn buffer_autoscaler(fleet: &str, buffer: IntOrPercent, min: u32, max: u32) -> FleetAutoscaler {
    FleetAutoscaler {
        metadata: ObjectMeta::named(NAMESPACE, format!("{fleet}-autoscaler")),
        spec: FleetAutoscalerSpec {
            fleet_name: fleet.into(),
            policy: AutoscalerPolicy::Buffer(BufferPolicy {
                buffer_size: buffer,
                min_replicas: min,
                max_replicas: max,
            }),
            sync: None,
        },
        status: Default::default(),
    }
}

/// A policy entry pointing at `cluster`, reached through `endpoint`.
pub fn allocation_policy(
    name: &str,
    cluster: &str,
    priority: u32,
    weight: u32,
    endpoint: Option<&str>,
) -> AllocationPolicy {
    AllocationPolicy {
        metadata: ObjectMeta::named(NAMESPACE, name).with_label("cluster", cluster),
        spec: AllocationPolicySpec {
            priority,
            weight,
            connection_info: ClusterConnectionInfo {
                cluster_name: cluster.into(),
                allocation_endpoints: endpoint.map(|e| vec![e.to_string()]).unwrap_or_default(),
                secret_name: String::new(),
                namespace: NAMESPACE.into(),
                server_ca: None,
            },
        },
    }
}

/// Stamp a uid the way the store would, for pure tests that skip it.
pub fn with_uid<R: Resource>(mut obj: R) -> R {
    if obj.meta().uid.is_empty() {
        obj.meta_mut().uid = R::new_uid();
    }
    obj
}

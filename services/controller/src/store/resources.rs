//! The bundle of stores the controllers share.

use std::sync::Arc;

use fleetplane_api::{
    labels, AllocationPolicy, Fleet, FleetAutoscaler, GameServer, GameServerSet, Lease, Node,
    Pod, Resource, Secret,
};
use fleetplane_events::Event;
use fleetplane_reconcile::Clock;

use super::{IndexFn, Store, VersionCounter};

/// Index of every kind on its owner's uid.
pub const BY_OWNER: &str = "owner";

/// Index of game servers and sets on their fleet label (`namespace/fleet`).
pub const BY_FLEET: &str = "fleet";

/// Index of game servers and pods on the node they run on.
pub const BY_NODE: &str = "node";

fn by_owner<T: Resource>() -> (&'static str, IndexFn<T>) {
    (
        BY_OWNER,
        Arc::new(|obj: &T| obj.meta().owner.iter().map(|o| o.uid.clone()).collect()),
    )
}

fn by_fleet<T: Resource>() -> (&'static str, IndexFn<T>) {
    (
        BY_FLEET,
        Arc::new(|obj: &T| {
            let meta = obj.meta();
            meta.label(labels::FLEET)
                .map(|fleet| fleet_index_value(&meta.namespace, fleet))
                .into_iter()
                .collect()
        }),
    )
}

/// Value under which [`BY_FLEET`] files a fleet's members.
pub fn fleet_index_value(namespace: &str, fleet: &str) -> String {
    format!("{namespace}/{fleet}")
}

fn some_node(node: &str) -> Vec<String> {
    if node.is_empty() {
        Vec::new()
    } else {
        vec![node.to_string()]
    }
}

/// All collections, sharing one version counter and clock.
#[derive(Clone)]
pub struct ResourceStore {
    pub game_servers: Store<GameServer>,
    pub game_server_sets: Store<GameServerSet>,
    pub fleets: Store<Fleet>,
    pub autoscalers: Store<FleetAutoscaler>,
    pub allocation_policies: Store<AllocationPolicy>,
    pub pods: Store<Pod>,
    pub nodes: Store<Node>,
    pub secrets: Store<Secret>,
    pub leases: Store<Lease>,
    pub events: Store<Event>,
    versions: Arc<VersionCounter>,
}

impl ResourceStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let versions = Arc::new(VersionCounter::default());
        let v = || Arc::clone(&versions);
        let c = || Arc::clone(&clock);

        let gs_node: IndexFn<GameServer> =
            Arc::new(|gs: &GameServer| some_node(&gs.status.node_name));
        let pod_node: IndexFn<Pod> = Arc::new(|pod: &Pod| {
            some_node(pod.status.node_name.as_deref().unwrap_or_default())
        });

        Self {
            game_servers: Store::new(
                v(),
                c(),
                vec![by_owner(), by_fleet(), (BY_NODE, gs_node)],
            ),
            game_server_sets: Store::new(v(), c(), vec![by_owner(), by_fleet()]),
            fleets: Store::new(v(), c(), Vec::new()),
            autoscalers: Store::new(v(), c(), Vec::new()),
            allocation_policies: Store::new(v(), c(), Vec::new()),
            pods: Store::new(v(), c(), vec![by_owner(), (BY_NODE, pod_node)]),
            nodes: Store::new(v(), c(), Vec::new()),
            secrets: Store::new(v(), c(), Vec::new()),
            leases: Store::new(v(), c(), Vec::new()),
            events: Store::new(v(), c(), Vec::new()),
            versions,
        }
    }

    /// Last resource version handed out by any store. Unchanged between two
    /// reads means nothing was written in between.
    pub fn version(&self) -> u64 {
        self.versions.current()
    }
}

//! Host port allocator shared by every game server controller worker.
//!
//! Assignments live in each game server's `status.ports`; the in-memory
//! pool is only an index over them, kept per node since a host port need
//! only be unique where the pod runs. [`PortAllocator::rebuild`] replaces
//! the index from the store each time this process starts leading.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fleetplane_api::{GameServer, GameServerState, ObjectKey, Resource};
use fleetplane_events::reasons;
use fleetplane_networking::{NodePorts, PortError, PortRange};
use tracing::{info, warn};

use crate::events::EventRecorder;
use crate::store::{ResourceStore, StoreError};

/// Ports held per game server uid, per node.
pub struct PortAllocator {
    pool: Mutex<NodePorts<String>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self {
            pool: Mutex::new(NodePorts::new(range)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NodePorts<String>> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Track the nodes currently registered. Returns uids whose ports were
    /// forgotten because their node went away.
    pub fn sync_nodes(&self, store: &ResourceStore) -> Vec<String> {
        let names = store.nodes.list().into_iter().map(|n| n.metadata.name);
        self.lock().sync_nodes(names)
    }

    /// Reserve `count` ports for `owner`, all or nothing. Asking again with
    /// the same count returns the same ports.
    pub fn reserve(&self, owner: &str, count: usize) -> Result<Vec<u16>, PortError> {
        self.lock().reserve(&owner.to_string(), count)
    }

    /// Pin `owner`'s `ports` to the node its pod landed on. Returns uids
    /// whose parked reservations had to be dropped to make room.
    pub fn bind(&self, owner: &str, node: &str, ports: &[u16]) -> Result<Vec<String>, PortError> {
        self.lock().bind(&owner.to_string(), node, ports)
    }

    pub fn release(&self, owner: &str) -> Vec<u16> {
        self.lock().release(&owner.to_string())
    }

    pub fn ports_of(&self, owner: &str) -> Vec<u16> {
        self.lock().ports_of(&owner.to_string()).to_vec()
    }

    /// Node holding `owner`'s ports, if any.
    pub fn node_of(&self, owner: &str) -> Option<String> {
        self.lock()
            .node_of(&owner.to_string())
            .map(|(node, _)| node.to_string())
    }

    pub fn range(&self) -> PortRange {
        self.lock().range()
    }

    pub fn available(&self) -> usize {
        self.lock().available()
    }

    pub fn used(&self) -> usize {
        self.lock().used()
    }

    /// Replace the pool with one rebuilt from every non-terminal game
    /// server's recorded ports and node.
    ///
    /// Reserved and allocated servers are replayed first, then the rest,
    /// oldest first within each group. A server whose ports collide with an
    /// earlier one's on the same node, or fall outside the range, is taken
    /// out of circulation.
    pub fn rebuild(
        &self,
        store: &ResourceStore,
        recorder: &EventRecorder,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let range = self.range();
        let servers: Vec<GameServer> = store
            .game_servers
            .list()
            .into_iter()
            .filter(|gs| !gs.state().is_terminating())
            .collect();

        let nodes = store.nodes.list().into_iter().map(|n| n.metadata.name);
        let claims = servers.iter().map(|gs| {
            let age = (
                !gs.state().is_protected(),
                gs.metadata.creation_timestamp,
                gs.metadata.uid.clone(),
            );
            let node = Some(gs.status.node_name.clone()).filter(|n| !n.is_empty());
            (gs.metadata.uid.clone(), age, node, allocator_ports(gs))
        });
        let (pool, rejected) = NodePorts::rebuild(range, nodes, claims);
        info!(
            range = %range,
            used = pool.used(),
            collisions = rejected.len(),
            "Port allocator rebuilt"
        );
        *self.lock() = pool;

        for (uid, error) in rejected {
            let Some(gs) = servers.iter().find(|gs| gs.metadata.uid == uid) else {
                continue;
            };
            warn!(game_server = %gs.key(), error = %error, "Recorded ports rejected on rebuild");
            fail_collider(store, recorder, &gs.key(), &error, now)?;
        }
        Ok(())
    }
}

/// Host ports in `status.ports` that came from the allocator.
pub fn allocator_ports(gs: &GameServer) -> Vec<u16> {
    gs.status
        .ports
        .iter()
        .filter(|sp| {
            gs.spec
                .ports
                .iter()
                .any(|p| p.name == sp.name && p.port_policy.uses_allocator())
        })
        .map(|sp| sp.port)
        .collect()
}

/// Take a server whose recorded ports were refused out of circulation.
///
/// Reserved and allocated servers have players who were handed the old
/// address, so they shut down with `AllocationLost` rather than come back
/// as fresh capacity. Anything else goes to `Error` with its allocator
/// ports cleared and reserves new ones.
fn fail_collider(
    store: &ResourceStore,
    recorder: &EventRecorder,
    key: &ObjectKey,
    error: &PortError,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let message = error.to_string();
    let mut lost = false;
    let stored = store.game_servers.mutate::<StoreError, _>(key, |gs| {
        lost = gs.state().is_protected();
        if lost {
            gs.status.state = GameServerState::Shutdown;
        } else {
            gs.status.state = GameServerState::Error;
            gs.status.ports.retain(|sp| {
                gs.spec
                    .ports
                    .iter()
                    .any(|p| p.name == sp.name && !p.port_policy.uses_allocator())
            });
            gs.status.retry_at = Some(now);
        }
        gs.set_condition(reasons::PORT_COLLISION, message.clone(), now);
        Ok(true)
    })?;
    if let Some(gs) = stored {
        if lost {
            warn!(game_server = %gs.key(), state = %gs.state(), "Game server in use lost its ports");
            recorder.warning(
                &gs,
                reasons::ALLOCATION_LOST,
                format!("Shut down after restart: {message}"),
            );
        }
        recorder.warning(&gs, reasons::PORT_COLLISION, message);
    }
    Ok(())
}

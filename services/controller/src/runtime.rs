//! Pod runtime: the seam between the controllers and whatever runs pods.
//!
//! The controllers only ever ask for a pod to be created or deleted and then
//! observe the pod object in the store. [`SimulatedPodRuntime`] plays the
//! orchestrator's part in standalone mode and in tests: it binds pods to
//! registered nodes and marks them running.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fleetplane_api::{Node, ObjectKey, Pod, PodPhase, SchedulingStrategy};
use fleetplane_reconcile::Clock;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{ResourceStore, StoreError, BY_NODE};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("pod {key} rejected: {reason}")]
    Rejected { key: ObjectKey, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates and deletes pods.
#[async_trait]
pub trait PodRuntime: Send + Sync {
    /// Create a pod. Creating a pod that already exists returns the stored one.
    async fn create_pod(&self, pod: Pod) -> Result<Pod, RuntimeError>;

    /// Delete a pod. Deleting a missing pod is not an error.
    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), RuntimeError>;
}

/// In-process scheduler over the store's `Node` objects.
pub struct SimulatedPodRuntime {
    store: ResourceStore,
    clock: Arc<dyn Clock>,

    /// Reject every create.
    fail_creates: AtomicBool,

    /// Leave new pods pending until [`SimulatedPodRuntime::release_held`].
    hold_unscheduled: AtomicBool,
}

impl SimulatedPodRuntime {
    pub fn new(store: ResourceStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            fail_creates: AtomicBool::new(false),
            hold_unscheduled: AtomicBool::new(false),
        }
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn set_hold_unscheduled(&self, hold: bool) {
        self.hold_unscheduled.store(hold, Ordering::SeqCst);
    }

    /// Stop holding pods and try to bind every pending one.
    pub fn release_held(&self) -> Result<usize, RuntimeError> {
        self.set_hold_unscheduled(false);
        self.schedule_pending()
    }

    /// Bind every pending pod that fits somewhere. Returns how many were
    /// bound.
    pub fn schedule_pending(&self) -> Result<usize, RuntimeError> {
        let mut bound = 0;
        for pod in self.store.pods.list() {
            if pod.status.phase != PodPhase::Pending || pod.status.node_name.is_some() {
                continue;
            }
            if let Some(node) = self.pick_node(&pod) {
                self.bind(&pod.metadata.key(), &node)?;
                bound += 1;
            }
        }
        Ok(bound)
    }

    /// Choose a node for `pod`: schedulable, matching the node selector and
    /// free of host-port conflicts. `Packed` takes the busiest such node and
    /// `Distributed` the idlest; ties go to the lowest name.
    fn pick_node(&self, pod: &Pod) -> Option<Node> {
        let wanted: BTreeSet<u16> = pod.spec.host_ports().collect();
        let mut fits: Vec<(usize, Node)> = self
            .store
            .nodes
            .list()
            .into_iter()
            .filter(|node| !node.spec.unschedulable)
            .filter(|node| {
                pod.spec
                    .node_selector
                    .iter()
                    .all(|(k, v)| node.metadata.label(k) == Some(v.as_str()))
            })
            .filter_map(|node| {
                let residents = self.store.pods.list_index(BY_NODE, &node.metadata.name);
                let conflict = residents
                    .iter()
                    .filter(|p| p.metadata.key() != pod.metadata.key())
                    .flat_map(|p| p.spec.host_ports())
                    .any(|port| wanted.contains(&port));
                (!conflict).then_some((residents.len(), node))
            })
            .collect();

        fits.sort_by(|(la, a), (lb, b)| {
            let load = match pod.spec.scheduling {
                SchedulingStrategy::Packed => lb.cmp(la),
                SchedulingStrategy::Distributed => la.cmp(lb),
            };
            load.then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        fits.into_iter().next().map(|(_, node)| node)
    }

    fn bind(&self, key: &ObjectKey, node: &Node) -> Result<(), RuntimeError> {
        let host_ip = node.public_address().map(str::to_string);
        let node_name = node.metadata.name.clone();
        let now = self.clock.now();
        self.store.pods.mutate::<RuntimeError, _>(key, |pod| {
            if pod.status.node_name.is_some() {
                return Ok(false);
            }
            pod.status.phase = PodPhase::Running;
            pod.status.node_name = Some(node_name.clone());
            pod.status.host_ip = host_ip.clone();
            pod.status.start_time = Some(now);
            Ok(true)
        })?;
        debug!(pod = %key, node = %node_name, "Pod bound");
        Ok(())
    }
}

#[async_trait]
impl PodRuntime for SimulatedPodRuntime {
    async fn create_pod(&self, pod: Pod) -> Result<Pod, RuntimeError> {
        let key = pod.metadata.key();
        if self.fail_creates.load(Ordering::SeqCst) {
            warn!(pod = %key, "Simulated runtime rejecting pod");
            return Err(RuntimeError::Rejected {
                key,
                reason: "runtime configured to reject creates".to_string(),
            });
        }

        let stored = match self.store.pods.create(pod) {
            Ok(stored) => stored,
            Err(StoreError::AlreadyExists { .. }) => {
                return self.store.pods.get(&key).ok_or(RuntimeError::Store(
                    StoreError::NotFound { kind: "Pod", key },
                ));
            }
            Err(e) => return Err(e.into()),
        };
        info!(pod = %key, "Pod created");

        if self.hold_unscheduled.load(Ordering::SeqCst) {
            return Ok(stored);
        }
        match self.pick_node(&stored) {
            Some(node) => {
                self.bind(&key, &node)?;
                Ok(self.store.pods.get(&key).unwrap_or(stored))
            }
            None => {
                debug!(pod = %key, "No node fits, pod stays pending");
                Ok(stored)
            }
        }
    }

    async fn delete_pod(&self, key: &ObjectKey) -> Result<(), RuntimeError> {
        match self.store.pods.delete(key, None) {
            Ok(_) => {
                info!(pod = %key, "Pod deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

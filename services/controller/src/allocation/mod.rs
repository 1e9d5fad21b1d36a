//! Allocation engine.
//!
//! Claims one ready game server per request. The claim is a single
//! compare-and-swap write that moves the server to `Allocated` and applies
//! the requested counter, list and metadata changes together, so two
//! requests can never end up holding the same server. Requests against one
//! fleet are serialised to keep those writes from colliding; the lock is
//! never held across a call to a peer cluster.

mod peer;
mod policy;
mod select;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use fleetplane_api::{
    labels, AllocationPolicy, AllocationSpec, AllocationState, AllocationStatus, GameServer,
    GameServerAllocation, GameServerState, MutationError, ObjectKey, Resource,
};
use fleetplane_events::reasons;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::store::{fleet_index_value, StoreError, BY_FLEET};

pub use peer::{HttpPeerClient, PeerClient, PeerError, PeerTarget, ALLOCATIONS_PATH};
pub use policy::order_policies;
pub use select::{allocated_per_node, order_candidates};

#[derive(Debug, Error)]
pub enum AllocationError {
    /// The request can never succeed as written.
    #[error("allocation rejected: {0}")]
    Rejected(String),

    /// Every peer that could have served the request failed.
    #[error("no cluster could serve the allocation: {0}")]
    Upstream(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AllocationError {
    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::Rejected(_) => "allocation_rejected",
            AllocationError::Upstream(_) => "upstream_failed",
            AllocationError::Store(_) => "store_error",
        }
    }
}

/// Outcome of trying one candidate.
enum Claim {
    Won(GameServer),
    /// Someone else wrote the server first.
    Lost,
    /// The requested mutations do not fit this server.
    Unfit(MutationError),
}

pub struct Allocator {
    ctx: Context,
    peers: Arc<dyn PeerClient>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    rng: StdMutex<StdRng>,
}

impl Allocator {
    pub fn new(ctx: Context, peers: Arc<dyn PeerClient>) -> Self {
        let rng = match ctx.config.allocation.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let recorder = ctx.recorder.for_component("allocator");
        Self {
            ctx: Context { recorder, ..ctx },
            peers,
            locks: StdMutex::new(HashMap::new()),
            rng: StdMutex::new(rng),
        }
    }

    /// Serve one request and return it with its terminal status filled in.
    #[instrument(skip(self, request), fields(namespace = %request.metadata.namespace))]
    pub async fn allocate(
        &self,
        mut request: GameServerAllocation,
    ) -> Result<GameServerAllocation, AllocationError> {
        request
            .spec
            .validate()
            .map_err(AllocationError::Rejected)?;

        let namespace = request.metadata.namespace.clone();
        let status = if request.spec.multi_cluster.enabled {
            self.allocate_multi_cluster(&namespace, &request.spec).await?
        } else {
            self.allocate_local(&namespace, &request.spec).await?
        };
        info!(
            state = ?status.state,
            game_server = %status.game_server_name,
            source = %status.source,
            "Allocation finished"
        );
        request.status = Some(status);
        Ok(request)
    }

    /// Allocate from this cluster only.
    pub async fn allocate_local(
        &self,
        namespace: &str,
        spec: &AllocationSpec,
    ) -> Result<AllocationStatus, AllocationError> {
        let deadline = Instant::now() + self.ctx.config.allocation.timeout();
        let fleet = spec.required.labels.match_labels.get(labels::FLEET);
        let lock_key = match fleet {
            Some(fleet) => fleet_index_value(namespace, fleet),
            None => namespace.to_string(),
        };

        let lock = self.lock_for(&lock_key);
        let Ok(_guard) = tokio::time::timeout_at(deadline, lock.lock()).await else {
            warn!(lock = %lock_key, "Timed out waiting for the allocation lock");
            return Ok(AllocationStatus::contention());
        };

        let budget = self.ctx.config.allocation.retry_budget;
        let mut conflicts = 0;
        loop {
            let pool = match fleet {
                Some(fleet) => self
                    .ctx
                    .store
                    .game_servers
                    .list_index(BY_FLEET, &fleet_index_value(namespace, fleet)),
                None => self.ctx.store.game_servers.list_namespace(namespace),
            };
            let load = allocated_per_node(&pool);
            let candidates = order_candidates(spec, pool, &load);
            if candidates.is_empty() {
                return Ok(AllocationStatus::unallocated());
            }

            let mut unfit = None;
            let mut lost = false;
            for candidate in candidates {
                match self.claim(candidate, spec)? {
                    Claim::Won(gs) => {
                        self.ctx.recorder.normal(
                            &gs,
                            reasons::ALLOCATED,
                            "Allocated by the allocation engine",
                        );
                        return Ok(AllocationStatus::allocated(&gs, &self.ctx.config.cluster_name));
                    }
                    Claim::Unfit(e) => {
                        debug!(error = %e, "Candidate cannot take the requested mutations");
                        unfit = Some(e);
                    }
                    Claim::Lost => {
                        lost = true;
                        break;
                    }
                }
            }

            if !lost {
                // Every candidate was tried and none could take the change.
                return match unfit {
                    Some(e) => Err(AllocationError::Rejected(e.to_string())),
                    None => Ok(AllocationStatus::unallocated()),
                };
            }
            conflicts += 1;
            if conflicts >= budget || Instant::now() >= deadline {
                warn!(conflicts, "Allocation gave up after repeated conflicts");
                return Ok(AllocationStatus::contention());
            }
        }
    }

    /// The lock serialising requests for `key`. Locks that no request holds
    /// or waits on are dropped first, so keys of deleted fleets go away.
    fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks.entry(key.to_string()).or_default().clone()
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// One CAS write: state, reservation and mutations together.
    fn claim(&self, mut gs: GameServer, spec: &AllocationSpec) -> Result<Claim, AllocationError> {
        if let Err(e) = spec.apply_mutations(&mut gs) {
            return Ok(Claim::Unfit(e));
        }
        gs.status.state = GameServerState::Allocated;
        gs.status.reserved_until = None;
        match self.ctx.store.game_servers.update(gs) {
            Ok(stored) => {
                info!(game_server = %stored.key(), "Game server allocated");
                Ok(Claim::Won(stored))
            }
            Err(e) if e.is_conflict() || e.is_not_found() => {
                debug!(error = %e, "Lost the race for a candidate");
                Ok(Claim::Lost)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Walk the matching allocation policies in order until one cluster
    /// allocates.
    async fn allocate_multi_cluster(
        &self,
        namespace: &str,
        spec: &AllocationSpec,
    ) -> Result<AllocationStatus, AllocationError> {
        let selector = &spec.multi_cluster.policy_selector;
        let matching: Vec<AllocationPolicy> = self
            .ctx
            .store
            .allocation_policies
            .list_namespace(namespace)
            .into_iter()
            .filter(|p| selector.matches(&p.metadata.labels))
            .collect();
        if matching.is_empty() {
            return Err(AllocationError::Rejected(
                "no allocation policy matches the policy selector".to_string(),
            ));
        }
        let ordered = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            order_policies(matching, &mut *rng)
        };

        let mut forwarded = spec.clone();
        forwarded.multi_cluster.enabled = false;

        let mut failures = Vec::new();
        for policy in &ordered {
            let info = &policy.spec.connection_info;
            let status = if info.cluster_name == self.ctx.config.cluster_name {
                self.allocate_local(&info.namespace, &forwarded).await?
            } else {
                match self.forward(policy, &forwarded).await {
                    Ok(status) => status,
                    Err(PeerError::Rejected { body, .. }) => {
                        return Err(AllocationError::Rejected(body));
                    }
                    Err(e) => {
                        warn!(policy = %policy.metadata.name, error = %e, "Peer cluster failed");
                        failures.push(e.to_string());
                        continue;
                    }
                }
            };
            if status.state == AllocationState::Allocated {
                return Ok(status);
            }
            debug!(
                policy = %policy.metadata.name,
                cluster = %info.cluster_name,
                state = ?status.state,
                "Cluster had nothing to allocate"
            );
        }

        if failures.len() == ordered.len() {
            return Err(AllocationError::Upstream(failures.join("; ")));
        }
        Ok(AllocationStatus::unallocated())
    }

    /// Try each endpoint of a peer policy, retrying transient failures.
    async fn forward(
        &self,
        policy: &AllocationPolicy,
        spec: &AllocationSpec,
    ) -> Result<AllocationStatus, PeerError> {
        let info = &policy.spec.connection_info;
        let credentials = if info.secret_name.is_empty() {
            None
        } else {
            let key = ObjectKey::new(&policy.metadata.namespace, &info.secret_name);
            match self.ctx.store.secrets.get(&key) {
                Some(secret) => Some(secret),
                None => {
                    return Err(PeerError::Credentials {
                        cluster: info.cluster_name.clone(),
                        reason: format!("secret {key} not found"),
                    })
                }
            }
        };
        let request = GameServerAllocation::new(&info.namespace, spec.clone());
        let attempts = self.ctx.config.allocation.peer_retries.max(1);

        let mut last = PeerError::Transport {
            endpoint: String::new(),
            reason: format!("policy {} lists no endpoints", policy.metadata.name),
        };
        for endpoint in &info.allocation_endpoints {
            let target = PeerTarget {
                cluster: info.cluster_name.clone(),
                endpoint: endpoint.clone(),
                credentials: credentials.clone(),
                server_ca: info.server_ca.clone(),
            };
            for attempt in 1..=attempts {
                match self.peers.allocate(&target, &request).await {
                    Ok(status) => {
                        let mut status = status;
                        if status.source.is_empty() {
                            status.source = info.cluster_name.clone();
                        }
                        return Ok(status);
                    }
                    Err(e) if e.is_retryable() => {
                        debug!(endpoint = %endpoint, attempt, error = %e, "Peer attempt failed");
                        last = e;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use async_trait::async_trait;
    use fleetplane_api::GameServerSelector;
    use fleetplane_testing::{allocation_policy, GameServerBuilder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoPeers;

    #[async_trait]
    impl PeerClient for NoPeers {
        async fn allocate(
            &self,
            target: &PeerTarget,
            _request: &GameServerAllocation,
        ) -> Result<AllocationStatus, PeerError> {
            Err(PeerError::Transport {
                endpoint: target.endpoint.clone(),
                reason: "unreachable".into(),
            })
        }
    }

    /// Fails transiently `failures` times, then allocates.
    struct FlakyPeer {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerClient for FlakyPeer {
        async fn allocate(
            &self,
            target: &PeerTarget,
            _request: &GameServerAllocation,
        ) -> Result<AllocationStatus, PeerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(PeerError::Transport {
                    endpoint: target.endpoint.clone(),
                    reason: "reset".into(),
                });
            }
            let gs = GameServerBuilder::new("remote-1").ready_on("peer-node").build();
            Ok(AllocationStatus::allocated(&gs, ""))
        }
    }

    fn request(app: &str) -> GameServerAllocation {
        GameServerAllocation::new(
            "default",
            AllocationSpec {
                required: GameServerSelector::with_labels([("app", app)]),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_allocates_and_applies_metadata() {
        let ctx = test_context();
        ctx.store
            .game_servers
            .create(GameServerBuilder::new("gs-1").ready_on("n1").label("app", "f").build())
            .unwrap();
        let allocator = Allocator::new(ctx.clone(), Arc::new(NoPeers));

        let mut req = request("f");
        req.spec.metadata.labels.insert("match".into(), "m-1".into());
        let done = allocator.allocate(req).await.unwrap();
        let status = done.status.unwrap();
        assert_eq!(status.state, AllocationState::Allocated);
        assert_eq!(status.game_server_name, "gs-1");
        assert_eq!(status.source, "local");

        let gs = ctx
            .store
            .game_servers
            .get(&ObjectKey::new("default", "gs-1"))
            .unwrap();
        assert_eq!(gs.state(), GameServerState::Allocated);
        assert_eq!(gs.metadata.label("match"), Some("m-1"));

        let again = allocator.allocate(request("f")).await.unwrap();
        assert_eq!(again.status.unwrap().state, AllocationState::UnAllocated);
    }

    #[tokio::test]
    async fn test_fleet_locks_do_not_outlive_requests() {
        let allocator = Allocator::new(test_context(), Arc::new(NoPeers));
        for fleet in ["gone-1", "gone-2", "gone-3"] {
            let mut req = request(fleet);
            req.spec
                .required
                .labels
                .match_labels
                .insert(labels::FLEET.to_string(), fleet.to_string());
            allocator.allocate(req).await.unwrap();
        }
        assert_eq!(allocator.lock_count(), 1);

        let held = allocator.lock_for("default/busy");
        let _other = allocator.lock_for("default/other");
        assert_eq!(allocator.lock_count(), 2);
        assert!(Arc::ptr_eq(&held, &allocator.lock_for("default/busy")));
    }

    #[tokio::test]
    async fn test_contradictory_selector_is_rejected() {
        let allocator = Allocator::new(test_context(), Arc::new(NoPeers));
        let mut req = request("f");
        req.spec.required.game_server_state = Some(GameServerState::Creating);
        assert!(matches!(
            allocator.allocate(req).await,
            Err(AllocationError::Rejected(_))
        ));
    }

    #[rstest::rstest]
    #[case::one_past_capacity(1)]
    #[case::largest_amount(i64::MAX)]
    #[tokio::test]
    async fn test_mutation_that_fits_nowhere_is_rejected(#[case] amount: i64) {
        let ctx = test_context();
        ctx.store
            .game_servers
            .create(
                GameServerBuilder::new("gs-1")
                    .ready_on("n1")
                    .label("app", "f")
                    .counter("rooms", 1, 1)
                    .build(),
            )
            .unwrap();
        let allocator = Allocator::new(ctx.clone(), Arc::new(NoPeers));
        let mut req = request("f");
        req.spec.counters.insert(
            "rooms".into(),
            fleetplane_api::CounterAction {
                action: Some(fleetplane_api::CounterOp::Increment),
                amount: Some(amount),
                capacity: None,
            },
        );
        assert!(matches!(
            allocator.allocate(req).await,
            Err(AllocationError::Rejected(_))
        ));
        let gs = ctx.store.game_servers.get(&ObjectKey::new("default", "gs-1")).unwrap();
        assert_eq!(gs.state(), GameServerState::Ready);
        assert_eq!(gs.status.counters["rooms"].count, 1);
    }

    #[tokio::test]
    async fn test_peer_retries_transient_failures() {
        let ctx = test_context();
        ctx.store
            .allocation_policies
            .create(allocation_policy("remote", "eu", 1, 1, Some("peer:443")))
            .unwrap();
        let peer = Arc::new(FlakyPeer {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let allocator = Allocator::new(ctx, peer.clone());

        let mut req = request("f");
        req.spec.multi_cluster.enabled = true;
        let status = allocator.allocate(req).await.unwrap().status.unwrap();
        assert_eq!(status.state, AllocationState::Allocated);
        assert_eq!(status.source, "eu");
        assert_eq!(peer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_all_peers_down_is_upstream_error() {
        let ctx = test_context();
        ctx.store
            .allocation_policies
            .create(allocation_policy("remote", "eu", 1, 1, Some("peer:443")))
            .unwrap();
        let allocator = Allocator::new(ctx, Arc::new(NoPeers));
        let mut req = request("f");
        req.spec.multi_cluster.enabled = true;
        assert!(matches!(
            allocator.allocate(req).await,
            Err(AllocationError::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_secret_skips_policy() {
        let ctx = test_context();
        let mut remote = allocation_policy("remote", "eu", 1, 1, Some("peer:443"));
        remote.spec.connection_info.secret_name = "eu-creds".into();
        ctx.store.allocation_policies.create(remote).unwrap();
        ctx.store
            .allocation_policies
            .create(allocation_policy("home", "local", 2, 1, None))
            .unwrap();
        ctx.store
            .game_servers
            .create(GameServerBuilder::new("gs-1").ready_on("n1").label("app", "f").build())
            .unwrap();
        let allocator = Allocator::new(ctx, Arc::new(NoPeers));

        let mut req = request("f");
        req.spec.multi_cluster.enabled = true;
        let status = allocator.allocate(req).await.unwrap().status.unwrap();
        assert_eq!(status.state, AllocationState::Allocated);
        assert_eq!(status.source, "local");
    }
}

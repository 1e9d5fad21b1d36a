//! Controller manager: wires store watches to work queues and runs every
//! controller's workers.
//!
//! Each change is routed to the key whose reconcile owns the decision: a pod
//! to its game server, a game server to itself, its set and its fleet, a set
//! to itself and its fleet, a fleet to itself and its autoscalers. A lagging
//! watch and a periodic timer both fall back to a full resync.

use std::future::Future;
use std::sync::Arc;

use fleetplane_api::{
    labels, Fleet, FleetAutoscaler, GameServer, GameServerSet, Node, ObjectKey, ObjectMeta, Pod,
    Resource,
};
use fleetplane_reconcile::{run_workers, BackoffPolicy, WorkQueue};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::autoscaler::{autoscalers_for, FleetAutoscalerController, KickLimiter};
use crate::context::Context;
use crate::fleets::FleetController;
use crate::gameservers::GameServerController;
use crate::gameserversets::GameServerSetController;
use crate::runtime::SimulatedPodRuntime;
use crate::store::{ResourceStore, WatchEvent};

/// One work queue per controller.
#[derive(Clone)]
pub struct Queues {
    pub game_servers: WorkQueue<ObjectKey>,
    pub game_server_sets: WorkQueue<ObjectKey>,
    pub fleets: WorkQueue<ObjectKey>,
    pub autoscalers: WorkQueue<ObjectKey>,
}

impl Default for Queues {
    fn default() -> Self {
        Self {
            game_servers: WorkQueue::new("gameservers", BackoffPolicy::default()),
            game_server_sets: WorkQueue::new("gameserversets", BackoffPolicy::default()),
            fleets: WorkQueue::new("fleets", BackoffPolicy::default()),
            autoscalers: WorkQueue::new("fleetautoscalers", BackoffPolicy::default()),
        }
    }
}

impl Queues {
    /// Enqueue every stored object.
    pub fn resync(&self, store: &ResourceStore) {
        for key in store.game_servers.keys() {
            self.game_servers.add(key);
        }
        for key in store.game_server_sets.keys() {
            self.game_server_sets.add(key);
        }
        for key in store.fleets.keys() {
            self.fleets.add(key);
        }
        for key in store.autoscalers.keys() {
            self.autoscalers.add(key);
        }
    }

    fn owner_of(&self, meta: &ObjectMeta, kind: &str) -> Option<ObjectKey> {
        meta.owner
            .as_ref()
            .filter(|owner| owner.kind == kind)
            .map(|owner| ObjectKey::new(&meta.namespace, &owner.name))
    }

    fn on_pod(&self, pod: &Pod) {
        let name = pod
            .metadata
            .label(labels::GAME_SERVER)
            .unwrap_or(&pod.metadata.name);
        self.game_servers
            .add(ObjectKey::new(&pod.metadata.namespace, name));
    }

    fn on_game_server(&self, gs: &GameServer) {
        self.game_servers.add(gs.key());
        if let Some(set) = self.owner_of(&gs.metadata, GameServerSet::KIND) {
            self.game_server_sets.add(set);
        }
        if let Some(fleet) = gs.metadata.label(labels::FLEET) {
            self.fleets.add(ObjectKey::new(&gs.metadata.namespace, fleet));
        }
    }

    fn on_game_server_set(&self, set: &GameServerSet) {
        self.game_server_sets.add(set.key());
        if let Some(fleet) = self.owner_of(&set.metadata, Fleet::KIND) {
            self.fleets.add(fleet);
        }
    }
}

pub struct Manager {
    ctx: Context,
    queues: Queues,
    kicks: Arc<KickLimiter>,
    scheduler: Option<Arc<SimulatedPodRuntime>>,
}

impl Manager {
    /// `scheduler` is the in-process runtime, if any; pending pods are
    /// retried on it whenever a node changes.
    pub fn new(ctx: Context, scheduler: Option<Arc<SimulatedPodRuntime>>) -> Self {
        let kicks = Arc::new(KickLimiter::new(
            ctx.config.autoscaler.min_kick_interval(),
        ));
        Self {
            ctx,
            queues: Queues::default(),
            kicks,
            scheduler,
        }
    }

    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Run until `shutdown` flips, then drain every queue within the
    /// configured grace period.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let store = self.ctx.store.clone();
        let config = self.ctx.config.clone();
        let grace = config.shutdown_grace();
        let mut watchers = JoinSet::new();

        let queues = self.queues.clone();
        watchers.spawn(watch_kind(
            store.pods.watch(),
            shutdown.clone(),
            self.resyncer(),
            move |ev: &WatchEvent<Pod>| queues.on_pod(ev.object()),
        ));

        let queues = self.queues.clone();
        watchers.spawn(watch_kind(
            store.game_servers.watch(),
            shutdown.clone(),
            self.resyncer(),
            move |ev: &WatchEvent<GameServer>| queues.on_game_server(ev.object()),
        ));

        let queues = self.queues.clone();
        watchers.spawn(watch_kind(
            store.game_server_sets.watch(),
            shutdown.clone(),
            self.resyncer(),
            move |ev: &WatchEvent<GameServerSet>| queues.on_game_server_set(ev.object()),
        ));

        let queues = self.queues.clone();
        let kicks = self.kicks.clone();
        let fleet_store = store.clone();
        watchers.spawn(watch_kind(
            store.fleets.watch(),
            shutdown.clone(),
            self.resyncer(),
            move |ev: &WatchEvent<Fleet>| {
                let key = ev.object().key();
                queues.fleets.add(key.clone());
                for autoscaler in autoscalers_for(&fleet_store, &key) {
                    if kicks.admit(&autoscaler) {
                        queues.autoscalers.add(autoscaler);
                    }
                }
            },
        ));

        let queues = self.queues.clone();
        let kicks = self.kicks.clone();
        watchers.spawn(watch_kind(
            store.autoscalers.watch(),
            shutdown.clone(),
            self.resyncer(),
            move |ev: &WatchEvent<FleetAutoscaler>| {
                let key = ev.object().key();
                if let WatchEvent::Deleted(_) = ev {
                    kicks.forget(&key);
                }
                queues.autoscalers.add(key);
            },
        ));

        if let Some(scheduler) = self.scheduler.clone() {
            watchers.spawn(watch_kind(
                store.nodes.watch(),
                shutdown.clone(),
                self.resyncer(),
                move |ev: &WatchEvent<Node>| {
                    let WatchEvent::Applied(node) = ev else {
                        return;
                    };
                    match scheduler.schedule_pending() {
                        Ok(0) => {}
                        Ok(bound) => {
                            info!(node = %node.metadata.name, bound, "Scheduled pending pods")
                        }
                        Err(e) => warn!(error = %e, "Scheduling pending pods failed"),
                    }
                },
            ));
        }

        watchers.spawn(resync_timer(
            self.queues.clone(),
            store.clone(),
            config.resync_interval(),
            shutdown.clone(),
        ));

        self.queues.resync(&store);
        info!("Controller manager started");

        let workers = config.workers;
        tokio::join!(
            run_workers(
                Arc::new(GameServerController::new(self.ctx.clone())),
                self.queues.game_servers.clone(),
                workers.game_servers,
                shutdown.clone(),
                grace,
            ),
            run_workers(
                Arc::new(GameServerSetController::new(self.ctx.clone())),
                self.queues.game_server_sets.clone(),
                workers.game_server_sets,
                shutdown.clone(),
                grace,
            ),
            run_workers(
                Arc::new(FleetController::new(self.ctx.clone())),
                self.queues.fleets.clone(),
                workers.fleets,
                shutdown.clone(),
                grace,
            ),
            run_workers(
                Arc::new(FleetAutoscalerController::new(self.ctx.clone())),
                self.queues.autoscalers.clone(),
                workers.autoscalers,
                shutdown.clone(),
                grace,
            ),
        );

        watchers.abort_all();
        while watchers.join_next().await.is_some() {}
        info!("Controller manager stopped");
    }

    fn resyncer(&self) -> impl Fn() + Send + 'static {
        let queues = self.queues.clone();
        let store = self.ctx.store.clone();
        move || queues.resync(&store)
    }
}

/// Forward one kind's changes to `route` until shutdown. A lagged receiver
/// has missed changes, so everything is resynced.
fn watch_kind<T, R, S>(
    mut changes: broadcast::Receiver<WatchEvent<T>>,
    mut shutdown: watch::Receiver<bool>,
    resync: S,
    route: R,
) -> impl Future<Output = ()> + Send + 'static
where
    T: Resource,
    R: Fn(&WatchEvent<T>) + Send + 'static,
    S: Fn() + Send + 'static,
{
    async move {
        loop {
            tokio::select! {
                received = changes.recv() => match received {
                    Ok(event) => route(&event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(kind = T::KIND, missed, "Watch lagged, resyncing");
                        resync();
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

async fn resync_timer(
    queues: Queues,
    store: ResourceStore,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires at once; the manager resyncs on start anyway.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!("Periodic resync");
                queues.resync(&store);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use fleetplane_testing::{fleet, set_for, GameServerBuilder};

    #[test]
    fn test_game_server_routes_to_owners() {
        let queues = Queues::default();
        let f = fleet("f", 1);
        let set = fleetplane_testing::with_uid(set_for(&f, "f-abc", 1));
        let gs = GameServerBuilder::new("f-abc-x1")
            .owned_by(&set)
            .label(labels::FLEET, "f")
            .build();

        queues.on_game_server(&gs);
        assert_eq!(queues.game_servers.len(), 1);
        assert_eq!(queues.game_server_sets.len(), 1);
        assert_eq!(queues.fleets.len(), 1);
        assert_eq!(queues.autoscalers.len(), 0);
    }

    #[tokio::test]
    async fn test_resync_enqueues_everything() {
        let ctx = test_context();
        ctx.store.fleets.create(fleet("a", 1)).unwrap();
        ctx.store.fleets.create(fleet("b", 1)).unwrap();
        ctx.store
            .game_servers
            .create(GameServerBuilder::new("solo").build())
            .unwrap();
        let queues = Queues::default();
        queues.resync(&ctx.store);
        assert_eq!(queues.fleets.len(), 2);
        assert_eq!(queues.game_servers.len(), 1);
    }

    #[tokio::test]
    async fn test_manager_stops_on_shutdown() {
        let ctx = test_context();
        ctx.store.fleets.create(fleet("f", 2)).unwrap();
        let manager = Manager::new(ctx.clone(), None);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(manager.run(rx));

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(15), handle)
            .await
            .unwrap()
            .unwrap();
        // The fleet controller ran and created the first set.
        assert_eq!(ctx.store.game_server_sets.len(), 1);
    }
}

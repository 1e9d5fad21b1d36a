//! Game server set controller.
//!
//! Keeps the number of up game servers owned by a set at the set's
//! replicas, then rolls their states into the set status.

mod scale;

use async_trait::async_trait;
use fleetplane_api::{
    labels, GameServer, GameServerSet, GameServerState, Health, ObjectKey, ObjectMeta,
    OwnerReference, ReplicaStatus, Resource,
};
use fleetplane_events::reasons;
use fleetplane_reconcile::{Action, Reconciler};
use rand::distr::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, instrument, warn};

use crate::context::Context;
use crate::error::{ControllerError, Result};
use crate::store::{StoreError, BY_OWNER};

pub use scale::{plan_scale, ScalePlan, MAX_CREATIONS_PER_PASS};

/// Length of the random suffix on generated game server names.
const NAME_SUFFIX_LEN: usize = 5;

pub struct GameServerSetController {
    ctx: Context,
}

impl GameServerSetController {
    pub fn new(ctx: Context) -> Self {
        let recorder = ctx.recorder.for_component("gameserverset-controller");
        Self {
            ctx: Context { recorder, ..ctx },
        }
    }

    /// A new, unstored game server for `set`.
    fn new_game_server(&self, set: &GameServerSet) -> GameServer {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(NAME_SUFFIX_LEN)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        let mut metadata = ObjectMeta::named(
            &set.metadata.namespace,
            format!("{}-{suffix}", set.metadata.name),
        )
        .with_label(labels::GAME_SERVER_SET, &set.metadata.name);
        if let Some(fleet) = set.metadata.label(labels::FLEET) {
            metadata.labels.insert(labels::FLEET.into(), fleet.into());
        }
        if let Some(revision) = set.revision() {
            metadata.labels.insert(labels::REVISION.into(), revision.into());
        }
        metadata.owner = Some(OwnerReference::of(set));

        let mut gs = GameServer::from_template(metadata, &set.spec.template);
        gs.spec.scheduling = set.spec.scheduling;
        if gs.spec.health == Health::default() {
            let defaults = &self.ctx.config.health_check;
            gs.spec.health.initial_delay_seconds = defaults.initial_delay_secs;
            gs.spec.health.period_seconds = defaults.period_secs;
            gs.spec.health.failure_threshold = defaults.failure_threshold;
        }
        gs
    }

    fn create(&self, set: &GameServerSet, count: u32) -> Result<()> {
        for _ in 0..count {
            let gs = self.new_game_server(set);
            let created = match self.ctx.store.game_servers.create(gs) {
                Ok(gs) => gs,
                // Name clash on the random suffix; the next pass tries again.
                Err(StoreError::AlreadyExists { .. }) => continue,
                Err(e) => return Err(e.into()),
            };
            debug!(game_server = %created.key(), "Game server created");
            self.ctx.recorder.normal(
                set,
                reasons::SUCCESSFUL_CREATE,
                format!("Created game server: {}", created.metadata.name),
            );
        }
        Ok(())
    }

    /// Move surplus servers to `Shutdown`. A server that became allocated or
    /// reserved since it was picked is left alone.
    fn delete(&self, set: &GameServerSet, victims: Vec<GameServer>) -> Result<usize> {
        let mut deleted = 0;
        for victim in victims {
            let key = victim.key();
            let stored = self
                .ctx
                .store
                .game_servers
                .mutate::<ControllerError, _>(&key, |gs| {
                    let state = gs.state();
                    if state.is_protected() || !state.is_up() {
                        return Ok(false);
                    }
                    gs.status.state = GameServerState::Shutdown;
                    Ok(true)
                })?;
            match stored {
                Some(gs) if gs.state() == GameServerState::Shutdown => {
                    deleted += 1;
                    self.ctx.recorder.normal(
                        set,
                        reasons::SUCCESSFUL_DELETE,
                        format!("Deleted game server: {}", gs.metadata.name),
                    );
                }
                Some(gs) => {
                    debug!(game_server = %key, state = %gs.state(), "Skipped deletion")
                }
                None => {}
            }
        }
        Ok(deleted)
    }

    fn update_status(&self, set: &GameServerSet, status: ReplicaStatus) -> Result<()> {
        if set.status == status {
            return Ok(());
        }
        self.ctx
            .store
            .game_server_sets
            .mutate::<ControllerError, _>(&set.key(), |current| {
                if current.status == status {
                    return Ok(false);
                }
                current.status = status.clone();
                Ok(true)
            })?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for GameServerSetController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &'static str {
        "gameserverset"
    }

    #[instrument(skip(self), fields(game_server_set = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(set) = self.ctx.store.game_server_sets.get(key) else {
            return Ok(Action::await_change());
        };
        let owned = self
            .ctx
            .store
            .game_servers
            .list_index(BY_OWNER, &set.metadata.uid);

        let plan = plan_scale(&set, &owned);
        if plan.create > 0 {
            info!(
                desired = set.spec.replicas,
                creating = plan.create,
                "Scaling up"
            );
            self.create(&set, plan.create)?;
        }
        if !plan.delete.is_empty() {
            let picked = plan.delete.len();
            let deleted = self.delete(&set, plan.delete)?;
            info!(desired = set.spec.replicas, picked, deleted, "Scaling down");
            if deleted < picked {
                warn!(skipped = picked - deleted, "Some surplus game servers changed state");
            }
        }

        // Counted from what was read, so the status trails this pass by one;
        // the writes above trigger the pass that catches up.
        let status = ReplicaStatus::from_game_servers(&owned);
        self.update_status(&set, status)?;

        if plan.more {
            return Ok(Action::requeue(std::time::Duration::ZERO));
        }
        Ok(Action::await_change())
    }
}

//! Fleet controller.
//!
//! A fleet owns one active set, the one whose revision label matches the
//! digest of the fleet's current template, plus any inactive sets left from
//! earlier templates. Each pass recomputes replica targets for all of them,
//! prunes inactive sets that have emptied, and rolls the live population up
//! into the fleet status.

mod strategy;

use async_trait::async_trait;
use fleetplane_api::{
    labels, Fleet, GameServerSet, GameServerSetSpec, ObjectKey, ObjectMeta, OwnerReference,
    ReplicaStatus, Resource,
};
use fleetplane_events::reasons;
use fleetplane_reconcile::{Action, Reconciler, SpecHash};
use tracing::{debug, info, instrument};

use crate::context::Context;
use crate::error::{ControllerError, Result};
use crate::store::{fleet_index_value, BY_FLEET, BY_OWNER};

pub use strategy::{rolling_budgets, targets, SetView};

/// Revision identity of a fleet's template.
pub fn revision_of(fleet: &Fleet) -> Result<SpecHash> {
    Ok(SpecHash::of(&fleet.spec.template)?)
}

pub struct FleetController {
    ctx: Context,
}

impl FleetController {
    pub fn new(ctx: Context) -> Self {
        let recorder = ctx.recorder.for_component("fleet-controller");
        Self {
            ctx: Context { recorder, ..ctx },
        }
    }

    /// Sets filed under the fleet, with their live populations.
    fn views(&self, key: &ObjectKey) -> Vec<SetView> {
        let mut sets = self
            .ctx
            .store
            .game_server_sets
            .list_index(BY_FLEET, &fleet_index_value(&key.namespace, &key.name));
        sets.sort_by(|a, b| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });
        sets.into_iter()
            .map(|set| {
                let owned = self
                    .ctx
                    .store
                    .game_servers
                    .list_index(BY_OWNER, &set.metadata.uid);
                SetView {
                    status: ReplicaStatus::from_game_servers(&owned),
                    set,
                }
            })
            .collect()
    }

    fn create_set(&self, fleet: &Fleet, revision: &SpecHash, replicas: u32) -> Result<GameServerSet> {
        let mut metadata = ObjectMeta::named(
            &fleet.metadata.namespace,
            format!("{}-{}", fleet.metadata.name, revision.short()),
        )
        .with_label(labels::FLEET, &fleet.metadata.name)
        .with_label(labels::REVISION, revision.as_str());
        metadata.owner = Some(OwnerReference::of(fleet));

        let set = self.ctx.store.game_server_sets.create(GameServerSet {
            metadata,
            spec: GameServerSetSpec {
                replicas,
                scheduling: fleet.spec.scheduling,
                template: fleet.spec.template.clone(),
            },
            status: ReplicaStatus::default(),
        })?;
        info!(
            fleet = %fleet.key(),
            game_server_set = %set.metadata.name,
            revision = %revision.short(),
            replicas,
            "Created game server set"
        );
        self.ctx.recorder.normal(
            fleet,
            reasons::CREATING_GAME_SERVER_SET,
            format!("Created game server set {}", set.metadata.name),
        );
        Ok(set)
    }

    /// Write a new replica target (and the fleet's scheduling) to a set.
    fn scale_set(&self, fleet: &Fleet, set: &GameServerSet, replicas: u32) -> Result<()> {
        if set.spec.replicas == replicas && set.spec.scheduling == fleet.spec.scheduling {
            return Ok(());
        }
        let from = set.spec.replicas;
        self.ctx
            .store
            .game_server_sets
            .mutate::<ControllerError, _>(&set.key(), |current| {
                if current.spec.replicas == replicas
                    && current.spec.scheduling == fleet.spec.scheduling
                {
                    return Ok(false);
                }
                current.spec.replicas = replicas;
                current.spec.scheduling = fleet.spec.scheduling;
                Ok(true)
            })?;
        if from != replicas {
            info!(
                fleet = %fleet.key(),
                game_server_set = %set.metadata.name,
                from,
                to = replicas,
                "Scaling game server set"
            );
            self.ctx.recorder.normal(
                fleet,
                reasons::SCALING_GAME_SERVER_SET,
                format!(
                    "Scaling game server set {} from {from} to {replicas}",
                    set.metadata.name
                ),
            );
        }
        Ok(())
    }

    fn delete_set(&self, fleet: Option<&Fleet>, set: &GameServerSet) -> Result<()> {
        match self
            .ctx
            .store
            .game_server_sets
            .delete(&set.key(), Some(set.metadata.resource_version))
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        info!(game_server_set = %set.key(), "Deleted drained game server set");
        if let Some(fleet) = fleet {
            self.ctx.recorder.normal(
                fleet,
                reasons::DELETING_GAME_SERVER_SET,
                format!("Deleting inactive game server set {}", set.metadata.name),
            );
        }
        Ok(())
    }

    /// Scale every set of a deleted fleet to zero and remove each once its
    /// servers are gone.
    fn cascade(&self, key: &ObjectKey) -> Result<Action> {
        for view in self.views(key) {
            if view.status.replicas == 0 {
                self.delete_set(None, &view.set)?;
            } else if view.set.spec.replicas != 0 {
                self.ctx
                    .store
                    .game_server_sets
                    .mutate::<ControllerError, _>(&view.set.key(), |set| {
                        let changed = set.spec.replicas != 0;
                        set.spec.replicas = 0;
                        Ok(changed)
                    })?;
            }
        }
        Ok(Action::await_change())
    }

    fn update_status(&self, fleet: &Fleet, status: ReplicaStatus) -> Result<()> {
        if fleet.status == status {
            return Ok(());
        }
        self.ctx
            .store
            .fleets
            .mutate::<ControllerError, _>(&fleet.key(), |current| {
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
impl Reconciler for FleetController {
    type Key = ObjectKey;
    type Error = ControllerError;

    fn name(&self) -> &'static str {
        "fleet"
    }

    #[instrument(skip(self), fields(fleet = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(fleet) = self.ctx.store.fleets.get(key) else {
            return self.cascade(key);
        };
        let revision = revision_of(&fleet)?;

        let mut views: Vec<SetView> = self
            .views(key)
            .into_iter()
            .filter(|v| v.set.metadata.is_owned_by(&fleet.metadata.uid))
            .collect();

        let Some(position) = views
            .iter()
            .position(|v| v.set.revision() == Some(revision.as_str()))
        else {
            // New template. The first set starts at full size; a replacement
            // starts empty and grows through the rollout.
            let replicas = if views.is_empty() {
                fleet.spec.replicas
            } else {
                0
            };
            self.create_set(&fleet, &revision, replicas)?;
            return Ok(Action::await_change());
        };
        let active = views.remove(position);

        let plan = targets(&fleet, &self.ctx.config.rolling_update, &active, &views);
        debug!(
            revision = %revision.short(),
            active = plan.active_replicas,
            rest = ?plan.rest_replicas,
            "Planned replica targets"
        );

        self.scale_set(&fleet, &active.set, plan.active_replicas)?;
        for (view, replicas) in views.iter().zip(&plan.rest_replicas) {
            if view.status.replicas == 0 && *replicas == 0 {
                self.delete_set(Some(&fleet), &view.set)?;
            } else {
                self.scale_set(&fleet, &view.set, *replicas)?;
            }
        }

        let mut status = active.status.clone();
        for view in &views {
            status.absorb(&view.status);
        }
        self.update_status(&fleet, status)?;
        Ok(Action::await_change())
    }
}
